//! ## Licklider Transmission Protocol (LTP) engine
//!
//! [RFC5326]: https://tools.ietf.org/html/rfc5326
//!
//! The engine owns every active sending and receiving session, routes
//! inbound segments to them, arbitrates their outbound packets, and runs
//! the retransmission timers whose duration is derived from the one-way
//! light time of the link. It is a single-threaded state machine: one
//! event loop feeds it datagrams, timer polls and transmission requests,
//! and drains its outbound packets. Notices to the client service are
//! delivered through the [`EngineHandler`] trait.

pub mod fragment;
pub mod random;
pub mod rate;
pub mod recreation;
pub mod timer;

mod receiver;
mod sender;

pub use codec::{SessionId, segment::CancelReason};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use codec::{
    parser::{Parser, SegmentSink},
    segment::{self, DataSegment, ReportSegment, Segment, SegmentBody},
};

use self::{
    random::RandomNumberGenerator,
    rate::TokenRateLimiter,
    receiver::{ReceiverContext, SessionReceiver, read_report_timer_data},
    recreation::SessionRecreationPreventer,
    sender::{SenderContext, SessionSender},
    timer::{TimerManager, UserDataRecycler},
};

/// How often [`Engine::housekeeping`] is expected to be driven.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

const USER_DATA_RECYCLER_CAPACITY: usize = 1000;

/// Construction parameters of one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// This engine's id, the session originator of every sending session.
    pub this_engine_id: u64,
    /// Engine index in `[1, 7]`, encoded into the top of every random
    /// session number.
    pub engine_index: u8,
    /// Largest client service data payload per data segment.
    pub mtu_client_service_data: u64,
    /// Largest number of reception claims per report segment; reports
    /// needing more are split.
    pub max_reception_claims: u64,
    pub one_way_light_time: Duration,
    pub one_way_margin_time: Duration,
    /// Capacity hint for the red-part reassembly buffer.
    pub estimated_bytes_to_receive_per_session: u64,
    /// Hard cap on buffered red bytes per reception session.
    pub max_red_rx_bytes_per_session: u64,
    /// Mark every Nth first-pass red segment as a discretionary
    /// checkpoint; zero disables them.
    pub checkpoint_every_nth_data_packet: u64,
    /// Retransmissions allowed per serial number before the session is
    /// cancelled with RLEXC.
    pub max_retries_per_serial_number: u32,
    pub force_32_bit_random_numbers: bool,
    /// Outbound rate cap in bits per second; zero disables rate limiting.
    pub max_send_rate_bits_per_sec: u64,
    /// Cap on concurrently active reception sessions.
    pub max_simultaneous_sessions: u64,
    /// Closed session numbers remembered per remote engine to refuse
    /// session resurrection; zero disables the history.
    pub session_recreation_preventer_history_size: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            this_engine_id: 1,
            engine_index: 1,
            mtu_client_service_data: 1360,
            max_reception_claims: 600,
            one_way_light_time: Duration::from_secs(1),
            one_way_margin_time: Duration::from_millis(200),
            estimated_bytes_to_receive_per_session: 4096,
            max_red_rx_bytes_per_session: 100 * 1024 * 1024,
            checkpoint_every_nth_data_packet: 0,
            max_retries_per_serial_number: 5,
            force_32_bit_random_numbers: false,
            max_send_rate_bits_per_sec: 0,
            max_simultaneous_sessions: 5000,
            session_recreation_preventer_history_size: 1000,
        }
    }
}

/// Notices delivered to the client service.
///
/// All methods default to doing nothing, so a handler implements only the
/// notices it cares about. Handlers are called from whatever task drives
/// the engine, never concurrently.
pub trait EngineHandler {
    /// A session came into existence: at the sender when a transmission
    /// request is accepted, at the receiver on the first data segment of a
    /// new session id.
    #[allow(unused_variables)]
    fn on_session_start(&self, session_id: &SessionId) {}

    /// The complete red part of a block arrived.
    ///
    /// `is_end_of_block` reports whether the red part is also the whole
    /// block, i.e. the end-of-red-part segment carried the end-of-block
    /// flag.
    #[allow(unused_variables)]
    fn on_red_part_reception(
        &self,
        session_id: &SessionId,
        payload: Vec<u8>,
        length_of_red_part: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    ) {
    }

    /// One green data segment arrived; green data is never buffered.
    #[allow(unused_variables)]
    fn on_green_part_segment_arrival(
        &self,
        session_id: &SessionId,
        payload: Vec<u8>,
        offset_start_of_block: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    ) {
    }

    /// A reception session ended without delivering its red part.
    #[allow(unused_variables)]
    fn on_reception_session_cancelled(&self, session_id: &SessionId, reason: CancelReason) {}

    /// Every byte of the block was transmitted and the whole red part is
    /// acknowledged.
    #[allow(unused_variables)]
    fn on_transmission_session_completed(&self, session_id: &SessionId) {}

    /// The first pass over the block finished; red retransmissions may
    /// still follow.
    #[allow(unused_variables)]
    fn on_initial_transmission_completed(&self, session_id: &SessionId, user_data: &Bytes) {}

    /// A transmission session ended without the red part being fully
    /// acknowledged.
    #[allow(unused_variables)]
    fn on_transmission_session_cancelled(
        &self,
        session_id: &SessionId,
        reason: CancelReason,
        user_data: &Bytes,
    ) {
    }
}

/// Counters exposed for telemetry.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub checkpoint_timer_expired_callbacks: u64,
    pub discretionary_checkpoints_not_resent: u64,
    pub report_segment_timer_expired_callbacks: u64,
    pub report_segments_unable_to_be_issued: u64,
    pub report_segments_too_large_and_needing_split: u64,
    pub report_segments_created_via_split: u64,
    pub sends_deferred_by_rate_limiter: u64,
}

/// One outbound datagram as a scatter-gather list.
///
/// Data segment payloads are reference-counted slices of the sending
/// session's block, so the transport may hold them for as long as the send
/// takes, even past session deletion.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub fragments: Vec<Bytes>,
    /// The engine this packet must be routed to.
    pub remote_engine_id: u64,
}

impl OutboundPacket {
    pub fn total_length(&self) -> usize {
        self.fragments.iter().map(|fragment| fragment.len()).sum()
    }
}

/// Shared key shape for checkpoint and report timers: the serial number
/// qualified by the session number, so one timer manager serves every
/// session of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey {
    pub serial_number: u64,
    pub session_number: u64,
}

/// State transitions sessions announce to the engine instead of mutating
/// its maps directly.
pub(crate) enum SessionNotice {
    SessionStart {
        session_id: SessionId,
    },
    SenderHasData {
        session_number: u64,
    },
    ReceiverHasData {
        session_id: SessionId,
    },
    InitialTransmissionCompleted {
        session_id: SessionId,
        user_data: Bytes,
    },
    RedPartReception {
        session_id: SessionId,
        payload: Vec<u8>,
        length_of_red_part: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    },
    GreenPartSegmentArrival {
        session_id: SessionId,
        payload: Vec<u8>,
        offset_start_of_block: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    },
    SenderNeedsDeleted {
        session_id: SessionId,
        destination_engine_id: u64,
        cancelled: bool,
        reason: CancelReason,
        user_data: Bytes,
    },
    ReceiverNeedsDeleted {
        session_id: SessionId,
        cancelled: bool,
        reason: CancelReason,
    },
}

/// A cancel segment queued for transmission, also serialized into the
/// cancel timer's user data so expiry can requeue it.
#[derive(Debug, Clone, Copy)]
struct CancelSegmentInfo {
    session_id: SessionId,
    remote_engine_id: u64,
    reason: CancelReason,
    is_from_sender: bool,
    retry_count: u32,
}

const CANCEL_TIMER_DATA_LENGTH: usize = 1 + 1 + 4 + 8;

fn write_cancel_timer_data(info: &CancelSegmentInfo, buffer: &mut Vec<u8>) {
    buffer.clear();
    buffer.reserve(CANCEL_TIMER_DATA_LENGTH);
    buffer.push(info.is_from_sender as u8);
    buffer.push(info.reason.into());
    buffer.extend_from_slice(&info.retry_count.to_le_bytes());
    buffer.extend_from_slice(&info.remote_engine_id.to_le_bytes());
}

fn read_cancel_timer_data(session_id: SessionId, buffer: &[u8]) -> Option<CancelSegmentInfo> {
    if buffer.len() != CANCEL_TIMER_DATA_LENGTH {
        return None;
    }

    let mut retry_count = [0u8; 4];
    retry_count.copy_from_slice(&buffer[2..6]);
    let mut remote_engine_id = [0u8; 8];
    remote_engine_id.copy_from_slice(&buffer[6..14]);

    Some(CancelSegmentInfo {
        session_id,
        remote_engine_id: u64::from_le_bytes(remote_engine_id),
        reason: CancelReason::try_from(buffer[1]).ok()?,
        is_from_sender: buffer[0] != 0,
        retry_count: u32::from_le_bytes(retry_count),
    })
}

#[derive(Default)]
struct SegmentCollector {
    segments: Vec<Segment>,
}

impl SegmentSink for SegmentCollector {
    fn segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }
}

/// The LTP engine: every active session of both roles plus the shared
/// timers, rate limiter and housekeeping that serve them.
pub struct Engine<T> {
    options: EngineOptions,
    handler: T,
    rng: RandomNumberGenerator,
    parser: Parser,

    senders: AHashMap<u64, SessionSender>,
    receivers: AHashMap<SessionId, SessionReceiver>,
    recreation_preventers: AHashMap<u64, SessionRecreationPreventer>,

    checkpoint_timers: TimerManager<TimerKey, Vec<u8>>,
    report_timers: TimerManager<TimerKey, Vec<u8>>,
    cancel_timers: TimerManager<SessionId, Vec<u8>>,
    recycler: UserDataRecycler,

    notices: VecDeque<SessionNotice>,
    closed_session_data_to_send: VecDeque<(u64, Bytes)>,
    cancel_segments_to_send: VecDeque<CancelSegmentInfo>,
    senders_needing_deleted: VecDeque<u64>,
    senders_needing_data_sent: VecDeque<u64>,
    receivers_needing_deleted: VecDeque<SessionId>,
    receivers_needing_data_sent: VecDeque<SessionId>,

    rate_limiter: TokenRateLimiter,
    stagnant_rx_session_time: Duration,
    stats: EngineStats,
}

impl<T: EngineHandler> Engine<T> {
    pub fn new(mut options: EngineOptions, handler: T) -> Self {
        if !(1..=7).contains(&options.engine_index) {
            log::error!(
                "engine index {} is outside [1, 7], clamping",
                options.engine_index
            );
            options.engine_index = options.engine_index.clamp(1, 7);
        }
        options.max_reception_claims = options.max_reception_claims.max(1);

        let one_way_light_time = options.one_way_light_time;
        let one_way_margin_time = options.one_way_margin_time;
        let round_trip_time = (one_way_light_time + one_way_margin_time) * 2;

        Self {
            rng: RandomNumberGenerator::new(options.engine_index),
            parser: Parser::default(),
            handler,
            senders: AHashMap::new(),
            receivers: AHashMap::new(),
            recreation_preventers: AHashMap::new(),
            checkpoint_timers: TimerManager::new(one_way_light_time, one_way_margin_time),
            report_timers: TimerManager::new(one_way_light_time, one_way_margin_time),
            cancel_timers: TimerManager::new(one_way_light_time, one_way_margin_time),
            recycler: UserDataRecycler::new(USER_DATA_RECYCLER_CAPACITY),
            notices: VecDeque::new(),
            closed_session_data_to_send: VecDeque::new(),
            cancel_segments_to_send: VecDeque::new(),
            senders_needing_deleted: VecDeque::new(),
            senders_needing_data_sent: VecDeque::new(),
            receivers_needing_deleted: VecDeque::new(),
            receivers_needing_data_sent: VecDeque::new(),
            rate_limiter: TokenRateLimiter::new(options.max_send_rate_bits_per_sec),
            stagnant_rx_session_time: round_trip_time
                * (options.max_retries_per_serial_number + 1),
            stats: EngineStats::default(),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn num_active_senders(&self) -> usize {
        self.senders.len()
    }

    pub fn num_active_receivers(&self) -> usize {
        self.receivers.len()
    }

    pub fn set_checkpoint_every_nth_data_packet(&mut self, checkpoint_every_nth: u64) {
        self.options.checkpoint_every_nth_data_packet = checkpoint_every_nth;
    }

    pub fn set_max_reception_claims(&mut self, max_reception_claims: u64) {
        self.options.max_reception_claims = max_reception_claims.max(1);
    }

    /// Replace the outbound rate cap; zero disables limiting.
    pub fn update_rate(&mut self, max_send_rate_bits_per_sec: u64) {
        self.options.max_send_rate_bits_per_sec = max_send_rate_bits_per_sec;
        self.rate_limiter.set_rate(max_send_rate_bits_per_sec);
    }

    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limiter.enabled()
    }

    /// Accrue rate tokens; driven by the event loop's refresh tick.
    pub fn refresh_rate_tokens(&mut self, elapsed: Duration) {
        self.rate_limiter.refresh(elapsed);
    }

    /// Adopt a new light-time estimate mid-flight, rescheduling every
    /// pending retransmission timer by the change.
    pub fn update_one_way_light_time(
        &mut self,
        one_way_light_time: Duration,
        one_way_margin_time: Duration,
    ) {
        self.options.one_way_light_time = one_way_light_time;
        self.options.one_way_margin_time = one_way_margin_time;
        self.checkpoint_timers
            .update_round_trip_time(one_way_light_time, one_way_margin_time);
        self.report_timers
            .update_round_trip_time(one_way_light_time, one_way_margin_time);
        self.cancel_timers
            .update_round_trip_time(one_way_light_time, one_way_margin_time);
        self.stagnant_rx_session_time = (one_way_light_time + one_way_margin_time)
            * 2
            * (self.options.max_retries_per_serial_number + 1);
    }

    /// Drop every session and every timer, keeping the configuration.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.senders.clear();
        self.receivers.clear();
        self.recreation_preventers.clear();
        self.checkpoint_timers.clear();
        self.report_timers.clear();
        self.cancel_timers.clear();
        self.notices.clear();
        self.closed_session_data_to_send.clear();
        self.cancel_segments_to_send.clear();
        self.senders_needing_deleted.clear();
        self.senders_needing_data_sent.clear();
        self.receivers_needing_deleted.clear();
        self.receivers_needing_data_sent.clear();
        self.rate_limiter = TokenRateLimiter::new(self.options.max_send_rate_bits_per_sec);
        self.stats = EngineStats::default();
    }

    fn random_session_number(&mut self) -> u64 {
        if self.options.force_32_bit_random_numbers {
            self.rng.random_session_number_32() as u64
        } else {
            self.rng.random_session_number_64()
        }
    }

    fn random_serial_number(&mut self) -> u64 {
        if self.options.force_32_bit_random_numbers {
            self.rng.random_serial_number_32() as u64
        } else {
            self.rng.random_serial_number_64()
        }
    }

    /// Begin transmitting a block. The red part is the reliable prefix;
    /// `user_data` is an opaque tag echoed back in transmission notices.
    pub fn transmission_request(
        &mut self,
        destination_client_service_id: u64,
        destination_engine_id: u64,
        data: Bytes,
        length_of_red_part: u64,
        user_data: Bytes,
    ) -> SessionId {
        let length_of_red_part = if length_of_red_part > data.len() as u64 {
            log::warn!(
                "red part length {} exceeds the block length {}, clamping",
                length_of_red_part,
                data.len()
            );
            data.len() as u64
        } else {
            length_of_red_part
        };

        let session_number = self.random_session_number();
        let session_id = SessionId::new(self.options.this_engine_id, session_number);
        let initial_checkpoint_serial_number = self.random_serial_number();

        let sender = SessionSender::new(
            session_id,
            destination_engine_id,
            destination_client_service_id,
            data,
            length_of_red_part,
            user_data,
            initial_checkpoint_serial_number,
            self.options.checkpoint_every_nth_data_packet,
            &mut self.notices,
        );
        self.senders.insert(session_number, sender);
        self.notices
            .push_back(SessionNotice::SessionStart { session_id });

        self.drain_notices();
        session_id
    }

    /// Cancel a session of either role. Emits a cancel segment with reason
    /// USER_CANCELLED and reports completion through the cancelled notice;
    /// returns false when the session is unknown.
    pub fn cancellation_request(&mut self, session_id: &SessionId) -> bool {
        if session_id.originator == self.options.this_engine_id {
            let Some(sender) = self.senders.remove(&session_id.number) else {
                return false;
            };

            self.erase_sender_timers(&sender, session_id.number);
            self.handler.on_transmission_session_cancelled(
                session_id,
                CancelReason::UserCancelled,
                &sender.user_data(),
            );
            self.cancel_segments_to_send.push_back(CancelSegmentInfo {
                session_id: *session_id,
                remote_engine_id: sender.destination_engine_id(),
                reason: CancelReason::UserCancelled,
                is_from_sender: true,
                retry_count: 1,
            });
        } else {
            let Some(receiver) = self.receivers.remove(session_id) else {
                return false;
            };

            self.erase_receiver_state(session_id, &receiver);
            self.handler
                .on_reception_session_cancelled(session_id, CancelReason::UserCancelled);
            self.cancel_segments_to_send.push_back(CancelSegmentInfo {
                session_id: *session_id,
                remote_engine_id: session_id.originator,
                reason: CancelReason::UserCancelled,
                is_from_sender: false,
                retry_count: 1,
            });
        }

        true
    }

    /// Feed one inbound datagram. Each datagram must contain a whole
    /// number of segments; segments parsed before an error are still
    /// delivered.
    pub fn packet_in(&mut self, data: &[u8]) -> Result<(), codec::Error> {
        let mut collector = SegmentCollector::default();
        let parsed = self.parser.parse(data, &mut collector);

        for segment in collector.segments {
            self.segment_received(segment);
        }

        let result = parsed.and_then(|_| {
            if self.parser.is_idle() {
                Ok(())
            } else {
                self.parser.reset();
                Err(codec::Error::InvalidInput)
            }
        });

        self.drain_notices();
        result
    }

    fn segment_received(&mut self, segment: Segment) {
        let session_id = segment.session_id;
        match segment.body {
            SegmentBody::Data(data) => self.data_segment_received(session_id, data),
            SegmentBody::Report(report) => self.report_segment_received(session_id, report),
            SegmentBody::ReportAck {
                report_serial_number,
            } => self.report_ack_received(session_id, report_serial_number),
            SegmentBody::Cancel {
                from_sender,
                reason,
            } => self.cancel_segment_received(session_id, from_sender, reason),
            SegmentBody::CancelAck { .. } => {
                if let Some(user_data) = self.cancel_timers.delete(&session_id) {
                    self.recycler.give(user_data);
                } else {
                    log::debug!("cancel acknowledgement for unknown session {}", session_id);
                }
            }
        }
    }

    fn data_segment_received(&mut self, session_id: SessionId, data: DataSegment) {
        if !self.receivers.contains_key(&session_id) {
            if self.options.session_recreation_preventer_history_size != 0
                && self
                    .recreation_preventers
                    .get(&session_id.originator)
                    .is_some_and(|preventer| preventer.contains(session_id.number))
            {
                log::debug!(
                    "dropping data segment for recently closed session {}",
                    session_id
                );
                return;
            }

            if self.receivers.len() as u64 >= self.options.max_simultaneous_sessions {
                log::warn!(
                    "reception session cap of {} reached, dropping new session {}",
                    self.options.max_simultaneous_sessions,
                    session_id
                );
                return;
            }

            let initial_report_serial_number = self.random_serial_number();
            self.receivers.insert(
                session_id,
                SessionReceiver::new(
                    session_id,
                    data.metadata.client_service_id,
                    initial_report_serial_number,
                    self.options.estimated_bytes_to_receive_per_session,
                ),
            );
            self.notices
                .push_back(SessionNotice::SessionStart { session_id });
        }

        let Some(receiver) = self.receivers.get_mut(&session_id) else {
            return;
        };

        let mut ctx = ReceiverContext {
            max_reception_claims: self.options.max_reception_claims,
            max_red_rx_bytes: self.options.max_red_rx_bytes_per_session,
            max_retries: self.options.max_retries_per_serial_number,
            timers: &mut self.report_timers,
            recycler: &mut self.recycler,
            notices: &mut self.notices,
            stats: &mut self.stats,
        };
        receiver.data_segment_received(data.segment_type, data.payload, &data.metadata, &mut ctx);
    }

    fn report_segment_received(&mut self, session_id: SessionId, report: ReportSegment) {
        if let Some(sender) = self.senders.get_mut(&session_id.number) {
            let mut ctx = SenderContext {
                mtu: self.options.mtu_client_service_data,
                checkpoint_every_nth: self.options.checkpoint_every_nth_data_packet,
                max_retries: self.options.max_retries_per_serial_number,
                timers: &mut self.checkpoint_timers,
                recycler: &mut self.recycler,
                notices: &mut self.notices,
                stats: &mut self.stats,
            };
            sender.report_segment_received(&report, &mut ctx);
        } else {
            // the sending session is already gone; acknowledge with a
            // cancel so the receiver stops retransmitting its reports
            log::debug!("report segment for unknown session {}", session_id);
            let mut bytes = BytesMut::with_capacity(32);
            segment::encode_cancel_ack(false, session_id, &mut bytes);
            self.closed_session_data_to_send
                .push_back((session_id.originator, bytes.freeze()));
        }
    }

    fn report_ack_received(&mut self, session_id: SessionId, report_serial_number: u64) {
        let Some(receiver) = self.receivers.get_mut(&session_id) else {
            log::debug!(
                "report acknowledgement for unknown session {}",
                session_id
            );
            return;
        };

        let mut ctx = ReceiverContext {
            max_reception_claims: self.options.max_reception_claims,
            max_red_rx_bytes: self.options.max_red_rx_bytes_per_session,
            max_retries: self.options.max_retries_per_serial_number,
            timers: &mut self.report_timers,
            recycler: &mut self.recycler,
            notices: &mut self.notices,
            stats: &mut self.stats,
        };
        receiver.report_ack_received(report_serial_number, &mut ctx);
    }

    fn cancel_segment_received(
        &mut self,
        session_id: SessionId,
        from_sender: bool,
        reason: CancelReason,
    ) {
        let remote_engine_id = if from_sender {
            // we are the receiving side of the session being cancelled
            if let Some(receiver) = self.receivers.remove(&session_id) {
                self.erase_receiver_state(&session_id, &receiver);
                self.handler
                    .on_reception_session_cancelled(&session_id, reason);
            }

            session_id.originator
        } else {
            // we are the sending side
            let remote_engine_id = self
                .senders
                .get(&session_id.number)
                .map_or(session_id.originator, |sender| {
                    sender.destination_engine_id()
                });

            if let Some(sender) = self.senders.remove(&session_id.number) {
                self.erase_sender_timers(&sender, session_id.number);
                self.handler.on_transmission_session_cancelled(
                    &session_id,
                    reason,
                    &sender.user_data(),
                );
            }

            remote_engine_id
        };

        // a cancel is acknowledged even when the session is unknown
        let mut bytes = BytesMut::with_capacity(32);
        segment::encode_cancel_ack(from_sender, session_id, &mut bytes);
        self.closed_session_data_to_send
            .push_back((remote_engine_id, bytes.freeze()));
    }

    fn erase_sender_timers(&mut self, sender: &SessionSender, session_number: u64) {
        for serial_number in sender.active_checkpoint_timers() {
            if let Some(user_data) = self.checkpoint_timers.delete(&TimerKey {
                serial_number,
                session_number,
            }) {
                self.recycler.give(user_data);
            }
        }
    }

    fn erase_receiver_state(&mut self, session_id: &SessionId, receiver: &SessionReceiver) {
        for serial_number in receiver.active_report_timers() {
            if let Some(user_data) = self.report_timers.delete(&TimerKey {
                serial_number,
                session_number: session_id.number,
            }) {
                self.recycler.give(user_data);
            }
        }

        let history = self.options.session_recreation_preventer_history_size as usize;
        if history != 0 {
            self.recreation_preventers
                .entry(session_id.originator)
                .or_insert_with(|| SessionRecreationPreventer::new(history))
                .add(session_id.number);
        }
    }

    fn drain_notices(&mut self) {
        while let Some(notice) = self.notices.pop_front() {
            match notice {
                SessionNotice::SessionStart { session_id } => {
                    self.handler.on_session_start(&session_id);
                }
                SessionNotice::SenderHasData { session_number } => {
                    self.senders_needing_data_sent.push_back(session_number);
                }
                SessionNotice::ReceiverHasData { session_id } => {
                    self.receivers_needing_data_sent.push_back(session_id);
                }
                SessionNotice::InitialTransmissionCompleted {
                    session_id,
                    user_data,
                } => {
                    self.handler
                        .on_initial_transmission_completed(&session_id, &user_data);
                }
                SessionNotice::RedPartReception {
                    session_id,
                    payload,
                    length_of_red_part,
                    client_service_id,
                    is_end_of_block,
                } => {
                    self.handler.on_red_part_reception(
                        &session_id,
                        payload,
                        length_of_red_part,
                        client_service_id,
                        is_end_of_block,
                    );
                }
                SessionNotice::GreenPartSegmentArrival {
                    session_id,
                    payload,
                    offset_start_of_block,
                    client_service_id,
                    is_end_of_block,
                } => {
                    self.handler.on_green_part_segment_arrival(
                        &session_id,
                        payload,
                        offset_start_of_block,
                        client_service_id,
                        is_end_of_block,
                    );
                }
                SessionNotice::SenderNeedsDeleted {
                    session_id,
                    destination_engine_id,
                    cancelled,
                    reason,
                    user_data,
                } => {
                    if cancelled {
                        self.handler.on_transmission_session_cancelled(
                            &session_id,
                            reason,
                            &user_data,
                        );
                        self.cancel_segments_to_send.push_back(CancelSegmentInfo {
                            session_id,
                            remote_engine_id: destination_engine_id,
                            reason,
                            is_from_sender: true,
                            retry_count: 1,
                        });
                    } else {
                        self.handler.on_transmission_session_completed(&session_id);
                    }

                    self.senders_needing_deleted.push_back(session_id.number);
                }
                SessionNotice::ReceiverNeedsDeleted {
                    session_id,
                    cancelled,
                    reason,
                } => {
                    if cancelled {
                        self.handler
                            .on_reception_session_cancelled(&session_id, reason);
                        self.cancel_segments_to_send.push_back(CancelSegmentInfo {
                            session_id,
                            remote_engine_id: session_id.originator,
                            reason,
                            is_from_sender: false,
                            retry_count: 1,
                        });
                    }

                    self.receivers_needing_deleted.push_back(session_id);
                }
            }
        }
    }

    /// Produce the next outbound packet, or `None` when nothing can be
    /// sent right now. Deferred by the token bucket when a rate cap is
    /// configured and the balance is exhausted.
    pub fn next_packet_to_send(&mut self) -> Option<OutboundPacket> {
        self.drain_notices();

        if !self.rate_limiter.can_send() {
            self.stats.sends_deferred_by_rate_limiter += 1;
            return None;
        }

        let packet = self.produce_next_packet()?;
        self.rate_limiter.consume(packet.total_length());
        Some(packet)
    }

    fn produce_next_packet(&mut self) -> Option<OutboundPacket> {
        // cancel acknowledgements for sessions that no longer exist
        if let Some((remote_engine_id, bytes)) = self.closed_session_data_to_send.pop_front() {
            return Some(OutboundPacket {
                fragments: vec![bytes],
                remote_engine_id,
            });
        }

        // cancel segments, each starting its bounded retry timer
        if let Some(info) = self.cancel_segments_to_send.pop_front() {
            let mut bytes = BytesMut::with_capacity(32);
            segment::encode_cancel_segment(
                info.is_from_sender,
                info.session_id,
                info.reason,
                &mut bytes,
            );

            let mut user_data = self.recycler.take();
            write_cancel_timer_data(&info, &mut user_data);
            if !self.cancel_timers.start(info.session_id, user_data) {
                log::debug!("cancel timer already running for session {}", info.session_id);
            }

            return Some(OutboundPacket {
                fragments: vec![bytes.freeze()],
                remote_engine_id: info.remote_engine_id,
            });
        }

        // sessions pending deletion drain their remaining packets first
        while let Some(&session_number) = self.senders_needing_deleted.front() {
            if let Some(sender) = self.senders.get_mut(&session_number) {
                let mut ctx = SenderContext {
                    mtu: self.options.mtu_client_service_data,
                    checkpoint_every_nth: self.options.checkpoint_every_nth_data_packet,
                    max_retries: self.options.max_retries_per_serial_number,
                    timers: &mut self.checkpoint_timers,
                    recycler: &mut self.recycler,
                    notices: &mut self.notices,
                    stats: &mut self.stats,
                };
                if let Some(packet) = sender.next_data_to_send(&mut ctx) {
                    return Some(packet);
                }

                if let Some(sender) = self.senders.remove(&session_number) {
                    self.erase_sender_timers(&sender, session_number);
                }
            }

            self.senders_needing_deleted.pop_front();
        }

        while let Some(&session_id) = self.receivers_needing_deleted.front() {
            if let Some(receiver) = self.receivers.get_mut(&session_id) {
                let mut ctx = ReceiverContext {
                    max_reception_claims: self.options.max_reception_claims,
                    max_red_rx_bytes: self.options.max_red_rx_bytes_per_session,
                    max_retries: self.options.max_retries_per_serial_number,
                    timers: &mut self.report_timers,
                    recycler: &mut self.recycler,
                    notices: &mut self.notices,
                    stats: &mut self.stats,
                };
                if let Some(packet) = receiver.next_data_to_send(&mut ctx) {
                    return Some(packet);
                }

                if let Some(receiver) = self.receivers.remove(&session_id) {
                    self.erase_receiver_state(&session_id, &receiver);
                }
            }

            self.receivers_needing_deleted.pop_front();
        }

        // live sessions with producible data, round robin
        while let Some(session_number) = self.senders_needing_data_sent.pop_front() {
            if let Some(sender) = self.senders.get_mut(&session_number) {
                let mut ctx = SenderContext {
                    mtu: self.options.mtu_client_service_data,
                    checkpoint_every_nth: self.options.checkpoint_every_nth_data_packet,
                    max_retries: self.options.max_retries_per_serial_number,
                    timers: &mut self.checkpoint_timers,
                    recycler: &mut self.recycler,
                    notices: &mut self.notices,
                    stats: &mut self.stats,
                };
                if let Some(packet) = sender.next_data_to_send(&mut ctx) {
                    if sender.has_producible_data() {
                        self.senders_needing_data_sent.push_back(session_number);
                    }

                    return Some(packet);
                }
            }
        }

        while let Some(session_id) = self.receivers_needing_data_sent.pop_front() {
            if let Some(receiver) = self.receivers.get_mut(&session_id) {
                let mut ctx = ReceiverContext {
                    max_reception_claims: self.options.max_reception_claims,
                    max_red_rx_bytes: self.options.max_red_rx_bytes_per_session,
                    max_retries: self.options.max_retries_per_serial_number,
                    timers: &mut self.report_timers,
                    recycler: &mut self.recycler,
                    notices: &mut self.notices,
                    stats: &mut self.stats,
                };
                if let Some(packet) = receiver.next_data_to_send(&mut ctx) {
                    if receiver.has_producible_data() {
                        self.receivers_needing_data_sent.push_back(session_id);
                    }

                    return Some(packet);
                }
            }
        }

        None
    }

    /// Earliest pending timer deadline across both roles and cancels.
    pub fn next_timer_expiry(&mut self) -> Option<Instant> {
        [
            self.checkpoint_timers.next_expiry(),
            self.report_timers.next_expiry(),
            self.cancel_timers.next_expiry(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every timer due at or before `now`; returns how many fired.
    pub fn advance_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;

        loop {
            if let Some((key, user_data)) = self.checkpoint_timers.poll_expired(now) {
                fired += 1;
                if let Some(sender) = self.senders.get_mut(&key.session_number) {
                    let mut ctx = SenderContext {
                        mtu: self.options.mtu_client_service_data,
                        checkpoint_every_nth: self.options.checkpoint_every_nth_data_packet,
                        max_retries: self.options.max_retries_per_serial_number,
                        timers: &mut self.checkpoint_timers,
                        recycler: &mut self.recycler,
                        notices: &mut self.notices,
                        stats: &mut self.stats,
                    };
                    sender.checkpoint_timer_expired(key.serial_number, user_data, &mut ctx);
                } else {
                    self.recycler.give(user_data);
                }

                continue;
            }

            if let Some((key, user_data)) = self.report_timers.poll_expired(now) {
                fired += 1;
                match read_report_timer_data(&user_data) {
                    Some((originator, retry_count)) => {
                        self.recycler.give(user_data);
                        let session_id = SessionId::new(originator, key.session_number);
                        if let Some(receiver) = self.receivers.get_mut(&session_id) {
                            let mut ctx = ReceiverContext {
                                max_reception_claims: self.options.max_reception_claims,
                                max_red_rx_bytes: self.options.max_red_rx_bytes_per_session,
                                max_retries: self.options.max_retries_per_serial_number,
                                timers: &mut self.report_timers,
                                recycler: &mut self.recycler,
                                notices: &mut self.notices,
                                stats: &mut self.stats,
                            };
                            receiver.report_timer_expired(
                                key.serial_number,
                                retry_count,
                                &mut ctx,
                            );
                        }
                    }
                    None => {
                        log::error!("malformed report timer payload");
                        self.recycler.give(user_data);
                    }
                }

                continue;
            }

            if let Some((session_id, user_data)) = self.cancel_timers.poll_expired(now) {
                fired += 1;
                if let Some(mut info) = read_cancel_timer_data(session_id, &user_data) {
                    if info.retry_count <= self.options.max_retries_per_serial_number {
                        info.retry_count += 1;
                        self.cancel_segments_to_send.push_back(info);
                    } else {
                        // the peer never acknowledged; the session state is
                        // long gone, so simply stop trying
                        log::debug!("giving up cancelling session {}", session_id);
                    }
                } else {
                    log::error!("malformed cancel timer payload");
                }
                self.recycler.give(user_data);

                continue;
            }

            break;
        }

        self.drain_notices();
        fired
    }

    /// Cancel reception sessions that have not received a data segment for
    /// longer than the stagnation threshold. Expected to be driven about
    /// once per [`HOUSEKEEPING_INTERVAL`].
    pub fn housekeeping(&mut self, now: Instant) {
        let stagnant: Vec<SessionId> = self
            .receivers
            .iter()
            .filter(|(_, receiver)| {
                now.duration_since(receiver.last_segment_received())
                    >= self.stagnant_rx_session_time
            })
            .map(|(session_id, _)| *session_id)
            .collect();

        for session_id in stagnant {
            log::warn!("cancelling stagnant reception session {}", session_id);
            if let Some(receiver) = self.receivers.remove(&session_id) {
                self.erase_receiver_state(&session_id, &receiver);
                self.handler
                    .on_reception_session_cancelled(&session_id, CancelReason::UserCancelled);
                self.cancel_segments_to_send.push_back(CancelSegmentInfo {
                    session_id,
                    remote_engine_id: session_id.originator,
                    reason: CancelReason::UserCancelled,
                    is_from_sender: false,
                    retry_count: 1,
                });
            }
        }
    }
}
