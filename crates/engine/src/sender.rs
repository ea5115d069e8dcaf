use std::collections::VecDeque;

use ahash::AHashSet;
use bytes::{Bytes, BytesMut};
use codec::{
    SessionId,
    segment::{self, CancelReason, DataSegmentMetadata, ReportSegment, SegmentType},
};

use crate::{
    EngineStats, OutboundPacket, SessionNotice, TimerKey,
    fragment::{self, FragmentSet},
    timer::{TimerManager, UserDataRecycler},
};

/// One queued retransmission: a slice of the block plus the checkpoint
/// bookkeeping it must carry. Serialized into timer user data so that a
/// checkpoint expiry can re-enqueue exactly the segment that was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResendFragment {
    pub offset: u64,
    pub length: u64,
    pub checkpoint_serial_number: u64,
    pub report_serial_number: u64,
    pub segment_type: SegmentType,
    pub retry_count: u32,
}

impl ResendFragment {
    const ENCODED_LENGTH: usize = 8 * 4 + 1 + 4;

    pub fn write_user_data(&self, buffer: &mut Vec<u8>) {
        buffer.clear();
        buffer.reserve(Self::ENCODED_LENGTH);
        buffer.extend_from_slice(&self.offset.to_le_bytes());
        buffer.extend_from_slice(&self.length.to_le_bytes());
        buffer.extend_from_slice(&self.checkpoint_serial_number.to_le_bytes());
        buffer.extend_from_slice(&self.report_serial_number.to_le_bytes());
        buffer.push(self.segment_type.into());
        buffer.extend_from_slice(&self.retry_count.to_le_bytes());
    }

    pub fn from_user_data(buffer: &[u8]) -> Option<Self> {
        if buffer.len() != Self::ENCODED_LENGTH {
            return None;
        }

        let u64_at = |i: usize| -> u64 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buffer[i..i + 8]);
            u64::from_le_bytes(bytes)
        };

        let mut retry = [0u8; 4];
        retry.copy_from_slice(&buffer[33..37]);

        Some(Self {
            offset: u64_at(0),
            length: u64_at(8),
            checkpoint_serial_number: u64_at(16),
            report_serial_number: u64_at(24),
            segment_type: SegmentType::try_from(buffer[32]).ok()?,
            retry_count: u32::from_le_bytes(retry),
        })
    }
}

/// Engine state a sender session borrows while it runs.
pub(crate) struct SenderContext<'a> {
    pub mtu: u64,
    pub checkpoint_every_nth: u64,
    pub max_retries: u32,
    pub timers: &'a mut TimerManager<TimerKey, Vec<u8>>,
    pub recycler: &'a mut UserDataRecycler,
    pub notices: &'a mut VecDeque<SessionNotice>,
    pub stats: &'a mut EngineStats,
}

/// One sending session: first-pass transmission of the block, checkpoint
/// scheduling, and report-driven retransmission of the red part.
pub(crate) struct SessionSender {
    session_id: SessionId,
    destination_engine_id: u64,
    client_service_id: u64,

    /// The block, shared so in-flight sends outlive the session.
    data: Bytes,
    user_data: Bytes,
    length_of_red_part: u64,
    data_index_first_pass: u64,

    next_checkpoint_serial_number: u64,
    checkpoint_counter: u64,

    acked_by_receiver: FragmentSet,
    non_data_queue: VecDeque<Bytes>,
    resend_queue: VecDeque<ResendFragment>,
    report_serial_numbers_received: AHashSet<u64>,
    active_checkpoint_timers: AHashSet<u64>,

    did_notify_for_deletion: bool,
}

impl SessionSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        destination_engine_id: u64,
        client_service_id: u64,
        data: Bytes,
        length_of_red_part: u64,
        user_data: Bytes,
        initial_checkpoint_serial_number: u64,
        checkpoint_every_nth: u64,
        notices: &mut VecDeque<SessionNotice>,
    ) -> Self {
        debug_assert!(length_of_red_part <= data.len() as u64);

        // announce the first pass of data right away
        notices.push_back(SessionNotice::SenderHasData {
            session_number: session_id.number,
        });

        Self {
            session_id,
            destination_engine_id,
            client_service_id,
            data,
            user_data,
            length_of_red_part,
            data_index_first_pass: 0,
            next_checkpoint_serial_number: initial_checkpoint_serial_number,
            checkpoint_counter: checkpoint_every_nth,
            acked_by_receiver: FragmentSet::default(),
            non_data_queue: VecDeque::new(),
            resend_queue: VecDeque::new(),
            report_serial_numbers_received: AHashSet::new(),
            active_checkpoint_timers: AHashSet::new(),
            did_notify_for_deletion: false,
        }
    }

    pub fn user_data(&self) -> Bytes {
        self.user_data.clone()
    }

    pub fn destination_engine_id(&self) -> u64 {
        self.destination_engine_id
    }

    /// Checkpoint serial numbers with live timers, for cleanup on erase.
    pub fn active_checkpoint_timers(&self) -> impl Iterator<Item = u64> + '_ {
        self.active_checkpoint_timers.iter().copied()
    }

    pub fn has_producible_data(&self) -> bool {
        !self.non_data_queue.is_empty()
            || !self.resend_queue.is_empty()
            || self.data_index_first_pass < self.data.len() as u64
    }

    fn red_part_fully_acked(&self) -> bool {
        self.length_of_red_part == 0
            || self
                .acked_by_receiver
                .contains(0, self.length_of_red_part - 1)
    }

    fn notify_needs_deleted(
        &mut self,
        notices: &mut VecDeque<SessionNotice>,
        cancelled: bool,
        reason: CancelReason,
    ) {
        if !self.did_notify_for_deletion {
            self.did_notify_for_deletion = true;
            notices.push_back(SessionNotice::SenderNeedsDeleted {
                session_id: self.session_id,
                destination_engine_id: self.destination_engine_id,
                cancelled,
                reason,
                user_data: self.user_data.clone(),
            });
        }
    }

    fn start_checkpoint_timer(&mut self, resend: ResendFragment, ctx: &mut SenderContext) {
        let key = TimerKey {
            serial_number: resend.checkpoint_serial_number,
            session_number: self.session_id.number,
        };

        let mut user_data = ctx.recycler.take();
        resend.write_user_data(&mut user_data);
        if ctx.timers.start(key, user_data)
            && !self
                .active_checkpoint_timers
                .insert(resend.checkpoint_serial_number)
        {
            log::warn!(
                "checkpoint serial number already tracked: session={}, csn={}",
                self.session_id,
                resend.checkpoint_serial_number
            );
        }
    }

    fn packet(&self, fragments: Vec<Bytes>) -> OutboundPacket {
        OutboundPacket {
            fragments,
            remote_engine_id: self.destination_engine_id,
        }
    }

    /// Produce the next outbound packet, in strict priority order: report
    /// acknowledgements, retransmissions, then the first pass of the block.
    pub fn next_data_to_send(&mut self, ctx: &mut SenderContext) -> Option<OutboundPacket> {
        if let Some(packet) = self.non_data_queue.pop_front() {
            return Some(self.packet(vec![packet]));
        }

        if let Some(resend) = self.resend_queue.pop_front() {
            let metadata = DataSegmentMetadata {
                client_service_id: self.client_service_id,
                offset: resend.offset,
                length: resend.length,
                checkpoint_serial_number: resend
                    .segment_type
                    .is_checkpoint()
                    .then_some(resend.checkpoint_serial_number),
                report_serial_number: resend
                    .segment_type
                    .is_checkpoint()
                    .then_some(resend.report_serial_number),
            };

            // the expected report's arrival timer starts when the
            // checkpoint is dequeued for transmission
            if resend.segment_type.is_checkpoint() {
                self.start_checkpoint_timer(resend, ctx);
            }

            let mut header = BytesMut::with_capacity(64);
            segment::encode_data_segment_header(
                resend.segment_type,
                self.session_id,
                &metadata,
                &mut header,
            );

            let payload = self
                .data
                .slice(resend.offset as usize..(resend.offset + resend.length) as usize);
            return Some(self.packet(vec![header.freeze(), payload]));
        }

        if self.data_index_first_pass < self.data.len() as u64 {
            let packet = if self.data_index_first_pass < self.length_of_red_part {
                self.next_first_pass_red(ctx)
            } else {
                self.next_first_pass_green(ctx.mtu)
            };

            if self.data_index_first_pass == self.data.len() as u64 {
                // only ever reached once
                ctx.notices
                    .push_back(SessionNotice::InitialTransmissionCompleted {
                        session_id: self.session_id,
                        user_data: self.user_data.clone(),
                    });

                if self.length_of_red_part == 0 {
                    // fully green blocks complete at the end of the first pass
                    self.notify_needs_deleted(ctx.notices, false, CancelReason::Reserved);
                } else if !self.acked_by_receiver.is_empty() && self.red_part_fully_acked() {
                    // red part already acknowledged before the green tail finished
                    self.notify_needs_deleted(ctx.notices, false, CancelReason::Reserved);
                }
            }

            return Some(packet);
        }

        None
    }

    fn next_first_pass_red(&mut self, ctx: &mut SenderContext) -> OutboundPacket {
        let offset = self.data_index_first_pass;
        let length = (self.length_of_red_part - offset).min(ctx.mtu);
        let is_end_of_red_part = offset + length == self.length_of_red_part;

        let mut is_periodic_checkpoint = false;
        if ctx.checkpoint_every_nth != 0 {
            if self.checkpoint_counter > 1 {
                self.checkpoint_counter -= 1;
            } else {
                self.checkpoint_counter = ctx.checkpoint_every_nth;
                is_periodic_checkpoint = true;
            }
        }

        let mut segment_type = SegmentType::RedData;
        let mut checkpoint_serial_number = None;
        let mut report_serial_number = None;
        if is_periodic_checkpoint || is_end_of_red_part {
            segment_type = if !is_end_of_red_part {
                SegmentType::RedDataCheckpoint
            } else if self.length_of_red_part == self.data.len() as u64 {
                SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
            } else {
                SegmentType::RedDataCheckpointEndOfRedPart
            };

            let csn = self.next_checkpoint_serial_number;
            self.next_checkpoint_serial_number += 1;
            checkpoint_serial_number = Some(csn);
            // zero: this checkpoint is not a response to any report
            report_serial_number = Some(0);

            self.start_checkpoint_timer(
                ResendFragment {
                    offset,
                    length,
                    checkpoint_serial_number: csn,
                    report_serial_number: 0,
                    segment_type,
                    retry_count: 1,
                },
                ctx,
            );
        }

        let metadata = DataSegmentMetadata {
            client_service_id: self.client_service_id,
            offset,
            length,
            checkpoint_serial_number,
            report_serial_number,
        };

        let mut header = BytesMut::with_capacity(64);
        segment::encode_data_segment_header(segment_type, self.session_id, &metadata, &mut header);

        let payload = self.data.slice(offset as usize..(offset + length) as usize);
        self.data_index_first_pass += length;
        self.packet(vec![header.freeze(), payload])
    }

    fn next_first_pass_green(&mut self, mtu: u64) -> OutboundPacket {
        let offset = self.data_index_first_pass;
        let length = (self.data.len() as u64 - offset).min(mtu);
        let is_end_of_block = offset + length == self.data.len() as u64;

        let segment_type = if is_end_of_block {
            SegmentType::GreenDataEndOfBlock
        } else {
            SegmentType::GreenData
        };

        let metadata = DataSegmentMetadata {
            client_service_id: self.client_service_id,
            offset,
            length,
            checkpoint_serial_number: None,
            report_serial_number: None,
        };

        let mut header = BytesMut::with_capacity(64);
        segment::encode_data_segment_header(segment_type, self.session_id, &metadata, &mut header);

        let payload = self.data.slice(offset as usize..(offset + length) as usize);
        self.data_index_first_pass += length;
        self.packet(vec![header.freeze(), payload])
    }

    /// Handle an inbound reception report: acknowledge it, absorb its
    /// claims, and queue retransmission of whatever the claims did not
    /// cover.
    pub fn report_segment_received(&mut self, report: &ReportSegment, ctx: &mut SenderContext) {
        // the acknowledgement always goes out, even for duplicates
        let mut ack = BytesMut::with_capacity(32);
        segment::encode_report_ack(self.session_id, report.report_serial_number, &mut ack);
        self.non_data_queue.push_back(ack.freeze());

        if !self
            .report_serial_numbers_received
            .insert(report.report_serial_number)
        {
            // duplicate report: the acknowledgement above is all it gets
            ctx.notices.push_back(SessionNotice::SenderHasData {
                session_number: self.session_id.number,
            });
            return;
        }

        // a non-zero checkpoint serial number stops that checkpoint's timer
        if report.checkpoint_serial_number != 0 {
            let key = TimerKey {
                serial_number: report.checkpoint_serial_number,
                session_number: self.session_id.number,
            };
            if let Some(user_data) = ctx.timers.delete(&key) {
                ctx.recycler.give(user_data);
                if !self
                    .active_checkpoint_timers
                    .remove(&report.checkpoint_serial_number)
                {
                    log::warn!(
                        "checkpoint timer was not tracked: session={}, csn={}",
                        self.session_id,
                        report.checkpoint_serial_number
                    );
                }
            }
        }

        self.acked_by_receiver.add_report_claims(report);

        // the session completes once the whole block has been transmitted
        // and every red byte is claimed
        if self.data_index_first_pass == self.data.len() as u64
            && !self.acked_by_receiver.is_empty()
            && self.red_part_fully_acked()
        {
            self.notify_needs_deleted(ctx.notices, false, CancelReason::Reserved);
        }

        // retransmit the gaps; only the last queued segment of this
        // response is a checkpoint, and it references this report
        let gaps = fragment::report_segment_gaps(report);
        for (gap_index, &(begin, end)) in gaps.iter().enumerate() {
            let is_last_gap = gap_index + 1 == gaps.len();

            let mut offset = begin;
            while offset <= end {
                let length = (end - offset + 1).min(ctx.mtu);
                let is_last_packet = is_last_gap && offset + length == end + 1;
                let is_end_of_red_part = offset + length == self.length_of_red_part;

                let mut segment_type = SegmentType::RedData;
                let mut checkpoint_serial_number = 0;
                if is_last_packet {
                    segment_type = if !is_end_of_red_part {
                        SegmentType::RedDataCheckpoint
                    } else if self.length_of_red_part == self.data.len() as u64 {
                        SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
                    } else {
                        SegmentType::RedDataCheckpointEndOfRedPart
                    };

                    checkpoint_serial_number = self.next_checkpoint_serial_number;
                    self.next_checkpoint_serial_number += 1;
                }

                self.resend_queue.push_back(ResendFragment {
                    offset,
                    length,
                    checkpoint_serial_number,
                    report_serial_number: report.report_serial_number,
                    segment_type,
                    retry_count: 1,
                });

                offset += length;
            }
        }

        if !self.did_notify_for_deletion {
            ctx.notices.push_back(SessionNotice::SenderHasData {
                session_number: self.session_id.number,
            });
        }
    }

    /// A checkpoint's report never arrived: re-enqueue it within the retry
    /// budget, except for discretionary checkpoints whose data the
    /// receiver has meanwhile claimed through some other report.
    pub fn checkpoint_timer_expired(
        &mut self,
        checkpoint_serial_number: u64,
        user_data: Vec<u8>,
        ctx: &mut SenderContext,
    ) {
        ctx.stats.checkpoint_timer_expired_callbacks += 1;
        if !self.active_checkpoint_timers.remove(&checkpoint_serial_number) {
            log::warn!(
                "expired checkpoint timer was not tracked: session={}, csn={}",
                self.session_id,
                checkpoint_serial_number
            );
        }

        let Some(mut resend) = ResendFragment::from_user_data(&user_data) else {
            log::error!(
                "malformed checkpoint timer payload: session={}, csn={}",
                self.session_id,
                checkpoint_serial_number
            );
            ctx.recycler.give(user_data);
            return;
        };
        ctx.recycler.give(user_data);

        if resend.retry_count <= ctx.max_retries {
            let is_discretionary = resend.segment_type == SegmentType::RedDataCheckpoint;
            if is_discretionary
                && self
                    .acked_by_receiver
                    .contains(resend.offset, resend.offset + resend.length - 1)
            {
                // the receiver already has these bytes via another report
                ctx.stats.discretionary_checkpoints_not_resent += 1;
            } else {
                resend.retry_count += 1;
                self.resend_queue.push_back(resend);
                ctx.notices.push_back(SessionNotice::SenderHasData {
                    session_number: self.session_id.number,
                });
            }
        } else {
            self.notify_needs_deleted(
                ctx.notices,
                true,
                CancelReason::RetransmitLimitExceeded,
            );
        }
    }
}
