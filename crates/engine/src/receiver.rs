use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use ahash::AHashSet;
use bytes::BytesMut;
use codec::{
    SessionId,
    segment::{CancelReason, DataSegmentMetadata, ReportSegment, SegmentType},
};

use crate::{
    EngineStats, OutboundPacket, SessionNotice, TimerKey,
    fragment::{self, FragmentSet},
    timer::{TimerManager, UserDataRecycler},
};

const REPORT_TIMER_DATA_LENGTH: usize = 8 + 4;

/// Report timers are keyed by (report serial number, session number); the
/// payload carries what the key cannot: the originator needed to find the
/// session again, and the retry count.
pub(crate) fn write_report_timer_data(originator: u64, retry_count: u32, buffer: &mut Vec<u8>) {
    buffer.clear();
    buffer.reserve(REPORT_TIMER_DATA_LENGTH);
    buffer.extend_from_slice(&originator.to_le_bytes());
    buffer.extend_from_slice(&retry_count.to_le_bytes());
}

pub(crate) fn read_report_timer_data(buffer: &[u8]) -> Option<(u64, u32)> {
    if buffer.len() != REPORT_TIMER_DATA_LENGTH {
        return None;
    }

    let mut originator = [0u8; 8];
    originator.copy_from_slice(&buffer[0..8]);
    let mut retry_count = [0u8; 4];
    retry_count.copy_from_slice(&buffer[8..12]);

    Some((
        u64::from_le_bytes(originator),
        u32::from_le_bytes(retry_count),
    ))
}

/// Engine state a receiver session borrows while it runs.
pub(crate) struct ReceiverContext<'a> {
    pub max_reception_claims: u64,
    pub max_red_rx_bytes: u64,
    pub max_retries: u32,
    pub timers: &'a mut TimerManager<TimerKey, Vec<u8>>,
    pub recycler: &'a mut UserDataRecycler,
    pub notices: &'a mut VecDeque<SessionNotice>,
    pub stats: &'a mut EngineStats,
}

/// One receiving session: red-part reassembly, report generation, and the
/// red/green ordering discipline.
pub(crate) struct SessionReceiver {
    session_id: SessionId,
    client_service_id: u64,

    received_fragments: FragmentSet,
    data_received_red: Vec<u8>,

    /// Every report ever issued, for secondary lower bounds and resends.
    all_report_segments_sent: BTreeMap<u64, ReportSegment>,
    /// Primary reports only; the largest upper bound seeds the next
    /// primary's lower bound.
    primary_report_segments_sent: BTreeMap<u64, ReportSegment>,
    checkpoint_serial_numbers_received: AHashSet<u64>,
    reports_to_send: VecDeque<(u64, u32)>,
    active_report_timers: AHashSet<u64>,
    next_report_serial_number: u64,

    length_of_red_part: Option<u64>,
    red_part_is_end_of_block: bool,
    lowest_green_offset_received: u64,
    current_red_length: u64,

    did_red_part_callback: bool,
    did_notify_for_deletion: bool,
    received_end_of_block: bool,

    last_segment_received: Instant,
}

impl SessionReceiver {
    pub fn new(
        session_id: SessionId,
        client_service_id: u64,
        initial_report_serial_number: u64,
        estimated_bytes_to_receive: u64,
    ) -> Self {
        Self {
            session_id,
            client_service_id,
            received_fragments: FragmentSet::default(),
            data_received_red: Vec::with_capacity(estimated_bytes_to_receive as usize),
            all_report_segments_sent: BTreeMap::new(),
            primary_report_segments_sent: BTreeMap::new(),
            checkpoint_serial_numbers_received: AHashSet::new(),
            reports_to_send: VecDeque::new(),
            active_report_timers: AHashSet::new(),
            next_report_serial_number: initial_report_serial_number,
            length_of_red_part: None,
            red_part_is_end_of_block: false,
            lowest_green_offset_received: u64::MAX,
            current_red_length: 0,
            did_red_part_callback: false,
            did_notify_for_deletion: false,
            received_end_of_block: false,
            last_segment_received: Instant::now(),
        }
    }

    /// Report serial numbers with live timers, for cleanup on erase.
    pub fn active_report_timers(&self) -> impl Iterator<Item = u64> + '_ {
        self.active_report_timers.iter().copied()
    }

    pub fn has_producible_data(&self) -> bool {
        !self.reports_to_send.is_empty()
    }

    /// When the last data segment arrived, for stagnation housekeeping.
    pub fn last_segment_received(&self) -> Instant {
        self.last_segment_received
    }

    fn notify_needs_deleted(
        &mut self,
        notices: &mut VecDeque<SessionNotice>,
        cancelled: bool,
        reason: CancelReason,
    ) {
        if !self.did_notify_for_deletion {
            self.did_notify_for_deletion = true;
            notices.push_back(SessionNotice::ReceiverNeedsDeleted {
                session_id: self.session_id,
                cancelled,
                reason,
            });
        }
    }

    /// Dequeue the next queued report and start its retransmission timer.
    pub fn next_data_to_send(&mut self, ctx: &mut ReceiverContext) -> Option<OutboundPacket> {
        while let Some((report_serial_number, retry_count)) = self.reports_to_send.pop_front() {
            let Some(report) = self.all_report_segments_sent.get(&report_serial_number) else {
                log::error!(
                    "queued report segment is unknown: session={}, rsn={}",
                    self.session_id,
                    report_serial_number
                );
                continue;
            };

            let mut bytes = BytesMut::with_capacity(64 + report.claims.len() * 20);
            report.encode(self.session_id, &mut bytes);

            let key = TimerKey {
                serial_number: report_serial_number,
                session_number: self.session_id.number,
            };
            let mut user_data = ctx.recycler.take();
            write_report_timer_data(self.session_id.originator, retry_count, &mut user_data);
            if ctx.timers.start(key, user_data) {
                self.active_report_timers.insert(report_serial_number);
            }

            return Some(OutboundPacket {
                fragments: vec![bytes.freeze()],
                remote_engine_id: self.session_id.originator,
            });
        }

        None
    }

    /// Handle an inbound data segment of either color.
    pub fn data_segment_received(
        &mut self,
        segment_type: SegmentType,
        payload: Vec<u8>,
        metadata: &DataSegmentMetadata,
        ctx: &mut ReceiverContext,
    ) {
        debug_assert!(segment_type.is_data());
        debug_assert_eq!(payload.len() as u64, metadata.length);

        self.last_segment_received = Instant::now();

        if segment_type.is_end_of_block() {
            self.received_end_of_block = true;
        }

        if segment_type.is_red() {
            self.red_data_segment_received(segment_type, payload, metadata, ctx);
        } else {
            self.green_data_segment_received(segment_type, payload, metadata, ctx);
        }
    }

    fn red_data_segment_received(
        &mut self,
        segment_type: SegmentType,
        payload: Vec<u8>,
        metadata: &DataSegmentMetadata,
        ctx: &mut ReceiverContext,
    ) {
        let offset_plus_length = metadata.offset + metadata.length;
        self.current_red_length = self.current_red_length.max(offset_plus_length);

        // red data is the block prefix: it may never reach past the lowest
        // green offset seen in this session
        if self.current_red_length > self.lowest_green_offset_received {
            self.notify_needs_deleted(ctx.notices, true, CancelReason::Miscolored);
            return;
        }

        if self.did_red_part_callback {
            return;
        }

        if self.current_red_length > ctx.max_red_rx_bytes {
            log::warn!(
                "red data length {} exceeds the per-session maximum of {}: session={}",
                self.current_red_length,
                ctx.max_red_rx_bytes,
                self.session_id
            );
            self.notify_needs_deleted(ctx.notices, true, CancelReason::SystemCancelled);
            return;
        }

        if (self.data_received_red.len() as u64) < offset_plus_length {
            self.data_received_red.resize(offset_plus_length as usize, 0);
        }
        self.data_received_red[metadata.offset as usize..offset_plus_length as usize]
            .copy_from_slice(&payload);

        self.received_fragments
            .insert(metadata.offset, offset_plus_length - 1);

        if segment_type.is_end_of_red_part() {
            self.length_of_red_part = Some(offset_plus_length);
            self.red_part_is_end_of_block = segment_type.is_end_of_block();
        }

        if segment_type.is_checkpoint() {
            self.checkpoint_received(metadata, ctx);
        }

        self.try_deliver_red_part(ctx);
    }

    fn checkpoint_received(&mut self, metadata: &DataSegmentMetadata, ctx: &mut ReceiverContext) {
        let (Some(checkpoint_serial_number), Some(report_serial_number)) =
            (metadata.checkpoint_serial_number, metadata.report_serial_number)
        else {
            log::error!(
                "checkpoint without serial numbers: session={}",
                self.session_id
            );
            return;
        };

        // retransmitted checkpoints keep their serial number; respond once
        if !self
            .checkpoint_serial_numbers_received
            .insert(checkpoint_serial_number)
        {
            return;
        }

        // the report's upper bound is the checkpoint's upper bound
        let upper_bound = metadata.offset + metadata.length;

        let is_response_to_report = report_serial_number != 0;
        let lower_bound = if is_response_to_report {
            // secondary report: scope starts where the report that caused
            // this checkpoint started
            match self.all_report_segments_sent.get(&report_serial_number) {
                Some(report) => report.lower_bound,
                None => {
                    log::warn!(
                        "checkpoint references an unknown report: session={}, rsn={}",
                        self.session_id,
                        report_serial_number
                    );
                    0
                }
            }
        } else {
            // primary report: scope starts at the previous primary's upper
            // bound, zero for the first
            self.primary_report_segments_sent
                .values()
                .next_back()
                .map_or(0, |report| report.upper_bound)
        };

        // out-of-order discretionary checkpoints can invert the scope, in
        // which case no report is issued
        if lower_bound >= upper_bound {
            ctx.stats.report_segments_unable_to_be_issued += 1;
            return;
        }

        let Some(report) = self
            .received_fragments
            .populate_report_segment(lower_bound, upper_bound)
        else {
            log::error!(
                "no received data within report scope [{}, {}): session={}",
                lower_bound,
                upper_bound,
                self.session_id
            );
            return;
        };

        let mut reports = vec![report];
        if reports[0].claims.len() as u64 > ctx.max_reception_claims {
            // the claim list does not fit one segment: split the scope so
            // every piece stands on its own
            let pieces = fragment::split_report_segment(&reports[0], ctx.max_reception_claims);
            ctx.stats.report_segments_too_large_and_needing_split += 1;
            ctx.stats.report_segments_created_via_split += pieces.len() as u64;
            reports = pieces;
        }

        for mut report in reports {
            report.checkpoint_serial_number = checkpoint_serial_number;

            let report_serial_number = self.next_report_serial_number;
            self.next_report_serial_number += 1;
            report.report_serial_number = report_serial_number;

            if !is_response_to_report {
                self.primary_report_segments_sent
                    .insert(report_serial_number, report.clone());
            }
            self.all_report_segments_sent
                .insert(report_serial_number, report);
            self.reports_to_send.push_back((report_serial_number, 1));
        }

        ctx.notices.push_back(SessionNotice::ReceiverHasData {
            session_id: self.session_id,
        });
    }

    fn try_deliver_red_part(&mut self, ctx: &mut ReceiverContext) {
        let Some(length_of_red_part) = self.length_of_red_part else {
            return;
        };

        if self.did_red_part_callback
            || length_of_red_part == 0
            || !self.received_fragments.contains(0, length_of_red_part - 1)
        {
            return;
        }

        self.did_red_part_callback = true;
        ctx.notices.push_back(SessionNotice::RedPartReception {
            session_id: self.session_id,
            payload: std::mem::take(&mut self.data_received_red),
            length_of_red_part,
            client_service_id: self.client_service_id,
            is_end_of_block: self.red_part_is_end_of_block,
        });
    }

    fn green_data_segment_received(
        &mut self,
        segment_type: SegmentType,
        payload: Vec<u8>,
        metadata: &DataSegmentMetadata,
        ctx: &mut ReceiverContext,
    ) {
        self.lowest_green_offset_received =
            self.lowest_green_offset_received.min(metadata.offset);

        // the mirror image of the red-side check: green data is the block
        // suffix and may never start below red bytes already received
        if self.current_red_length > self.lowest_green_offset_received {
            self.notify_needs_deleted(ctx.notices, true, CancelReason::Miscolored);
            return;
        }

        // green data is never buffered
        ctx.notices.push_back(SessionNotice::GreenPartSegmentArrival {
            session_id: self.session_id,
            payload,
            offset_start_of_block: metadata.offset,
            client_service_id: self.client_service_id,
            is_end_of_block: segment_type.is_end_of_block(),
        });

        if segment_type.is_end_of_block() {
            // a green end of block closes the session when the session
            // never had red data, or the red part was already delivered
            let no_red_segments_received =
                self.length_of_red_part.is_none() && self.received_fragments.is_empty();
            if no_red_segments_received || self.did_red_part_callback {
                self.notify_needs_deleted(ctx.notices, false, CancelReason::Reserved);
            }
        }
    }

    /// The peer acknowledged one of this session's reports.
    pub fn report_ack_received(&mut self, report_serial_number: u64, ctx: &mut ReceiverContext) {
        let key = TimerKey {
            serial_number: report_serial_number,
            session_number: self.session_id.number,
        };
        if let Some(user_data) = ctx.timers.delete(&key) {
            ctx.recycler.give(user_data);
            self.active_report_timers.remove(&report_serial_number);
        }

        // the session closes once nothing remains outstanding and both the
        // end of block and the full red part have been seen
        if self.reports_to_send.is_empty()
            && self.active_report_timers.is_empty()
            && self.received_end_of_block
            && self.did_red_part_callback
        {
            self.notify_needs_deleted(ctx.notices, false, CancelReason::Reserved);
        }
    }

    /// A report's acknowledgement never arrived: queue the same report
    /// again within the retry budget, cancel the session beyond it.
    pub fn report_timer_expired(
        &mut self,
        report_serial_number: u64,
        retry_count: u32,
        ctx: &mut ReceiverContext,
    ) {
        ctx.stats.report_segment_timer_expired_callbacks += 1;
        self.active_report_timers.remove(&report_serial_number);

        if retry_count <= ctx.max_retries {
            self.reports_to_send
                .push_back((report_serial_number, retry_count + 1));
            ctx.notices.push_back(SessionNotice::ReceiverHasData {
                session_id: self.session_id,
            });
        } else {
            self.notify_needs_deleted(
                ctx.notices,
                true,
                CancelReason::RetransmitLimitExceeded,
            );
        }
    }
}
