use std::{
    cell::RefCell,
    collections::BTreeSet,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use codec::segment::SegmentType;
use ltp_server_engine::{CancelReason, Engine, EngineHandler, EngineOptions, SessionId};

const ENGINE_ID_SRC: u64 = 100;
const ENGINE_ID_DEST: u64 = 200;
const CLIENT_SERVICE_ID: u64 = 300;

const RED_TEXT: &[u8] = b"The quick brown fox jumps over the lazy dog!";
const TOO_MUCH_RED_TEXT: &[u8] = b"The quick brown fox jumps over the lazy dog! 12345678910";
// G => green data, E => green data end of block
const RED_AND_GREEN_TEXT: &[u8] = b"The quick brown fox jumps over the lazy dog!GGE";
const FULLY_GREEN_TEXT: &[u8] = b"GGGGGGGGGGGGGGGGGE";

#[derive(Default)]
struct Events {
    session_starts: u64,
    session_ids: Vec<SessionId>,
    red_part_receptions: u64,
    red_part_receptions_end_of_block: u64,
    red_payload: Vec<u8>,
    red_client_service_id: u64,
    green_arrivals: u64,
    green_offsets: BTreeSet<u64>,
    green_end_of_block_payload: Vec<u8>,
    reception_cancelled: u64,
    reception_cancel_reason: Option<CancelReason>,
    transmission_completed: u64,
    initial_transmission_completed: u64,
    transmission_cancelled: u64,
    transmission_cancel_reason: Option<CancelReason>,
}

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Events>>);

impl EngineHandler for Recorder {
    fn on_session_start(&self, session_id: &SessionId) {
        let mut events = self.0.borrow_mut();
        events.session_starts += 1;
        events.session_ids.push(*session_id);
    }

    fn on_red_part_reception(
        &self,
        _: &SessionId,
        payload: Vec<u8>,
        length_of_red_part: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    ) {
        let mut events = self.0.borrow_mut();
        events.red_part_receptions += 1;
        events.red_part_receptions_end_of_block += is_end_of_block as u64;
        events.red_client_service_id = client_service_id;
        assert_eq!(payload.len() as u64, length_of_red_part);
        events.red_payload = payload;
    }

    fn on_green_part_segment_arrival(
        &self,
        _: &SessionId,
        payload: Vec<u8>,
        offset_start_of_block: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    ) {
        let mut events = self.0.borrow_mut();
        events.green_arrivals += 1;
        assert!(events.green_offsets.insert(offset_start_of_block));
        assert_eq!(client_service_id, CLIENT_SERVICE_ID);
        if is_end_of_block {
            events.green_end_of_block_payload = payload;
        }
    }

    fn on_reception_session_cancelled(&self, _: &SessionId, reason: CancelReason) {
        let mut events = self.0.borrow_mut();
        events.reception_cancelled += 1;
        events.reception_cancel_reason = Some(reason);
    }

    fn on_transmission_session_completed(&self, _: &SessionId) {
        self.0.borrow_mut().transmission_completed += 1;
    }

    fn on_initial_transmission_completed(&self, _: &SessionId, _: &Bytes) {
        self.0.borrow_mut().initial_transmission_completed += 1;
    }

    fn on_transmission_session_cancelled(&self, _: &SessionId, reason: CancelReason, _: &Bytes) {
        let mut events = self.0.borrow_mut();
        events.transmission_cancelled += 1;
        events.transmission_cancel_reason = Some(reason);
    }
}

fn test_options(this_engine_id: u64) -> EngineOptions {
    EngineOptions {
        this_engine_id,
        engine_index: 1,
        mtu_client_service_data: 1,
        max_reception_claims: u64::MAX,
        one_way_light_time: Duration::from_secs(10),
        one_way_margin_time: Duration::from_secs(2),
        estimated_bytes_to_receive_per_session: 0,
        max_red_rx_bytes_per_session: 50,
        checkpoint_every_nth_data_packet: 0,
        max_retries_per_serial_number: 5,
        force_32_bit_random_numbers: false,
        max_send_rate_bits_per_sec: 0,
        max_simultaneous_sessions: 100,
        session_recreation_preventer_history_size: 1000,
    }
}

struct Harness {
    src: Engine<Recorder>,
    dest: Engine<Recorder>,
    src_events: Recorder,
    dest_events: Recorder,
    src_to_dest_count: u64,
    dest_to_src_count: u64,
}

fn packet_bytes(packet: &ltp_server_engine::OutboundPacket) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(packet.total_length());
    for fragment in &packet.fragments {
        bytes.extend_from_slice(fragment);
    }
    bytes
}

impl Harness {
    fn new() -> Self {
        Self::with_options(test_options(ENGINE_ID_SRC), test_options(ENGINE_ID_DEST))
    }

    fn with_options(tx_options: EngineOptions, rx_options: EngineOptions) -> Self {
        let src_events = Recorder::default();
        let dest_events = Recorder::default();
        Self {
            src: Engine::new(tx_options, src_events.clone()),
            dest: Engine::new(rx_options, dest_events.clone()),
            src_events,
            dest_events,
            src_to_dest_count: 0,
            dest_to_src_count: 0,
        }
    }

    fn request(&mut self, data: &[u8], length_of_red_part: u64) -> SessionId {
        self.src.transmission_request(
            CLIENT_SERVICE_ID,
            ENGINE_ID_DEST,
            Bytes::copy_from_slice(data),
            length_of_red_part,
            Bytes::new(),
        )
    }

    fn send_one(
        from: &mut Engine<Recorder>,
        to: &mut Engine<Recorder>,
        simulate_drop: bool,
        swap_header: Option<SegmentType>,
    ) -> bool {
        let Some(packet) = from.next_packet_to_send() else {
            return false;
        };

        if !simulate_drop {
            let mut bytes = packet_bytes(&packet);
            if let Some(segment_type) = swap_header {
                bytes[0] = segment_type.into();
            }
            to.packet_in(&bytes).unwrap();
        }

        true
    }

    /// One ping-pong iteration; false once neither side produced a packet.
    fn exchange_once(
        &mut self,
        drop_src_to_dest: bool,
        swap_src_to_dest: Option<SegmentType>,
    ) -> bool {
        let did_src_to_dest =
            Self::send_one(&mut self.src, &mut self.dest, drop_src_to_dest, swap_src_to_dest);
        let did_dest_to_src = Self::send_one(&mut self.dest, &mut self.src, false, None);
        self.src_to_dest_count += did_src_to_dest as u64;
        self.dest_to_src_count += did_dest_to_src as u64;
        did_src_to_dest || did_dest_to_src
    }

    fn exchange_all(&mut self, mut policy: impl FnMut(u64) -> (bool, Option<SegmentType>)) {
        let mut count = 0;
        loop {
            let (drop, swap) = policy(count);
            if !self.exchange_once(drop, swap) {
                break;
            }
            count += 1;
            assert!(count < 10_000, "exchange did not converge");
        }
    }

    fn assert_no_active_sessions(&self) {
        assert_eq!(self.src.num_active_senders(), 0);
        assert_eq!(self.src.num_active_receivers(), 0);
        assert_eq!(self.dest.num_active_senders(), 0);
        assert_eq!(self.dest.num_active_receivers(), 0);
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

#[test]
fn clean_red_delivery() {
    let mut harness = Harness::new();
    let session_id = harness.request(RED_TEXT, RED_TEXT.len() as u64);

    assert_eq!(harness.src.num_active_senders(), 1);
    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    // 44 data segments (the last one a checkpoint) plus one report ack
    assert_eq!(harness.src_to_dest_count, RED_TEXT.len() as u64 + 1);
    // one report segment
    assert_eq!(harness.dest_to_src_count, 1);

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(src.session_starts, 1);
    assert_eq!(src.session_ids, vec![session_id]);
    assert_eq!(dest.session_starts, 1);
    assert_eq!(dest.session_ids, vec![session_id]);
    assert_eq!(dest.red_part_receptions, 1);
    assert_eq!(dest.red_part_receptions_end_of_block, 1);
    assert_eq!(dest.red_payload, RED_TEXT);
    assert_eq!(dest.red_client_service_id, CLIENT_SERVICE_ID);
    assert_eq!(dest.green_arrivals, 0);
    assert_eq!(dest.reception_cancelled, 0);
    assert_eq!(src.transmission_completed, 1);
    assert_eq!(src.initial_transmission_completed, 1);
    assert_eq!(src.transmission_cancelled, 0);
}

#[test]
fn one_dropped_red_segment() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    harness.exchange_all(|count| (count == 10, None));
    harness.assert_no_active_sessions();

    // two report acks and one resend on top of the block
    assert_eq!(harness.src_to_dest_count, RED_TEXT.len() as u64 + 3);
    // the primary report plus the gap-closing secondary report
    assert_eq!(harness.dest_to_src_count, 2);

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 1);
    assert_eq!(dest.red_part_receptions_end_of_block, 1);
    assert_eq!(dest.red_payload, RED_TEXT);
    assert_eq!(src.transmission_completed, 1);
    assert_eq!(src.initial_transmission_completed, 1);
    assert_eq!(dest.reception_cancelled, 0);
    assert_eq!(src.transmission_cancelled, 0);
}

#[test]
fn two_dropped_red_segments() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    harness.exchange_all(|count| (count == 10 || count == 13, None));
    harness.assert_no_active_sessions();

    // two report acks and two resends
    assert_eq!(harness.src_to_dest_count, RED_TEXT.len() as u64 + 4);
    assert_eq!(harness.dest_to_src_count, 2);

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 1);
    assert_eq!(dest.red_part_receptions_end_of_block, 1);
    assert_eq!(dest.red_payload, RED_TEXT);
    assert_eq!(src.transmission_completed, 1);
}

#[test]
fn two_consecutive_dropped_red_segments() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    harness.exchange_all(|count| (count == 10 || count == 11, None));
    harness.assert_no_active_sessions();

    // the two-byte gap does not fit one segment at this MTU, so two
    // resends are still needed
    assert_eq!(harness.src_to_dest_count, RED_TEXT.len() as u64 + 4);
    assert_eq!(harness.dest_to_src_count, 2);

    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 1);
    assert_eq!(dest.red_payload, RED_TEXT);
}

#[test]
fn discretionary_checkpoints_drive_periodic_reports() {
    let mut harness = Harness::new();
    harness.src.set_checkpoint_every_nth_data_packet(5);
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    // eight discretionary checkpoints at offsets 4, 9, .., 39 plus the
    // end-of-red-part checkpoint, each drawing a report and an ack
    assert_eq!(harness.dest_to_src_count, 9);
    assert_eq!(harness.src_to_dest_count, RED_TEXT.len() as u64 + 9);

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 1);
    assert_eq!(dest.red_payload, RED_TEXT);
    assert_eq!(src.transmission_completed, 1);
}

#[test]
fn dropped_discretionary_checkpoint_is_not_resent_once_acked() {
    let mut harness = Harness::new();
    harness.src.set_checkpoint_every_nth_data_packet(5);
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    // drop the first discretionary checkpoint (offset 4), then run far
    // enough for the next checkpoint's report to recover the gap
    for count in 0..13 {
        assert!(harness.exchange_once(count == 4, None));
    }

    // the dropped checkpoint's timer fires; its bytes are already
    // acknowledged through the recovery reports, so nothing is resent
    assert_eq!(harness.src.advance_timers(far_future()), 1);
    assert_eq!(harness.src.stats().checkpoint_timer_expired_callbacks, 1);
    assert_eq!(harness.src.stats().discretionary_checkpoints_not_resent, 1);

    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 1);
    assert_eq!(dest.red_payload, RED_TEXT);
    assert_eq!(src.transmission_completed, 1);
    assert_eq!(src.transmission_cancelled, 0);
    assert_eq!(dest.reception_cancelled, 0);
}

#[test]
fn red_and_green_mixed() {
    let mut harness = Harness::new();
    harness.request(RED_AND_GREEN_TEXT, RED_TEXT.len() as u64);

    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    assert_eq!(
        harness.src_to_dest_count,
        RED_AND_GREEN_TEXT.len() as u64 + 1
    );
    assert_eq!(harness.dest_to_src_count, 1);

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 1);
    // green data follows, so the red part is not the end of the block
    assert_eq!(dest.red_part_receptions_end_of_block, 0);
    assert_eq!(dest.red_payload, RED_TEXT);
    assert_eq!(dest.green_arrivals, 3);
    assert_eq!(
        dest.green_offsets,
        BTreeSet::from([44, 45, 46])
    );
    assert_eq!(dest.green_end_of_block_payload, b"E");
    assert_eq!(src.transmission_completed, 1);
    assert_eq!(src.initial_transmission_completed, 1);
}

#[test]
fn fully_green_block() {
    let mut harness = Harness::new();
    harness.request(FULLY_GREEN_TEXT, 0);

    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    // green data draws no reports and no acks at all
    assert_eq!(harness.src_to_dest_count, FULLY_GREEN_TEXT.len() as u64);
    assert_eq!(harness.dest_to_src_count, 0);

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.session_starts, 1);
    assert_eq!(dest.red_part_receptions, 0);
    assert_eq!(dest.green_arrivals, FULLY_GREEN_TEXT.len() as u64);
    assert_eq!(
        dest.green_offsets,
        (0..FULLY_GREEN_TEXT.len() as u64).collect::<BTreeSet<_>>()
    );
    assert_eq!(src.transmission_completed, 1);
    assert_eq!(src.initial_transmission_completed, 1);
}

#[test]
fn miscolored_red_after_green() {
    let mut harness = Harness::new();
    harness.request(FULLY_GREEN_TEXT, FULLY_GREEN_TEXT.len() as u64);

    // red, red, a segment rewritten to green in flight, then red again:
    // the second red segment violates the color ordering
    harness.exchange_all(|count| (false, (count == 2).then_some(SegmentType::GreenData)));
    harness.assert_no_active_sessions();

    // four data segments reached the receiver, one cancel ack went back
    // after the receiver's cancel
    assert_eq!(harness.src_to_dest_count, 5);
    assert_eq!(harness.dest_to_src_count, 1);

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 0);
    assert_eq!(dest.green_arrivals, 1);
    assert_eq!(dest.green_offsets, BTreeSet::from([2]));
    assert_eq!(dest.reception_cancelled, 1);
    assert_eq!(
        dest.reception_cancel_reason,
        Some(CancelReason::Miscolored)
    );
    assert_eq!(src.transmission_completed, 0);
    assert_eq!(src.initial_transmission_completed, 0);
    assert_eq!(src.transmission_cancelled, 1);
    assert_eq!(
        src.transmission_cancel_reason,
        Some(CancelReason::Miscolored)
    );
}

#[test]
fn oversized_red_part_is_system_cancelled() {
    let mut harness = Harness::new();
    harness.request(TOO_MUCH_RED_TEXT, TOO_MUCH_RED_TEXT.len() as u64);

    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 0);
    assert_eq!(dest.reception_cancelled, 1);
    assert_eq!(
        dest.reception_cancel_reason,
        Some(CancelReason::SystemCancelled)
    );
    assert_eq!(src.transmission_completed, 0);
    assert_eq!(src.transmission_cancelled, 1);
    assert_eq!(
        src.transmission_cancel_reason,
        Some(CancelReason::SystemCancelled)
    );
}

#[test]
fn checkpoint_loss_recovers_through_the_timer() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    // drop the end-of-red-part checkpoint; without it the receiver stays
    // silent and only the checkpoint timer can recover the session
    harness.exchange_all(|count| (count == 43, None));
    assert_eq!(harness.dest_to_src_count, 0);
    assert_eq!(harness.src.num_active_senders(), 1);

    assert_eq!(harness.src.advance_timers(far_future()), 1);
    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(harness.src.stats().checkpoint_timer_expired_callbacks, 1);
    assert_eq!(dest.red_part_receptions, 1);
    assert_eq!(dest.red_payload, RED_TEXT);
    assert_eq!(src.transmission_completed, 1);
}

#[test]
fn checkpoint_retransmit_limit_cancels_with_rlexc() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    // the link is completely dead in both directions
    for _ in 0..RED_TEXT.len() {
        assert!(Harness::send_one(&mut harness.src, &mut harness.dest, true, None));
    }

    // five retries then the sixth expiry exhausts the budget
    for _ in 0..6 {
        assert_eq!(harness.src.advance_timers(far_future()), 1);
        while Harness::send_one(&mut harness.src, &mut harness.dest, true, None) {}
    }

    assert_eq!(harness.src.num_active_senders(), 0);
    assert_eq!(harness.src.stats().checkpoint_timer_expired_callbacks, 6);

    let src = harness.src_events.0.borrow();
    assert_eq!(src.transmission_completed, 0);
    assert_eq!(src.initial_transmission_completed, 1);
    assert_eq!(src.transmission_cancelled, 1);
    assert_eq!(
        src.transmission_cancel_reason,
        Some(CancelReason::RetransmitLimitExceeded)
    );
}

#[test]
fn report_retransmit_limit_cancels_with_rlexc() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    // deliver the whole block but lose every report on the way back
    loop {
        let src_sent = Harness::send_one(&mut harness.src, &mut harness.dest, false, None);
        let dest_sent = Harness::send_one(&mut harness.dest, &mut harness.src, true, None);
        if !src_sent && !dest_sent {
            break;
        }
    }

    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.red_part_receptions, 1);
    drop(dest);

    // every report retry times out
    for _ in 0..6 {
        assert_eq!(harness.dest.advance_timers(far_future()), 1);
        while Harness::send_one(&mut harness.dest, &mut harness.src, true, None) {}
    }

    assert_eq!(harness.dest.num_active_receivers(), 0);
    assert_eq!(
        harness.dest.stats().report_segment_timer_expired_callbacks,
        6
    );

    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.reception_cancelled, 1);
    assert_eq!(
        dest.reception_cancel_reason,
        Some(CancelReason::RetransmitLimitExceeded)
    );
}

#[test]
fn closed_sessions_are_not_recreated_by_stale_segments() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    // capture the first data segment for replay
    let packet = harness.src.next_packet_to_send().unwrap();
    let stale_segment = packet_bytes(&packet);
    harness.dest.packet_in(&stale_segment).unwrap();
    harness.src_to_dest_count += 1;

    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    let starts_before = harness.dest_events.0.borrow().session_starts;
    harness.dest.packet_in(&stale_segment).unwrap();

    assert_eq!(harness.dest.num_active_receivers(), 0);
    assert_eq!(harness.dest_events.0.borrow().session_starts, starts_before);
    assert!(harness.dest.next_packet_to_send().is_none());
}

#[test]
fn reception_session_cap_rejects_new_sessions() {
    let mut rx_options = test_options(ENGINE_ID_DEST);
    rx_options.max_simultaneous_sessions = 0;
    let mut harness = Harness::with_options(test_options(ENGINE_ID_SRC), rx_options);

    harness.request(RED_TEXT, RED_TEXT.len() as u64);
    for _ in 0..RED_TEXT.len() {
        assert!(Harness::send_one(&mut harness.src, &mut harness.dest, false, None));
    }

    assert_eq!(harness.dest.num_active_receivers(), 0);
    assert_eq!(harness.dest_events.0.borrow().session_starts, 0);
    assert!(harness.dest.next_packet_to_send().is_none());
}

#[test]
fn stagnant_reception_sessions_are_cancelled_by_housekeeping() {
    let mut harness = Harness::new();
    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    // a few red segments arrive, then the link goes quiet with no
    // checkpoint ever delivered
    for _ in 0..5 {
        assert!(Harness::send_one(&mut harness.src, &mut harness.dest, false, None));
    }
    assert_eq!(harness.dest.num_active_receivers(), 1);

    harness.dest.housekeeping(far_future());

    assert_eq!(harness.dest.num_active_receivers(), 0);
    let dest = harness.dest_events.0.borrow();
    assert_eq!(dest.reception_cancelled, 1);
    assert_eq!(
        dest.reception_cancel_reason,
        Some(CancelReason::UserCancelled)
    );
    drop(dest);

    // the cancel segment still goes out to the (presumably dead) sender
    let packet = harness.dest.next_packet_to_send().unwrap();
    assert_eq!(packet.remote_engine_id, ENGINE_ID_SRC);
}

#[test]
fn cancellation_request_tears_down_both_sides() {
    let mut harness = Harness::new();
    let session_id = harness.request(RED_TEXT, RED_TEXT.len() as u64);

    for _ in 0..3 {
        assert!(harness.exchange_once(false, None));
    }

    assert!(harness.src.cancellation_request(&session_id));
    assert!(!harness.src.cancellation_request(&session_id));
    assert_eq!(harness.src.num_active_senders(), 0);

    harness.exchange_all(|_| (false, None));
    harness.assert_no_active_sessions();

    let src = harness.src_events.0.borrow();
    let dest = harness.dest_events.0.borrow();
    assert_eq!(src.transmission_cancelled, 1);
    assert_eq!(
        src.transmission_cancel_reason,
        Some(CancelReason::UserCancelled)
    );
    assert_eq!(dest.reception_cancelled, 1);
    assert_eq!(
        dest.reception_cancel_reason,
        Some(CancelReason::UserCancelled)
    );
}

#[test]
fn rate_limiter_defers_egress_until_refreshed() {
    let mut tx_options = test_options(ENGINE_ID_SRC);
    tx_options.max_send_rate_bits_per_sec = 800; // 100 bytes per second
    let mut harness = Harness::with_options(tx_options, test_options(ENGINE_ID_DEST));

    harness.request(RED_TEXT, RED_TEXT.len() as u64);

    let mut produced = 0;
    while harness.src.next_packet_to_send().is_some() {
        produced += 1;
        assert!(produced < 100, "rate limiter never engaged");
    }

    assert!(produced > 0);
    assert!(harness.src.stats().sends_deferred_by_rate_limiter > 0);

    // the refresh tick tops the bucket back up
    harness.src.refresh_rate_tokens(Duration::from_secs(1));
    assert!(harness.src.next_packet_to_send().is_some());
}

#[test]
fn session_ids_carry_the_engine_index() {
    let mut harness = Harness::new();
    let session_id = harness.request(RED_TEXT, RED_TEXT.len() as u64);

    assert_eq!(session_id.originator, ENGINE_ID_SRC);
    assert_eq!(
        ltp_server_engine::random::RandomNumberGenerator::engine_index_from_session_number(
            session_id.number
        ),
        1
    );
}
