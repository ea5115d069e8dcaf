use std::sync::Arc;

use bytes::Bytes;
use engine::{CancelReason, EngineHandler, SessionId};

use crate::{config::Config, statistics::Statistics};

/// Receives engine notices, logging them and keeping per-peer statistics
/// registered while sessions are alive.
#[derive(Clone)]
pub struct Observer {
    #[allow(unused)]
    config: Arc<Config>,
    statistics: Statistics,
}

impl Observer {
    pub fn new(config: Arc<Config>, statistics: Statistics) -> Self {
        Self { config, statistics }
    }
}

impl EngineHandler for Observer {
    fn on_session_start(&self, session_id: &SessionId) {
        log::info!("session start: session={}", session_id);

        self.statistics.register(session_id.originator);
    }

    fn on_red_part_reception(
        &self,
        session_id: &SessionId,
        payload: Vec<u8>,
        length_of_red_part: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    ) {
        log::info!(
            "red part received: session={}, bytes={}, client service={}, end of block={}",
            session_id,
            length_of_red_part,
            client_service_id,
            is_end_of_block
        );

        debug_assert_eq!(payload.len() as u64, length_of_red_part);
    }

    fn on_green_part_segment_arrival(
        &self,
        session_id: &SessionId,
        payload: Vec<u8>,
        offset_start_of_block: u64,
        client_service_id: u64,
        is_end_of_block: bool,
    ) {
        log::debug!(
            "green segment received: session={}, offset={}, bytes={}, client service={}, end of block={}",
            session_id,
            offset_start_of_block,
            payload.len(),
            client_service_id,
            is_end_of_block
        );
    }

    fn on_reception_session_cancelled(&self, session_id: &SessionId, reason: CancelReason) {
        log::warn!(
            "reception session cancelled: session={}, reason={:?}",
            session_id,
            reason
        );
    }

    fn on_transmission_session_completed(&self, session_id: &SessionId) {
        log::info!("transmission session completed: session={}", session_id);
    }

    fn on_initial_transmission_completed(&self, session_id: &SessionId, _user_data: &Bytes) {
        log::debug!(
            "initial transmission completed: session={}",
            session_id
        );
    }

    fn on_transmission_session_cancelled(
        &self,
        session_id: &SessionId,
        reason: CancelReason,
        _user_data: &Bytes,
    ) {
        log::warn!(
            "transmission session cancelled: session={}, reason={:?}",
            session_id,
            reason
        );
    }
}
