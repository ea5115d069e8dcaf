use std::collections::VecDeque;

use ahash::AHashSet;

/// Remembers recently closed session numbers of one remote engine.
///
/// A receiver session is created implicitly by the first data segment that
/// carries a new session id, so a late-arriving retransmission for a
/// session that was just closed would silently resurrect it. The engine
/// keeps one bounded ring of closed session numbers per originator and
/// refuses to re-create a session it remembers.
///
/// # Test
///
/// ```
/// use ltp_server_engine::recreation::SessionRecreationPreventer;
///
/// let mut preventer = SessionRecreationPreventer::new(2);
///
/// assert!(preventer.add(10));
/// assert!(preventer.add(11));
/// assert!(!preventer.add(11));
/// assert!(preventer.contains(10));
///
/// // the ring is bounded: adding a third evicts the oldest
/// assert!(preventer.add(12));
/// assert!(!preventer.contains(10));
/// assert!(preventer.contains(11));
/// assert!(preventer.contains(12));
/// ```
pub struct SessionRecreationPreventer {
    ring: VecDeque<u64>,
    known: AHashSet<u64>,
    capacity: usize,
}

impl SessionRecreationPreventer {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);

        Self {
            ring: VecDeque::with_capacity(capacity),
            known: AHashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, session_number: u64) -> bool {
        self.known.contains(&session_number)
    }

    /// Remember a closed session number, evicting the oldest remembered
    /// number once the ring is full. Returns false when the number was
    /// already remembered.
    pub fn add(&mut self, session_number: u64) -> bool {
        if !self.known.insert(session_number) {
            return false;
        }

        if self.ring.len() == self.capacity
            && let Some(oldest) = self.ring.pop_front()
        {
            self.known.remove(&oldest);
        }

        self.ring.push_back(session_number);
        true
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
