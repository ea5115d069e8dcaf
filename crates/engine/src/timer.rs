use std::collections::VecDeque;
use std::hash::Hash;
use std::time::{Duration, Instant};

use ahash::AHashMap;

struct TimerData<D> {
    expiry: Instant,
    user_data: D,
}

/// Multiplexes many keyed timers onto a single deadline.
///
/// Every timer runs for the same duration, two round trips' worth of
/// one-way light time plus margin, so insertion order equals expiry order
/// and the pending timers form a plain FIFO queue with O(1) access to the
/// earliest deadline. Deletion by key is O(1): the map entry is removed
/// and the queue entry goes stale, to be skipped when it surfaces.
///
/// The engine's event loop drives expiry by polling with its own clock;
/// a timer deleted before the poll never fires, including a timer whose
/// deadline has technically already passed.
///
/// # Test
///
/// ```
/// use std::time::{Duration, Instant};
/// use ltp_server_engine::timer::TimerManager;
///
/// let mut timers: TimerManager<u64, &str> =
///     TimerManager::new(Duration::from_secs(10), Duration::from_secs(2));
///
/// assert!(timers.start(5, "a"));
/// assert!(!timers.start(5, "b"));
///
/// assert_eq!(timers.delete(&5), Some("a"));
/// assert_eq!(timers.poll_expired(Instant::now() + Duration::from_secs(60)), None);
/// ```
pub struct TimerManager<K, D> {
    queue: VecDeque<(K, Instant)>,
    live: AHashMap<K, TimerData<D>>,
    round_trip_time: Duration,
}

impl<K: Copy + Eq + Hash, D> TimerManager<K, D> {
    pub fn new(one_way_light_time: Duration, one_way_margin_time: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            live: AHashMap::new(),
            round_trip_time: (one_way_light_time + one_way_margin_time) * 2,
        }
    }

    /// Start a timer expiring one round trip from now. Returns false and
    /// does nothing when the key already has a live timer.
    pub fn start(&mut self, key: K, user_data: D) -> bool {
        if self.live.contains_key(&key) {
            return false;
        }

        let expiry = Instant::now() + self.round_trip_time;
        self.live.insert(key, TimerData { expiry, user_data });
        self.queue.push_back((key, expiry));
        true
    }

    /// Cancel a live timer, returning its user data.
    pub fn delete(&mut self, key: &K) -> Option<D> {
        self.live.remove(key).map(|data| data.user_data)
    }

    /// Earliest pending deadline, with stale queue entries discarded.
    pub fn next_expiry(&mut self) -> Option<Instant> {
        while let Some(&(key, expiry)) = self.queue.front() {
            if self.live.get(&key).is_some_and(|data| data.expiry == expiry) {
                return Some(expiry);
            }

            self.queue.pop_front();
        }

        None
    }

    /// Pop the next timer due at or before `now`, in FIFO start order.
    pub fn poll_expired(&mut self, now: Instant) -> Option<(K, D)> {
        while let Some(&(key, expiry)) = self.queue.front() {
            let live = self.live.get(&key).is_some_and(|data| data.expiry == expiry);
            if !live {
                self.queue.pop_front();
                continue;
            }

            if expiry > now {
                return None;
            }

            self.queue.pop_front();
            return self
                .live
                .remove(&key)
                .map(|data| (key, data.user_data));
        }

        None
    }

    /// Adopt a new light-time estimate, shifting every pending expiry by
    /// the change in round-trip time.
    pub fn update_round_trip_time(
        &mut self,
        one_way_light_time: Duration,
        one_way_margin_time: Duration,
    ) {
        let round_trip_time = (one_way_light_time + one_way_margin_time) * 2;
        if round_trip_time >= self.round_trip_time {
            let delta = round_trip_time - self.round_trip_time;
            for (_, expiry) in self.queue.iter_mut() {
                *expiry += delta;
            }
            for data in self.live.values_mut() {
                data.expiry += delta;
            }
        } else {
            let delta = self.round_trip_time - round_trip_time;
            for (_, expiry) in self.queue.iter_mut() {
                if let Some(earlier) = expiry.checked_sub(delta) {
                    *expiry = earlier;
                }
            }
            for data in self.live.values_mut() {
                if let Some(earlier) = data.expiry.checked_sub(delta) {
                    data.expiry = earlier;
                }
            }
        }

        self.round_trip_time = round_trip_time;
    }

    pub fn round_trip_time(&self) -> Duration {
        self.round_trip_time
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.live.clear();
    }
}

/// Bounded free-list of timer user-data buffers.
///
/// Timers attach a small serialized payload to every start, and sessions
/// start one timer per checkpoint or report; recycling the buffers keeps
/// the steady-state start/expire cycle allocation-free.
///
/// # Test
///
/// ```
/// use ltp_server_engine::timer::UserDataRecycler;
///
/// let mut recycler = UserDataRecycler::new(2);
///
/// let buf = recycler.take();
/// assert!(buf.is_empty());
///
/// assert!(recycler.give(vec![1, 2, 3]));
/// assert!(recycler.give(Vec::new()));
/// assert!(!recycler.give(Vec::new()));
///
/// // recycled buffers come back empty
/// assert!(recycler.take().is_empty());
/// ```
pub struct UserDataRecycler {
    buffers: Vec<Vec<u8>>,
    capacity: usize,
}

impl UserDataRecycler {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn take(&mut self) -> Vec<u8> {
        self.buffers
            .pop()
            .map(|mut buffer| {
                buffer.clear();
                buffer
            })
            .unwrap_or_default()
    }

    /// Return a buffer to the pool; false when the pool is full and the
    /// buffer is dropped instead.
    pub fn give(&mut self, buffer: Vec<u8>) -> bool {
        if self.buffers.len() < self.capacity {
            self.buffers.push(buffer);
            true
        } else {
            false
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TimerManager<u64, u32> {
        TimerManager::new(Duration::from_millis(10), Duration::from_millis(2))
    }

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn fires_in_fifo_start_order() {
        let mut timers = manager();
        for key in [3u64, 1, 4, 1, 5] {
            timers.start(key, key as u32 * 10);
        }

        assert_eq!(timers.len(), 4); // second start of key 1 was refused

        let mut fired = Vec::new();
        while let Some((key, data)) = timers.poll_expired(far_future()) {
            fired.push((key, data));
        }

        assert_eq!(fired, vec![(3, 30), (1, 10), (4, 40), (5, 50)]);
        assert!(timers.is_empty());
        assert_eq!(timers.next_expiry(), None);
    }

    #[test]
    fn deleted_timers_never_fire() {
        let mut timers = manager();
        for key in 0..10u64 {
            timers.start(key, key as u32);
        }

        for key in [0u64, 4, 9] {
            assert_eq!(timers.delete(&key), Some(key as u32));
        }
        assert_eq!(timers.delete(&4), None);

        let mut fired = Vec::new();
        while let Some((key, _)) = timers.poll_expired(far_future()) {
            fired.push(key);
        }

        assert_eq!(fired, vec![1, 2, 3, 5, 6, 7, 8]);
    }

    #[test]
    fn nothing_fires_before_the_deadline() {
        let mut timers = manager();
        timers.start(1, 0);

        assert_eq!(timers.poll_expired(Instant::now()), None);
        assert_eq!(timers.len(), 1);

        let expiry = timers.next_expiry().unwrap();
        assert_eq!(timers.poll_expired(expiry), Some((1, 0)));
    }

    #[test]
    fn restarting_a_deleted_key_times_from_the_restart() {
        let mut timers = manager();
        timers.start(7, 1);
        let first_expiry = timers.next_expiry().unwrap();

        timers.delete(&7);
        std::thread::sleep(Duration::from_millis(2));
        timers.start(7, 2);

        // the stale queue entry must not resurrect the first deadline
        let second_expiry = timers.next_expiry().unwrap();
        assert!(second_expiry > first_expiry);
        assert_eq!(timers.poll_expired(far_future()), Some((7, 2)));
        assert!(timers.is_empty());
    }

    #[test]
    fn round_trip_update_shifts_pending_expiries() {
        let mut timers = manager();
        timers.start(1, 0);
        let before = timers.next_expiry().unwrap();

        timers.update_round_trip_time(Duration::from_secs(5), Duration::from_millis(2));
        let after = timers.next_expiry().unwrap();

        assert_eq!(timers.round_trip_time(), Duration::from_secs(10) + Duration::from_millis(4));
        assert!(after > before);

        // shrinking the estimate pulls the deadline back in
        timers.update_round_trip_time(Duration::from_millis(10), Duration::from_millis(2));
        assert_eq!(timers.next_expiry().unwrap(), before);
    }
}
