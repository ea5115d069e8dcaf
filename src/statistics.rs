use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed in the statistics channel
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    ErrorPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-peer transfer counters
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub error_pkts: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use ltp_server::statistics::*;
    ///
    /// let counts = Counts {
    ///     received_bytes: Count::default(),
    ///     send_bytes: Count::default(),
    ///     received_pkts: Count::default(),
    ///     send_pkts: Count::default(),
    ///     error_pkts: Count::default(),
    /// };
    ///
    /// counts.add(&Stats::ReceivedBytes(1));
    /// assert_eq!(counts.received_bytes.get(), 1);
    ///
    /// counts.add(&Stats::SendPkts(1));
    /// assert_eq!(counts.send_pkts.get(), 1);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v),
        }
    }
}

/// Transfer statistics, one entry per remote engine
#[derive(Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<u64, Counts<Count>>>>);

impl Default for Statistics {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(16))))
    }
}

impl Statistics {
    /// get signal sender
    ///
    /// The signal sender can notify the statistics instance to update the
    /// internal statistics.
    ///
    /// # Example
    ///
    /// ```
    /// use ltp_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    /// let reporter = statistics.get_reporter();
    ///
    /// statistics.register(200);
    /// reporter.send(200, &[Stats::ReceivedBytes(100)]);
    ///
    /// assert_eq!(statistics.get(200).map(|it| it.received_bytes), Some(100));
    /// ```
    pub fn get_reporter(&self) -> StatisticsReporter {
        StatisticsReporter(self.0.clone())
    }

    /// Add an engine to the watch list
    ///
    /// # Example
    ///
    /// ```
    /// use ltp_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register(200);
    /// assert!(statistics.get(200).is_some());
    /// ```
    pub fn register(&self, engine_id: u64) {
        self.0.write().insert(
            engine_id,
            Counts {
                received_bytes: Count::default(),
                send_bytes: Count::default(),
                received_pkts: Count::default(),
                send_pkts: Count::default(),
                error_pkts: Count::default(),
            },
        );
    }

    /// Remove an engine from the watch list
    ///
    /// # Example
    ///
    /// ```
    /// use ltp_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register(200);
    /// assert!(statistics.get(200).is_some());
    ///
    /// statistics.unregister(200);
    /// assert!(statistics.get(200).is_none());
    /// ```
    pub fn unregister(&self, engine_id: u64) {
        self.0.write().remove(&engine_id);
    }

    /// Obtain a snapshot of an engine's counters
    pub fn get(&self, engine_id: u64) -> Option<Counts<usize>> {
        self.0.read().get(&engine_id).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
            error_pkts: counts.error_pkts.get(),
        })
    }
}

/// statistics reporter
///
/// It is held by the server loop, and status information can be sent to
/// the statistics instance through this reporter to update the internal
/// statistical information of an engine.
#[derive(Clone)]
pub struct StatisticsReporter(Arc<RwLock<AHashMap<u64, Counts<Count>>>>);

impl StatisticsReporter {
    pub fn send(&self, engine_id: u64, reports: &[Stats]) {
        if let Some(counts) = self.0.read().get(&engine_id) {
            for report in reports {
                counts.add(report);
            }
        }
    }
}
