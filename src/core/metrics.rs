use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Snapshot of one pool's counters at a point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub pool_name: String,
    pub acquisitions: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub connection_attempts: u64,
    pub connections_created: u64,
    pub connection_failures: u64,
    pub average_wait_ms: f64,
    pub p95_wait_ms: f64,
    pub p99_wait_ms: f64,
}

/// Thread-safe counters for a connection pool
#[derive(Debug)]
pub struct PoolMetrics {
    pool_name: String,

    // Checkout counters
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    releases: AtomicU64,

    // Connection counters
    connection_attempts: AtomicU64,
    connections_created: AtomicU64,
    connection_failures: AtomicU64,

    // Time spent waiting for a lease
    wait_tracker: Mutex<LatencyTracker>,
}

impl PoolMetrics {
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            acquisitions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            connections_created: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            wait_tracker: Mutex::new(LatencyTracker::new()),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Record a successful checkout and how long it waited
    pub fn record_acquire(&self, waited: Duration) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.wait_tracker.lock() {
            tracker.record(waited);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_success(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (average_wait_ms, p95_wait_ms, p99_wait_ms) = match self.wait_tracker.lock() {
            Ok(tracker) => (
                tracker.average_ms(),
                tracker.percentile_ms(95.0),
                tracker.percentile_ms(99.0),
            ),
            Err(_) => (0.0, 0.0, 0.0),
        };

        MetricsSnapshot {
            pool_name: self.pool_name.clone(),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            average_wait_ms,
            p95_wait_ms,
            p99_wait_ms,
        }
    }
}

/// Ring buffer of recent samples for percentiles
#[derive(Debug)]
struct LatencyTracker {
    samples: Vec<Duration>,
    max_samples: usize,
    next_index: usize,
}

impl LatencyTracker {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(1000),
            max_samples: 1000, // Keep last 1000 samples for percentile calculation
            next_index: 0,
        }
    }

    fn record(&mut self, sample: Duration) {
        if self.samples.len() < self.max_samples {
            self.samples.push(sample);
        } else {
            self.samples[self.next_index] = sample;
            self.next_index = (self.next_index + 1) % self.max_samples;
        }
    }

    fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let total_ms: f64 = self.samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        total_ms / self.samples.len() as f64
    }

    fn percentile_ms(&self, percentile: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let mut sorted = self.samples.clone();
        sorted.sort();

        let index = ((percentile / 100.0) * sorted.len() as f64) as usize;
        let index = index.min(sorted.len() - 1);

        sorted[index].as_secs_f64() * 1000.0
    }
}
