//! Dispatch Metrics
//!
//! Counters for the dispatcher plus a latency window fed by released
//! responses. Head-of-line stalls are invisible to the sequencer itself, so
//! stall warnings and task timeouts are tracked here for operators.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared, cheaply cloneable metrics for one dispatcher
#[derive(Clone)]
pub struct DispatchMetrics {
    /// Atomic counters for lock-free updates
    requests_dispatched: Arc<AtomicU64>,
    responses_released: Arc<AtomicU64>,
    responses_discarded: Arc<AtomicU64>,
    task_timeouts: Arc<AtomicU64>,
    stall_warnings: Arc<AtomicU64>,
    handler_panics: Arc<AtomicU64>,

    /// End-to-end request latency, process start to release
    latency: Arc<RwLock<ReleaseLatency>>,

    last_release: Arc<RwLock<Option<Instant>>>,
}

/// Point-in-time copy of [`DispatchMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchMetricsSnapshot {
    pub requests_dispatched: u64,
    pub responses_released: u64,
    pub responses_discarded: u64,
    pub task_timeouts: u64,
    pub stall_warnings: u64,
    pub handler_panics: u64,
    pub max_latency_ms: u64,
    pub avg_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub last_release: Option<Instant>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            requests_dispatched: Arc::new(AtomicU64::new(0)),
            responses_released: Arc::new(AtomicU64::new(0)),
            responses_discarded: Arc::new(AtomicU64::new(0)),
            task_timeouts: Arc::new(AtomicU64::new(0)),
            stall_warnings: Arc::new(AtomicU64::new(0)),
            handler_panics: Arc::new(AtomicU64::new(0)),
            latency: Arc::new(RwLock::new(ReleaseLatency::new())),
            last_release: Arc::new(RwLock::new(None)),
        }
    }

    #[inline]
    pub fn record_dispatch(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Release);
    }

    /// Record a response handed to the write path
    #[inline]
    pub fn record_release(&self, latency_ms: Option<u64>) {
        self.responses_released.fetch_add(1, Ordering::Release);

        if let Some(latency_ms) = latency_ms {
            // Skip the sample rather than block the write path
            if let Some(mut latency) = self.latency.try_write() {
                latency.record(latency_ms);
            }
        }

        *self.last_release.write() = Some(Instant::now());
    }

    #[inline]
    pub fn record_discarded(&self, count: usize) {
        self.responses_discarded
            .fetch_add(count as u64, Ordering::Release);
    }

    #[inline]
    pub fn record_task_timeout(&self) {
        self.task_timeouts.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn record_stall_warning(&self) {
        self.stall_warnings.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn record_handler_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        let latency = self.latency.read();

        DispatchMetricsSnapshot {
            requests_dispatched: self.requests_dispatched.load(Ordering::Acquire),
            responses_released: self.responses_released.load(Ordering::Acquire),
            responses_discarded: self.responses_discarded.load(Ordering::Acquire),
            task_timeouts: self.task_timeouts.load(Ordering::Acquire),
            stall_warnings: self.stall_warnings.load(Ordering::Acquire),
            handler_panics: self.handler_panics.load(Ordering::Acquire),
            max_latency_ms: latency.max_ms,
            avg_latency_ms: latency.mean(),
            p95_latency_ms: latency.percentile(95),
            p99_latency_ms: latency.percentile(99),
            last_release: *self.last_release.read(),
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Release latencies of the most recent responses.
///
/// Latency runs from process start to release, so it includes any time a
/// response spent buffered behind an earlier request. Mean and percentiles
/// cover the window only; the maximum covers every sample ever recorded.
struct ReleaseLatency {
    window: VecDeque<u64>,
    window_sum: u64,
    max_ms: u64,
}

impl ReleaseLatency {
    const WINDOW: usize = 1024;

    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(Self::WINDOW),
            window_sum: 0,
            max_ms: 0,
        }
    }

    fn record(&mut self, latency_ms: u64) {
        if self.window.len() == Self::WINDOW {
            if let Some(evicted) = self.window.pop_front() {
                self.window_sum -= evicted;
            }
        }
        self.window.push_back(latency_ms);
        self.window_sum += latency_ms;
        self.max_ms = self.max_ms.max(latency_ms);
    }

    fn mean(&self) -> u64 {
        match self.window.len() as u64 {
            0 => 0,
            n => self.window_sum / n,
        }
    }

    /// Nearest-rank percentile, `p` in `1..=100`
    fn percentile(&self, p: usize) -> u64 {
        if self.window.is_empty() {
            return 0;
        }

        let mut samples: Vec<u64> = self.window.iter().copied().collect();
        let rank = (samples.len() * p).div_ceil(100).max(1);
        let (_, value, _) = samples.select_nth_unstable(rank - 1);
        *value
    }
}
