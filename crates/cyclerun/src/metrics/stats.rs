use std::collections::BTreeMap;
use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicI64, AtomicU64, Ordering},
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::{CreationError, Histogram};
use serde::Serialize;
use tokio::time::Instant;

use super::{CycleOutcome, MetricsSink, OutcomeStatus};
use crate::cycles::Cycle;
use crate::errors::ErrorKind;

pub const DEFAULT_THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// Highest latency the histogram resolves, in microseconds. Slower cycles
/// are clamped to it.
const MAX_LATENCY_MICROS: u64 = 3_600_000_000;
const LATENCY_SIGFIGS: u8 = 3;
const NEVER: i64 = i64::MIN;

/// One second of completions. `tag` is the second plus one, zero when unused.
#[derive(Debug, Default)]
struct SecondSlot {
    tag: AtomicU64,
    count: AtomicU64,
}

/// Completions per whole second over a trailing window, kept in a fixed ring
/// of slots reused as seconds roll over.
#[derive(Debug)]
struct ThroughputRing {
    origin: Instant,
    slots: Box<[SecondSlot]>,
    last_completed_ms: AtomicI64,
}

impl ThroughputRing {
    fn new(window: Duration, origin: Instant) -> Self {
        let seconds = window.as_secs().max(1) as usize;
        Self {
            origin,
            slots: (0..seconds).map(|_| SecondSlot::default()).collect(),
            last_completed_ms: AtomicI64::new(NEVER),
        }
    }

    fn second_of(&self, when: Instant) -> u64 {
        when.saturating_duration_since(self.origin).as_secs()
    }

    fn slot(&self, second: u64) -> &SecondSlot {
        &self.slots[(second % self.slots.len() as u64) as usize]
    }

    /// A count racing the slot's reset to a new second may be lost.
    fn record_at(&self, when: Instant, wall_time: DateTime<Utc>) {
        self.last_completed_ms
            .fetch_max(wall_time.timestamp_millis(), Ordering::Relaxed);
        let second = self.second_of(when);
        let tag = second + 1;
        let slot = self.slot(second);
        let seen = slot.tag.load(Ordering::Acquire);
        if seen > tag {
            // Older than anything the ring still holds.
            return;
        }
        if seen < tag
            && slot
                .tag
                .compare_exchange(seen, tag, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            slot.count.store(0, Ordering::Release);
        }
        slot.count.fetch_add(1, Ordering::AcqRel);
    }

    fn per_second_at(&self, now: Instant) -> f64 {
        let current = self.second_of(now);
        let span = self.slots.len() as u64;
        let oldest = current.saturating_sub(span - 1);
        let total: u64 = self
            .slots
            .iter()
            .filter(|slot| {
                let tag = slot.tag.load(Ordering::Acquire);
                tag > oldest && tag <= current + 1
            })
            .map(|slot| slot.count.load(Ordering::Acquire))
            .sum();
        total as f64 / span as f64
    }

    fn last_completed_at(&self) -> Option<DateTime<Utc>> {
        match self.last_completed_ms.load(Ordering::Relaxed) {
            NEVER => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }
}

/// `(median, p99)` in milliseconds, none before the first sample.
fn percentiles_ms(histogram: &Histogram<u64>) -> (Option<f64>, Option<f64>) {
    if histogram.len() == 0 {
        return (None, None);
    }
    let at = |quantile: f64| histogram.value_at_quantile(quantile) as f64 / 1e3;
    (Some(at(0.5)), Some(at(0.99)))
}

/// Serializable view of [`ActivityMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Failed attempts per error kind, retried ones included.
    pub errors: BTreeMap<String, u64>,
    pub median_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub throughput_per_sec: f64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Always-on aggregate sink an activity keeps for its own status reports.
/// Memory stays fixed however long the activity runs.
#[derive(Debug)]
pub struct ActivityMetrics {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    errors: [AtomicU64; ErrorKind::ALL.len()],
    throughput: ThroughputRing,
    /// Cycle latencies in microseconds.
    latency: Mutex<Histogram<u64>>,
}

impl ActivityMetrics {
    pub fn new(throughput_window: Duration) -> Result<Self, CreationError> {
        Ok(Self {
            started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            throughput: ThroughputRing::new(throughput_window, Instant::now()),
            latency: Mutex::new(Histogram::new_with_bounds(
                1,
                MAX_LATENCY_MICROS,
                LATENCY_SIGFIGS,
            )?),
        })
    }

    pub fn completed(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors[kind.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (median_latency_ms, p99_latency_ms) =
            percentiles_ms(&self.latency.lock().unwrap_or_else(PoisonError::into_inner));
        let errors = ErrorKind::ALL
            .iter()
            .filter_map(|kind| {
                let count = self.errors_of(*kind);
                (count > 0).then(|| (kind.as_str().to_string(), count))
            })
            .collect();
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errors,
            median_latency_ms,
            p99_latency_ms,
            throughput_per_sec: self.throughput.per_second_at(Instant::now()),
            last_completed_at: self.throughput.last_completed_at(),
        }
    }
}

impl MetricsSink for ActivityMetrics {
    fn on_start(&self, _cycle: Cycle) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_complete(&self, _cycle: Cycle, latency_nanos: u64, outcome: CycleOutcome) {
        match outcome.status {
            OutcomeStatus::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            OutcomeStatus::Failed(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        self.throughput.record_at(Instant::now(), Utc::now());
        let micros = (latency_nanos / 1_000).max(1);
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .saturating_record(micros);
    }

    fn on_error(&self, _cycle: Cycle, kind: ErrorKind) {
        self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> ActivityMetrics {
        ActivityMetrics::new(DEFAULT_THROUGHPUT_WINDOW).unwrap()
    }

    #[test]
    fn latency_percentiles_come_from_the_histogram() {
        let metrics = metrics();
        for millis in 1..=200u64 {
            metrics.on_complete(millis, millis * 1_000_000, CycleOutcome::succeeded(1));
        }
        let snapshot = metrics.snapshot();
        let median = snapshot.median_latency_ms.unwrap();
        let p99 = snapshot.p99_latency_ms.unwrap();
        assert!((median - 100.0).abs() < 0.5, "median was {median}");
        assert!((p99 - 198.0).abs() < 0.5, "p99 was {p99}");
    }

    #[test]
    fn latency_beyond_the_histogram_range_is_clamped() {
        let fast = metrics();
        fast.on_complete(0, 0, CycleOutcome::succeeded(1));
        assert!(fast.snapshot().median_latency_ms.unwrap() < 0.01);

        let stuck = metrics();
        stuck.on_complete(1, u64::MAX, CycleOutcome::succeeded(1));
        let median = stuck.snapshot().median_latency_ms.unwrap();
        assert!(median >= 3_600_000.0 * 0.999, "median was {median}");
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_only_counts_recent_completions() {
        let start = Instant::now();
        let ring = ThroughputRing::new(Duration::from_secs(10), start);
        for offset in 0..20u64 {
            ring.record_at(start + Duration::from_millis(offset * 500), Utc::now());
        }
        // Two completions in each of seconds 0..=9; at 15s seconds 6..=15 count.
        let rate = ring.per_second_at(start + Duration::from_secs(15));
        assert!((rate - 0.8).abs() < f64::EPSILON, "rate was {rate}");
        assert!(ring.last_completed_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_ring_reuses_slots_over_a_long_run() {
        let start = Instant::now();
        let ring = ThroughputRing::new(Duration::from_secs(10), start);
        for second in 0..10_000u64 {
            for _ in 0..3 {
                ring.record_at(start + Duration::from_secs(second), Utc::now());
            }
        }
        assert_eq!(ring.slots.len(), 10);
        let now = start + Duration::from_millis(9_999_500);
        let rate = ring.per_second_at(now);
        assert!((rate - 3.0).abs() < f64::EPSILON, "rate was {rate}");

        // A straggler from long ago does not clobber a live slot.
        ring.record_at(start + Duration::from_secs(5), Utc::now());
        assert!((ring.per_second_at(now) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counts_outcomes_and_errors() {
        let metrics = metrics();
        metrics.on_start(1);
        metrics.on_start(2);
        metrics.on_error(1, ErrorKind::Timeout);
        metrics.on_error(1, ErrorKind::Timeout);
        metrics.on_complete(1, 2_000_000, CycleOutcome::succeeded(3));
        metrics.on_complete(2, 4_000_000, CycleOutcome::failed(ErrorKind::Fatal, 1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.completed(), 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.errors.get("timeout"), Some(&2));
        assert!(snapshot.last_completed_at.is_some());
        assert!(snapshot.median_latency_ms.is_some());
    }
}
