//! Metrics sink boundary and the sinks the engine ships with.

mod buffered;
mod recording;
mod reporter;
mod stats;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cycles::Cycle;
use crate::errors::ErrorKind;

pub use buffered::BufferedSink;
pub use recording::RecordingSink;
pub use reporter::spawn_progress_reporter;
pub use stats::{ActivityMetrics, DEFAULT_THROUGHPUT_WINDOW, MetricsSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed(ErrorKind),
}

/// Final result of one cycle, reported exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub status: OutcomeStatus,
    pub tries: u32,
}

impl CycleOutcome {
    pub fn succeeded(tries: u32) -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            tries,
        }
    }

    pub fn failed(kind: ErrorKind, tries: u32) -> Self {
        Self {
            status: OutcomeStatus::Failed(kind),
            tries,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

/// Push-only receiver of per-cycle events. Called from motor tasks, so
/// implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn on_start(&self, cycle: Cycle);

    /// `latency_nanos` spans from the first attempt to the final outcome.
    fn on_complete(&self, cycle: Cycle, latency_nanos: u64, outcome: CycleOutcome);

    /// Every failed attempt, including ones that are later retried.
    fn on_error(&self, cycle: Cycle, kind: ErrorKind);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    Start {
        cycle: Cycle,
    },
    Complete {
        cycle: Cycle,
        latency_nanos: u64,
        outcome: CycleOutcome,
    },
    Error {
        cycle: Cycle,
        kind: ErrorKind,
    },
}

impl SinkEvent {
    pub fn cycle(&self) -> Cycle {
        match self {
            SinkEvent::Start { cycle }
            | SinkEvent::Complete { cycle, .. }
            | SinkEvent::Error { cycle, .. } => *cycle,
        }
    }

    pub fn deliver(self, sink: &dyn MetricsSink) {
        match self {
            SinkEvent::Start { cycle } => sink.on_start(cycle),
            SinkEvent::Complete {
                cycle,
                latency_nanos,
                outcome,
            } => sink.on_complete(cycle, latency_nanos, outcome),
            SinkEvent::Error { cycle, kind } => sink.on_error(cycle, kind),
        }
    }
}

/// Fans events out to every attached sink.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for SinkSet {
    fn on_start(&self, cycle: Cycle) {
        for sink in &self.sinks {
            sink.on_start(cycle);
        }
    }

    fn on_complete(&self, cycle: Cycle, latency_nanos: u64, outcome: CycleOutcome) {
        for sink in &self.sinks {
            sink.on_complete(cycle, latency_nanos, outcome);
        }
    }

    fn on_error(&self, cycle: Cycle, kind: ErrorKind) {
        for sink in &self.sinks {
            sink.on_error(cycle, kind);
        }
    }
}
