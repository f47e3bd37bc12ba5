use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::{CycleOutcome, MetricsSink, SinkEvent};
use crate::cycles::Cycle;
use crate::errors::ErrorKind;

/// Keeps every event in memory, in arrival order. Meant for tests and
/// verification runs where per-cycle accounting matters more than memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: SinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn started(&self) -> Vec<Cycle> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Start { cycle } => Some(*cycle),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<(Cycle, CycleOutcome)> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Complete { cycle, outcome, .. } => Some((*cycle, *outcome)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(Cycle, ErrorKind)> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Error { cycle, kind } => Some((*cycle, *kind)),
                _ => None,
            })
            .collect()
    }

    /// Completion count per cycle; every value is 1 when each cycle was
    /// reported exactly once.
    pub fn completion_counts(&self) -> BTreeMap<Cycle, usize> {
        let mut counts = BTreeMap::new();
        for (cycle, _) in self.completions() {
            *counts.entry(cycle).or_insert(0) += 1;
        }
        counts
    }

    pub fn outcome_of(&self, cycle: Cycle) -> Option<CycleOutcome> {
        self.completions()
            .into_iter()
            .find(|(completed, _)| *completed == cycle)
            .map(|(_, outcome)| outcome)
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetricsSink for RecordingSink {
    fn on_start(&self, cycle: Cycle) {
        self.push(SinkEvent::Start { cycle });
    }

    fn on_complete(&self, cycle: Cycle, latency_nanos: u64, outcome: CycleOutcome) {
        self.push(SinkEvent::Complete {
            cycle,
            latency_nanos,
            outcome,
        });
    }

    fn on_error(&self, cycle: Cycle, kind: ErrorKind) {
        self.push(SinkEvent::Error { cycle, kind });
    }
}
