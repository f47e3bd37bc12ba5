//! Bounded tracking of asynchronous operations owned by one motor.
//!
//! Async operations run as spawned tokio tasks and report back over a
//! channel that only the owning tracker reads. `submit` blocks while the
//! tracker is at capacity, which is what turns a slow downstream into a
//! slower cycle issue rate.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use cyclerun_observability_macros::obs;

use crate::cycles::Cycle;
use crate::errors::OpError;
use crate::ops::OpFuture;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrackedState {
    Submitted = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Released = 4,
}

impl TrackedState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TrackedState::Submitted,
            1 => TrackedState::Running,
            2 => TrackedState::Succeeded,
            3 => TrackedState::Failed,
            _ => TrackedState::Released,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrackedState::Succeeded | TrackedState::Failed | TrackedState::Released
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackedOpId(u64);

impl fmt::Display for TrackedOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// A completed asynchronous operation handed back to its motor.
#[derive(Debug)]
pub struct TrackedOp {
    pub id: TrackedOpId,
    pub cycle: Cycle,
    pub slot: usize,
    pub tries: u32,
    pub submitted_at: Instant,
    /// Time the operation itself ran, excluding time queued in the tracker.
    pub elapsed: Duration,
    pub state: TrackedState,
    pub outcome: Result<Value, OpError>,
}

/// An operation still running when the drain window closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbandonedOp {
    pub id: TrackedOpId,
    pub cycle: Cycle,
    pub tries: u32,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub completed: Vec<TrackedOp>,
    pub abandoned: Vec<AbandonedOp>,
}

struct Pending {
    cycle: Cycle,
    tries: u32,
    submitted_at: Instant,
    state: Arc<AtomicU8>,
    abort: AbortHandle,
}

struct Completion {
    id: TrackedOpId,
    outcome: Result<Value, OpError>,
    elapsed: Duration,
}

/// Runs `future` to completion, converting a panic into a fatal error and
/// an expired `timeout` into a transient timeout.
pub async fn run_with_timeout(future: OpFuture, timeout: Option<Duration>) -> Result<Value, OpError> {
    let guarded = AssertUnwindSafe(future).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                return Err(OpError::timeout(format!(
                    "operation exceeded {}ms",
                    limit.as_millis()
                )));
            }
        },
        None => guarded.await,
    };
    result.unwrap_or_else(|panic| Err(OpError::fatal(panic_message(panic.as_ref()))))
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("operation panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("operation panicked: {message}")
    } else {
        "operation panicked".to_string()
    }
}

pub struct InFlightTracker {
    slot: usize,
    capacity: usize,
    op_timeout: Option<Duration>,
    next_id: u64,
    pending: HashMap<TrackedOpId, Pending>,
    ready: VecDeque<TrackedOp>,
    // At most `capacity` tasks hold a sender clone, so the queue stays bounded.
    sender: mpsc::UnboundedSender<Completion>,
    receiver: mpsc::UnboundedReceiver<Completion>,
}

impl InFlightTracker {
    pub fn new(slot: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            slot,
            capacity: capacity.max(1),
            op_timeout: None,
            next_id: 0,
            pending: HashMap::new(),
            ready: VecDeque::new(),
            sender,
            receiver,
        }
    }

    pub fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes effect for later submissions; running ops are not touched.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn set_op_timeout(&mut self, timeout: Option<Duration>) {
        self.op_timeout = timeout;
    }

    /// Operations submitted whose completion has not been received yet.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    /// Lowest cycle still running, if any.
    pub fn low_water_mark(&self) -> Option<Cycle> {
        self.pending.values().map(|pending| pending.cycle).min()
    }

    pub fn states(&self) -> Vec<(TrackedOpId, Cycle, TrackedState)> {
        let mut states: Vec<_> = self
            .pending
            .iter()
            .map(|(id, pending)| {
                (
                    *id,
                    pending.cycle,
                    TrackedState::from_u8(pending.state.load(Ordering::Acquire)),
                )
            })
            .collect();
        states.sort_by_key(|(id, _, _)| *id);
        states
    }

    /// Starts `future` for `cycle`, first waiting for a free slot when the
    /// tracker is full. Completions received while waiting are queued for
    /// [`poll`](Self::poll).
    #[obs(cycle)]
    pub async fn submit(&mut self, cycle: Cycle, tries: u32, future: OpFuture) -> TrackedOpId {
        while self.is_full() {
            self.receive_one().await;
        }

        let id = TrackedOpId(self.next_id);
        self.next_id += 1;
        let state = Arc::new(AtomicU8::new(TrackedState::Submitted as u8));
        let task_state = Arc::clone(&state);
        let sender = self.sender.clone();
        let timeout = self.op_timeout;
        let handle = tokio::spawn(async move {
            task_state.store(TrackedState::Running as u8, Ordering::Release);
            let started = Instant::now();
            let outcome = run_with_timeout(future, timeout).await;
            let terminal = if outcome.is_ok() {
                TrackedState::Succeeded
            } else {
                TrackedState::Failed
            };
            task_state.store(terminal as u8, Ordering::Release);
            let _ = sender.send(Completion {
                id,
                outcome,
                elapsed: started.elapsed(),
            });
        });

        self.pending.insert(
            id,
            Pending {
                cycle,
                tries,
                submitted_at: Instant::now(),
                state,
                abort: handle.abort_handle(),
            },
        );
        id
    }

    async fn receive_one(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Some(completion) = self.receiver.recv().await {
            self.accept(completion);
        }
    }

    fn accept(&mut self, completion: Completion) {
        let Some(pending) = self.pending.remove(&completion.id) else {
            warn!(
                slot = self.slot,
                op = %completion.id,
                "ignoring completion for unknown operation"
            );
            return;
        };
        self.ready.push_back(TrackedOp {
            id: completion.id,
            cycle: pending.cycle,
            slot: self.slot,
            tries: pending.tries,
            submitted_at: pending.submitted_at,
            elapsed: completion.elapsed,
            state: TrackedState::from_u8(pending.state.load(Ordering::Acquire)),
            outcome: completion.outcome,
        });
    }

    fn release(mut op: TrackedOp) -> TrackedOp {
        op.state = TrackedState::Released;
        op
    }

    /// Next completed operation without waiting.
    pub fn poll(&mut self) -> Option<TrackedOp> {
        while let Ok(completion) = self.receiver.try_recv() {
            self.accept(completion);
        }
        self.ready.pop_front().map(Self::release)
    }

    /// Waits for the next completion. Returns `None` once nothing is in flight.
    pub async fn await_one(&mut self) -> Option<TrackedOp> {
        loop {
            if let Some(op) = self.ready.pop_front() {
                return Some(Self::release(op));
            }
            if self.pending.is_empty() {
                return None;
            }
            self.receive_one().await;
        }
    }

    /// Waits up to `window` for outstanding operations, then aborts the rest.
    pub async fn drain(&mut self, window: Duration) -> DrainReport {
        let deadline = Instant::now() + window;
        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(completion)) => self.accept(completion),
                Ok(None) | Err(_) => break,
            }
        }

        let completed = self.ready.drain(..).map(Self::release).collect();
        let mut abandoned: Vec<AbandonedOp> = self
            .pending
            .drain()
            .map(|(id, pending)| {
                pending.abort.abort();
                AbandonedOp {
                    id,
                    cycle: pending.cycle,
                    tries: pending.tries,
                }
            })
            .collect();
        abandoned.sort_by_key(|op| op.cycle);
        if !abandoned.is_empty() {
            debug!(
                slot = self.slot,
                abandoned = abandoned.len(),
                window_ms = window.as_millis() as u64,
                "drain window closed with operations in flight"
            );
        }
        DrainReport {
            completed,
            abandoned,
        }
    }
}

impl Drop for InFlightTracker {
    fn drop(&mut self) {
        for pending in self.pending.values() {
            pending.abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::errors::{ErrorKind, TransientKind};

    fn sleeper(cycle: Cycle, millis: u64) -> OpFuture {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!(cycle))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_never_exceeds_capacity() {
        let mut tracker = InFlightTracker::new(0, 3);
        let mut seen = Vec::new();
        for cycle in 0..20u64 {
            tracker.submit(cycle, 1, sleeper(cycle, 5 + (cycle * 7) % 11)).await;
            assert!(tracker.outstanding() <= 3);
            while let Some(op) = tracker.poll() {
                seen.push(op.cycle);
            }
        }
        while let Some(op) = tracker.await_one().await {
            assert_eq!(op.state, TrackedState::Released);
            assert_eq!(op.outcome, Ok(json!(op.cycle)));
            seen.push(op.cycle);
        }
        let unique: BTreeSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 20);
        assert_eq!(unique, (0..20).collect::<BTreeSet<_>>());
        assert!(tracker.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_operation_is_timeout() {
        let mut tracker = InFlightTracker::new(1, 2).with_op_timeout(Some(Duration::from_millis(50)));
        tracker.submit(9, 1, sleeper(9, 10_000)).await;
        let op = tracker.await_one().await.unwrap();
        assert_eq!(op.cycle, 9);
        assert_eq!(op.slot, 1);
        let error = op.outcome.unwrap_err();
        assert_eq!(error.transient_kind(), Some(TransientKind::Timeout));
    }

    #[tokio::test]
    async fn panicking_operation_is_fatal() {
        let mut tracker = InFlightTracker::new(0, 1);
        let exploding: OpFuture = Box::pin(futures::future::lazy(|_| -> Result<Value, OpError> {
            panic!("driver bug")
        }));
        tracker.submit(3, 1, exploding).await;
        let op = tracker.await_one().await.unwrap();
        let error = op.outcome.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Fatal);
        assert!(error.to_string().contains("driver bug"));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_abandons_what_does_not_finish() {
        let mut tracker = InFlightTracker::new(0, 4);
        tracker.submit(1, 1, sleeper(1, 10)).await;
        tracker.submit(2, 2, Box::pin(futures::future::pending())).await;
        tracker.submit(3, 1, Box::pin(futures::future::pending())).await;
        assert_eq!(tracker.low_water_mark(), Some(1));

        let report = tracker.drain(Duration::from_millis(100)).await;
        let completed: Vec<_> = report.completed.iter().map(|op| op.cycle).collect();
        let abandoned: Vec<_> = report.abandoned.iter().map(|op| (op.cycle, op.tries)).collect();
        assert_eq!(completed, vec![1]);
        assert_eq!(abandoned, vec![(2, 2), (3, 1)]);
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.low_water_mark(), None);
    }

    #[tokio::test]
    async fn unknown_completion_is_ignored() {
        let mut tracker = InFlightTracker::new(0, 1);
        let sent = tracker.sender.send(Completion {
            id: TrackedOpId(999),
            outcome: Ok(Value::Null),
            elapsed: Duration::ZERO,
        });
        assert!(sent.is_ok());
        assert!(tracker.poll().is_none());
        assert!(tracker.await_one().await.is_none());
    }
}
