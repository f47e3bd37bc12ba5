//! One motor: a worker slot that claims cycles and drives each one through
//! obtain, execute and recover until it completes.
//!
//! A motor runs on its own tokio task. It reads control commands and
//! configuration versions only at cycle boundaries, so a cycle in progress
//! always finishes under the settings it started with. Asynchronous
//! operations go through the motor's [`InFlightTracker`]; completions are
//! collected between cycles and while paused.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cyclerun_observability_macros::obs;

use crate::config::ConfigSnapshot;
use crate::cycles::{Cycle, CycleSegment, CycleSequence};
use crate::errors::{CycleFailure, FailureLog, OpError};
use crate::flow::FlowContext;
use crate::inflight::{InFlightTracker, TrackedOp, panic_message};
use crate::metrics::{CycleOutcome, MetricsSink, SinkSet};
use crate::ops::{Bindings, Inline, OpDispenser, Operation, run_until_async};
use crate::params::ErrorMode;
use crate::ratelimit::DispatchGate;
use crate::retry::{RecoveryAction, RetryPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MotorState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Stopping = 3,
    Stopped = 4,
}

impl MotorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MotorState::Idle,
            1 => MotorState::Running,
            2 => MotorState::Paused,
            3 => MotorState::Stopping,
            _ => MotorState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MotorState::Idle => "idle",
            MotorState::Running => "running",
            MotorState::Paused => "paused",
            MotorState::Stopping => "stopping",
            MotorState::Stopped => "stopped",
        }
    }
}

/// Motor state readable from outside the motor task.
#[derive(Debug)]
pub struct MotorStateCell(AtomicU8);

impl Default for MotorStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(MotorState::Idle as u8))
    }
}

impl MotorStateCell {
    pub fn load(&self) -> MotorState {
        MotorState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: MotorState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Requested run state, published by the activity over a watch channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunCommand {
    Run,
    Pause,
    Stop,
}

/// Everything the motors of one activity share.
pub struct MotorShared {
    pub activity: String,
    pub cycles: Arc<CycleSequence>,
    pub gate: Arc<DispatchGate>,
    pub dispenser: Arc<dyn OpDispenser>,
    pub sink: SinkSet,
    pub failures: Arc<FailureLog>,
    /// Cancelled when a fatal cycle outcome halts the activity.
    pub halt: CancellationToken,
    /// Drain window, in milliseconds, used when a motor stops.
    pub drain_window_ms: AtomicU64,
}

impl MotorShared {
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms.load(Ordering::Relaxed))
    }

    pub fn set_drain_window(&self, window: Duration) {
        self.drain_window_ms
            .store(window.as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MotorReport {
    pub slot: usize,
    pub cycles_completed: u64,
    pub final_state: MotorState,
    /// Cycles still in flight when the drain window closed, or cut off by
    /// a stop while waiting out a retry backoff.
    pub abandoned: Vec<Cycle>,
}

/// Per-cycle bookkeeping carried across attempts.
#[derive(Clone, Debug)]
struct Attempt {
    tries: u32,
    diagnosed: bool,
    /// Bindings the diagnostic path produced; later tries rebind from these.
    corrected: Option<Bindings>,
    started: Instant,
}

impl Attempt {
    fn first() -> Self {
        Self::resumed(1)
    }

    fn resumed(tries: u32) -> Self {
        Self {
            tries,
            diagnosed: false,
            corrected: None,
            started: Instant::now(),
        }
    }

    fn latency_nanos(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }
}

enum Step {
    Obtain,
    Execute(Operation),
    Recover(OpError),
}

pub struct Motor {
    slot: usize,
    shared: Arc<MotorShared>,
    control: watch::Receiver<RunCommand>,
    config: watch::Receiver<Arc<ConfigSnapshot>>,
    snapshot: Arc<ConfigSnapshot>,
    policy: RetryPolicy,
    state: Arc<MotorStateCell>,
    flow: FlowContext,
    tracker: InFlightTracker,
    segment: CycleSegment,
    attempts: HashMap<Cycle, Attempt>,
    interrupted: Vec<Cycle>,
    completed: u64,
}

impl Motor {
    pub fn new(
        slot: usize,
        shared: Arc<MotorShared>,
        control: watch::Receiver<RunCommand>,
        mut config: watch::Receiver<Arc<ConfigSnapshot>>,
    ) -> Self {
        let snapshot = Arc::clone(&config.borrow_and_update());
        let settings = &snapshot.settings;
        let tracker =
            InFlightTracker::new(slot, settings.async_limit).with_op_timeout(settings.op_timeout);
        Self {
            slot,
            shared,
            control,
            config,
            policy: settings.retry_policy(),
            snapshot,
            state: Arc::new(MotorStateCell::default()),
            flow: FlowContext::new(slot),
            tracker,
            segment: CycleSegment::empty(),
            attempts: HashMap::new(),
            interrupted: Vec::new(),
            completed: 0,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Handle for observing this motor's state after it is spawned.
    pub fn state_cell(&self) -> Arc<MotorStateCell> {
        Arc::clone(&self.state)
    }

    pub async fn run(mut self) -> MotorReport {
        self.state.store(MotorState::Running);
        debug!(
            activity = %self.shared.activity,
            slot = self.slot,
            version = self.snapshot.version,
            "motor started"
        );

        loop {
            if !self.checkpoint().await {
                break;
            }
            let Some((cycle, starts_stride)) = self.next_cycle() else {
                debug!(activity = %self.shared.activity, slot = self.slot, "cycles exhausted");
                break;
            };
            let wait = self.shared.gate.acquire(starts_stride);
            if !self.wait_out(wait).await {
                debug!(
                    activity = %self.shared.activity,
                    slot = self.slot,
                    cycle,
                    "stopped while rate limited, cycle not started"
                );
                break;
            }
            self.flow.reset(cycle);
            self.shared.sink.on_start(cycle);
            self.drive(cycle, Attempt::first(), Step::Obtain).await;
            self.collect_ready().await;
        }

        self.state.store(MotorState::Stopping);
        let abandoned = self.finish().await;
        self.state.store(MotorState::Stopped);
        debug!(
            activity = %self.shared.activity,
            slot = self.slot,
            completed = self.completed,
            abandoned = abandoned.len(),
            "motor stopped"
        );
        MotorReport {
            slot: self.slot,
            cycles_completed: self.completed,
            final_state: MotorState::Stopped,
            abandoned,
        }
    }

    /// Applies pending configuration and control changes, and waits while
    /// paused or while every async slot is taken. Returns false when the
    /// motor should stop.
    async fn checkpoint(&mut self) -> bool {
        loop {
            if self.shared.halt.is_cancelled() {
                return false;
            }
            self.refresh_config();
            let command = *self.control.borrow_and_update();
            match command {
                RunCommand::Stop => return false,
                RunCommand::Run if !self.tracker.is_full() => {
                    self.state.store(MotorState::Running);
                    return true;
                }
                RunCommand::Run | RunCommand::Pause => {
                    if command == RunCommand::Pause && self.state.load() != MotorState::Paused {
                        debug!(activity = %self.shared.activity, slot = self.slot, "motor paused");
                        self.state.store(MotorState::Paused);
                    }
                    let idle = self.tracker.is_idle();
                    tokio::select! {
                        changed = self.control.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                        _ = self.shared.halt.cancelled() => return false,
                        Some(op) = self.tracker.await_one(), if !idle => {
                            self.complete_tracked(op).await;
                        }
                    }
                }
            }
        }
    }

    /// Sleeps for `wait` unless the activity halts or is told to stop first.
    /// Returns false when cut short. A pause does not cut the wait short.
    async fn wait_out(&mut self, wait: Duration) -> bool {
        if wait.is_zero() {
            return true;
        }
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            if self.shared.halt.is_cancelled() || *self.control.borrow() == RunCommand::Stop {
                return false;
            }
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shared.halt.cancelled() => return false,
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn refresh_config(&mut self) {
        if !self.config.has_changed().unwrap_or(false) {
            return;
        }
        let snapshot = Arc::clone(&self.config.borrow_and_update());
        let settings = &snapshot.settings;
        self.policy = settings.retry_policy();
        self.tracker.set_capacity(settings.async_limit);
        self.tracker.set_op_timeout(settings.op_timeout);
        debug!(
            activity = %self.shared.activity,
            slot = self.slot,
            version = snapshot.version,
            "motor picked up configuration"
        );
        self.snapshot = snapshot;
    }

    /// Next cycle to run, and whether it opens a new stride.
    fn next_cycle(&mut self) -> Option<(Cycle, bool)> {
        if let Some(cycle) = self.segment.next() {
            return Some((cycle, false));
        }
        self.segment = self.shared.cycles.next_segment(self.snapshot.settings.stride);
        self.segment.next().map(|cycle| (cycle, true))
    }

    #[obs(cycle)]
    async fn drive(&mut self, cycle: Cycle, mut attempt: Attempt, mut step: Step) {
        loop {
            step = match step {
                Step::Obtain => {
                    let dispenser = Arc::clone(&self.shared.dispenser);
                    let corrected = attempt.corrected.as_ref();
                    let created = guarded(|| match corrected {
                        Some(bindings) => dispenser.rebind(cycle, bindings),
                        None => dispenser.create(cycle),
                    });
                    match created {
                        Ok(op) => Step::Execute(op),
                        Err(error) => Step::Recover(error),
                    }
                }
                Step::Execute(Operation::AsyncValue(future)) => {
                    self.tracker.submit(cycle, attempt.tries, future).await;
                    self.attempts.insert(cycle, attempt);
                    return;
                }
                Step::Execute(op) => match self.run_sync(cycle, op) {
                    Ok(Inline::Done(_)) => {
                        self.succeed(cycle, &attempt);
                        return;
                    }
                    Ok(Inline::Deferred(future)) => Step::Execute(Operation::AsyncValue(future)),
                    Err(error) => Step::Recover(error),
                },
                Step::Recover(error) => {
                    self.shared.sink.on_error(cycle, error.kind());
                    match self
                        .policy
                        .decide(cycle, attempt.tries, error, attempt.diagnosed)
                    {
                        RecoveryAction::Diagnose(original) => {
                            attempt.diagnosed = true;
                            match self.diagnose(cycle, &mut attempt, original) {
                                Ok(()) => Step::Obtain,
                                Err(failure) => {
                                    self.fail(failure, &attempt);
                                    return;
                                }
                            }
                        }
                        RecoveryAction::Retry { next_try, delay } => {
                            debug!(
                                activity = %self.shared.activity,
                                slot = self.slot,
                                cycle,
                                next_try,
                                delay_ms = delay.as_millis() as u64,
                                "retrying cycle"
                            );
                            if !self.wait_out(delay).await {
                                self.abandon(cycle, &attempt);
                                return;
                            }
                            attempt.tries = next_try;
                            Step::Obtain
                        }
                        RecoveryAction::Fail(failure) => {
                            self.fail(failure, &attempt);
                            return;
                        }
                    }
                }
            };
        }
    }

    /// Runs the slow path once. The corrected bindings serve every later try.
    fn diagnose(
        &self,
        cycle: Cycle,
        attempt: &mut Attempt,
        original: OpError,
    ) -> Result<(), CycleFailure> {
        let dispenser = Arc::clone(&self.shared.dispenser);
        match guarded(|| dispenser.diagnose(cycle)) {
            Ok(bindings) if attempt.tries < self.policy.max_tries => {
                debug!(
                    activity = %self.shared.activity,
                    slot = self.slot,
                    cycle,
                    error = %original,
                    "binding recovered by diagnostic path"
                );
                attempt.tries += 1;
                attempt.corrected = Some(bindings);
                Ok(())
            }
            Ok(_) => Err(CycleFailure::TriesExhausted {
                cycle,
                tries: attempt.tries,
                last: original,
            }),
            Err(explained) => Err(CycleFailure::Failed {
                cycle,
                tries: attempt.tries,
                error: explained,
            }),
        }
    }

    fn run_sync(&mut self, cycle: Cycle, op: Operation) -> Result<Inline, OpError> {
        if self.flow.cycle() != Some(cycle) {
            self.flow.reset(cycle);
        }
        let chain_limit = self.snapshot.settings.chain_limit;
        let flow = &mut self.flow;
        std::panic::catch_unwind(AssertUnwindSafe(|| run_until_async(op, flow, chain_limit)))
            .unwrap_or_else(|panic| Err(OpError::fatal(panic_message(panic.as_ref()))))
    }

    fn succeed(&mut self, cycle: Cycle, attempt: &Attempt) {
        self.shared.sink.on_complete(
            cycle,
            attempt.latency_nanos(),
            CycleOutcome::succeeded(attempt.tries),
        );
        self.completed += 1;
    }

    fn fail(&mut self, failure: CycleFailure, attempt: &Attempt) {
        let cycle = failure.cycle();
        self.shared.sink.on_complete(
            cycle,
            attempt.latency_nanos(),
            CycleOutcome::failed(failure.kind(), failure.tries()),
        );
        self.completed += 1;
        let record = self.shared.failures.record(&failure);
        if !failure.is_fatal() {
            return;
        }
        match self.snapshot.settings.error_mode {
            ErrorMode::Stop => {
                if !self.shared.halt.is_cancelled() {
                    error!(
                        activity = %self.shared.activity,
                        slot = self.slot,
                        cycle,
                        kind = %record.kind,
                        tries = record.tries,
                        error = %record.message,
                        "cycle failed, halting activity"
                    );
                    self.shared.halt.cancel();
                }
            }
            ErrorMode::Count => {
                debug!(
                    activity = %self.shared.activity,
                    slot = self.slot,
                    cycle,
                    kind = %record.kind,
                    error = %record.message,
                    "cycle failed"
                );
            }
        }
    }

    /// Ends a started cycle that a stop cut off mid-backoff.
    fn abandon(&mut self, cycle: Cycle, attempt: &Attempt) {
        self.fail(
            CycleFailure::Abandoned {
                cycle,
                tries: attempt.tries,
            },
            attempt,
        );
        self.interrupted.push(cycle);
    }

    async fn complete_tracked(&mut self, op: TrackedOp) {
        let Some(attempt) = self.attempts.remove(&op.cycle) else {
            warn!(
                activity = %self.shared.activity,
                slot = self.slot,
                cycle = op.cycle,
                op = %op.id,
                "completion for a cycle with no recorded attempt"
            );
            return;
        };
        match op.outcome {
            Ok(_) => self.succeed(op.cycle, &attempt),
            Err(error) => self.drive(op.cycle, attempt, Step::Recover(error)).await,
        }
    }

    async fn collect_ready(&mut self) {
        while let Some(op) = self.tracker.poll() {
            self.complete_tracked(op).await;
        }
    }

    /// Lets in-flight operations finish within the drain window, then
    /// abandons the rest. Returns the abandoned cycles.
    async fn finish(&mut self) -> Vec<Cycle> {
        let window = self.shared.drain_window();
        let deadline = Instant::now() + window;
        while !self.tracker.is_idle() {
            let next = tokio::time::timeout_at(deadline, self.tracker.await_one()).await;
            match next {
                Ok(Some(op)) => self.complete_tracked(op).await,
                Ok(None) | Err(_) => break,
            }
        }

        let report = self.tracker.drain(Duration::ZERO).await;
        for op in report.completed {
            let Some(attempt) = self.attempts.remove(&op.cycle) else {
                continue;
            };
            match op.outcome {
                Ok(_) => self.succeed(op.cycle, &attempt),
                Err(error) => {
                    self.shared.sink.on_error(op.cycle, error.kind());
                    let failure = CycleFailure::Failed {
                        cycle: op.cycle,
                        tries: attempt.tries,
                        error,
                    };
                    self.fail(failure, &attempt);
                }
            }
        }

        let mut abandoned = std::mem::take(&mut self.interrupted);
        abandoned.reserve(report.abandoned.len());
        for op in report.abandoned {
            let attempt = self
                .attempts
                .remove(&op.cycle)
                .unwrap_or_else(|| Attempt::resumed(op.tries));
            self.fail(
                CycleFailure::Abandoned {
                    cycle: op.cycle,
                    tries: op.tries,
                },
                &attempt,
            );
            abandoned.push(op.cycle);
        }
        if !abandoned.is_empty() {
            info!(
                activity = %self.shared.activity,
                slot = self.slot,
                abandoned = abandoned.len(),
                window_ms = window.as_millis() as u64,
                "abandoned in-flight cycles on stop"
            );
        }
        abandoned
    }
}

/// Runs an adapter callback, turning a panic into a fatal error.
fn guarded<T>(call: impl FnOnce() -> Result<T, OpError>) -> Result<T, OpError> {
    std::panic::catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|panic| Err(OpError::fatal(panic_message(panic.as_ref()))))
}
