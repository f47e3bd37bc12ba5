//! Activity: one configured workload, its motors, and its lifecycle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ActivityConfig, ConfigSnapshot, EngineConfig, get_config};
use crate::controller::EngineError;
use crate::cycles::{Cycle, CycleSequence};
use crate::errors::{FailureLog, FailureRecord};
use crate::flow::FlowVariables;
use crate::metrics::{
    ActivityMetrics, BufferedSink, DEFAULT_THROUGHPUT_WINDOW, MetricsSink, MetricsSnapshot, SinkSet,
    spawn_progress_reporter,
};
use crate::motor::{Motor, MotorReport, MotorShared, MotorState, MotorStateCell, RunCommand};
use crate::ops::{Adapter, BindingFn, OpDispenser, OpTemplate, TemplateDispenser};
use crate::params::{ActivityParams, ActivitySettings, ParamDelta, ParamError};
use crate::ratelimit::{DispatchGate, RateLimiterState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Initialized,
    Running,
    Paused,
    Stopping,
    /// Stopped on request.
    Stopped,
    /// Every cycle in the range completed.
    Finished,
    /// A fatal cycle outcome stopped the activity.
    Halted,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Initialized => "initialized",
            ActivityState::Running => "running",
            ActivityState::Paused => "paused",
            ActivityState::Stopping => "stopping",
            ActivityState::Stopped => "stopped",
            ActivityState::Finished => "finished",
            ActivityState::Halted => "halted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActivityState::Stopped | ActivityState::Finished | ActivityState::Halted
        )
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("activity `{activity}`: {source}")]
    Params {
        activity: String,
        #[source]
        source: ParamError,
    },
    #[error("activity `{activity}` cannot {action} while {state}")]
    InvalidTransition {
        activity: String,
        action: &'static str,
        state: ActivityState,
    },
    #[error("activity `{activity}` motor {slot} failed: {message}")]
    MotorFailed {
        activity: String,
        slot: usize,
        message: String,
    },
    #[error("activity `{activity}`: latency histogram: {source}")]
    Metrics {
        activity: String,
        #[source]
        source: hdrhistogram::CreationError,
    },
}

/// Everything needed to build an [`Activity`].
pub struct ActivityDef {
    pub name: String,
    pub params: ActivityParams,
    pub dispenser: Arc<dyn OpDispenser>,
    /// Extra sinks; the activity buffers them behind one [`BufferedSink`].
    pub sinks: Vec<Arc<dyn MetricsSink>>,
}

impl ActivityDef {
    pub fn new(
        name: impl Into<String>,
        params: ActivityParams,
        dispenser: Arc<dyn OpDispenser>,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            dispenser,
            sinks: Vec::new(),
        }
    }

    /// Wraps `adapter` and `templates` in a [`TemplateDispenser`] using the
    /// sequencer named by `params`. Templates are prepared here, so adapter
    /// configuration errors surface before the activity exists.
    pub fn from_templates<A: Adapter>(
        name: impl Into<String>,
        params: ActivityParams,
        adapter: A,
        templates: Vec<(OpTemplate, BindingFn)>,
    ) -> Result<Self, EngineError> {
        let settings = ActivitySettings::from_params(&params)?;
        let dispenser = TemplateDispenser::new(
            adapter,
            templates,
            settings.sequencer,
            Arc::new(FlowVariables::new()),
        )?;
        Ok(Self::new(name, params, Arc::new(dispenser)))
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MotorStatus {
    pub slot: usize,
    pub state: MotorState,
}

/// Point-in-time view of a live activity.
#[derive(Clone, Debug, Serialize)]
pub struct ActivityStatus {
    pub id: Uuid,
    pub name: String,
    pub state: ActivityState,
    pub halted: bool,
    pub version: u64,
    pub params: String,
    pub cycles: String,
    pub position: Cycle,
    pub remaining: Option<u64>,
    pub motors: Vec<MotorStatus>,
    pub metrics: MetricsSnapshot,
    pub limiters: Vec<RateLimiterState>,
    pub failures: u64,
    pub first_fatal: Option<FailureRecord>,
    pub dropped_metric_events: u64,
}

/// Final accounting once every motor has exited.
#[derive(Clone, Debug, Serialize)]
pub struct ActivitySummary {
    pub id: Uuid,
    pub name: String,
    pub state: ActivityState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cycles: String,
    pub position: Cycle,
    pub motors: Vec<MotorReport>,
    pub metrics: MetricsSnapshot,
    pub failures: u64,
    pub first_fatal: Option<FailureRecord>,
    pub recent_failures: Vec<FailureRecord>,
    pub abandoned: Vec<Cycle>,
    pub dropped_metric_events: u64,
}

impl ActivitySummary {
    pub fn is_success(&self) -> bool {
        self.first_fatal.is_none() && self.state != ActivityState::Halted
    }
}

struct MotorHandle {
    slot: usize,
    control: watch::Sender<RunCommand>,
    state: Arc<MotorStateCell>,
    task: JoinHandle<MotorReport>,
}

/// Decrements the live-motor count when a motor task ends, panics included.
struct LiveGuard(Arc<watch::Sender<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|live| *live = live.saturating_sub(1));
    }
}

struct Reporter {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Activity {
    id: Uuid,
    name: String,
    engine: EngineConfig,
    config: ActivityConfig,
    cycles: Arc<CycleSequence>,
    gate: Arc<DispatchGate>,
    dispenser: Arc<dyn OpDispenser>,
    external: Vec<Arc<dyn MetricsSink>>,
    metrics: Arc<ActivityMetrics>,
    failures: Arc<FailureLog>,
    halt: CancellationToken,
    state: ActivityState,
    shared: Option<Arc<MotorShared>>,
    buffered: Option<Arc<BufferedSink>>,
    motors: Vec<MotorHandle>,
    retired: Vec<MotorHandle>,
    reports: Vec<MotorReport>,
    live: Arc<watch::Sender<usize>>,
    reporter: Option<Reporter>,
    next_slot: usize,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("motors", &self.motors.len())
            .finish()
    }
}

impl Activity {
    /// Validates the parameters against the global engine configuration.
    pub fn new(def: ActivityDef) -> Result<Self, ActivityError> {
        Self::with_engine(def, get_config())
    }

    pub fn with_engine(def: ActivityDef, engine: EngineConfig) -> Result<Self, ActivityError> {
        let ActivityDef {
            name,
            params,
            dispenser,
            sinks,
        } = def;
        let config = ActivityConfig::new(params, engine.setting_defaults()).map_err(|source| {
            ActivityError::Params {
                activity: name.clone(),
                source,
            }
        })?;
        let settings = config.current().settings.clone();
        let metrics = ActivityMetrics::new(DEFAULT_THROUGHPUT_WINDOW).map_err(|source| {
            ActivityError::Metrics {
                activity: name.clone(),
                source,
            }
        })?;
        let (live, _) = watch::channel(0usize);
        let live = Arc::new(live);
        Ok(Self {
            id: Uuid::new_v4(),
            cycles: Arc::new(CycleSequence::new(settings.cycles)),
            gate: Arc::new(DispatchGate::new(settings.stride_rate, settings.rate)),
            name,
            engine,
            config,
            dispenser,
            external: sinks,
            metrics: Arc::new(metrics),
            failures: Arc::new(FailureLog::default()),
            halt: CancellationToken::new(),
            state: ActivityState::Initialized,
            shared: None,
            buffered: None,
            motors: Vec::new(),
            retired: Vec::new(),
            reports: Vec::new(),
            live,
            reporter: None,
            next_slot: 0,
            started_at: None,
            ended_at: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.config.current()
    }

    pub fn metrics(&self) -> Arc<ActivityMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cycles(&self) -> Arc<CycleSequence> {
        Arc::clone(&self.cycles)
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    fn invalid(&self, action: &'static str) -> ActivityError {
        ActivityError::InvalidTransition {
            activity: self.name.clone(),
            action,
            state: self.state,
        }
    }

    /// Spawns the motors. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), ActivityError> {
        if self.state != ActivityState::Initialized {
            return Err(self.invalid("start"));
        }
        let snapshot = self.config.current();
        let settings = &snapshot.settings;

        let mut sink = SinkSet::new().with(self.metrics.clone());
        if !self.external.is_empty() {
            let external = self
                .external
                .iter()
                .fold(SinkSet::new(), |set, sink| set.with(Arc::clone(sink)));
            let buffered = Arc::new(BufferedSink::spawn(
                Arc::new(external),
                self.engine.metrics_buffer,
            ));
            sink.push(buffered.clone());
            self.buffered = Some(buffered);
        }

        self.shared = Some(Arc::new(MotorShared {
            activity: self.name.clone(),
            cycles: Arc::clone(&self.cycles),
            gate: Arc::clone(&self.gate),
            dispenser: Arc::clone(&self.dispenser),
            sink,
            failures: Arc::clone(&self.failures),
            halt: self.halt.clone(),
            drain_window_ms: AtomicU64::new(settings.drain_timeout.as_millis() as u64),
        }));

        info!(
            activity = %self.name,
            id = %self.id,
            concurrency = settings.concurrency,
            cycles = %settings.cycles,
            rate = %settings.rate,
            stride_rate = %settings.stride_rate,
            "activity starting"
        );

        self.gate.reset();
        self.state = ActivityState::Running;
        self.started_at = Some(Utc::now());
        for _ in 0..settings.concurrency {
            self.spawn_motor();
        }

        if let Some(interval) = self.engine.progress_interval {
            let shutdown = CancellationToken::new();
            let task = spawn_progress_reporter(
                self.name.clone(),
                Arc::clone(&self.metrics),
                Arc::clone(&self.cycles),
                interval,
                shutdown.clone(),
            );
            self.reporter = Some(Reporter { shutdown, task });
        }
        Ok(())
    }

    fn spawn_motor(&mut self) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        let initial = if self.state == ActivityState::Paused {
            RunCommand::Pause
        } else {
            RunCommand::Run
        };
        let slot = self.next_slot;
        self.next_slot += 1;
        let (control, commands) = watch::channel(initial);
        let motor = Motor::new(slot, Arc::clone(shared), commands, self.config.subscribe());
        let state = motor.state_cell();
        self.live.send_modify(|live| *live += 1);
        let guard = LiveGuard(Arc::clone(&self.live));
        let task = tokio::spawn(async move {
            let _guard = guard;
            motor.run().await
        });
        self.motors.push(MotorHandle {
            slot,
            control,
            state,
            task,
        });
    }

    fn broadcast(&self, command: RunCommand) {
        for motor in &self.motors {
            motor.control.send_replace(command);
        }
    }

    pub fn pause(&mut self) -> Result<(), ActivityError> {
        if self.state != ActivityState::Running {
            return Err(self.invalid("pause"));
        }
        self.broadcast(RunCommand::Pause);
        self.state = ActivityState::Paused;
        info!(activity = %self.name, position = self.cycles.position(), "activity paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), ActivityError> {
        if self.state != ActivityState::Paused {
            return Err(self.invalid("resume"));
        }
        self.state = ActivityState::Running;
        self.broadcast(RunCommand::Run);
        info!(activity = %self.name, position = self.cycles.position(), "activity resumed");
        Ok(())
    }

    /// Publishes a new configuration version. Rates apply to the next permit,
    /// concurrency adds or retires motors, everything else is picked up by
    /// each motor at its next cycle boundary.
    pub fn reconfigure(&mut self, delta: &ParamDelta) -> Result<Arc<ConfigSnapshot>, ActivityError> {
        if self.state.is_terminal() || self.state == ActivityState::Stopping {
            return Err(self.invalid("reconfigure"));
        }
        let snapshot = self
            .config
            .apply(delta)
            .map_err(|source| ActivityError::Params {
                activity: self.name.clone(),
                source,
            })?;
        let settings = &snapshot.settings;
        if delta.touches("rate") {
            self.gate.op_limiter().set_rate(settings.rate);
        }
        if delta.touches("stride_rate") {
            self.gate.stride_limiter().set_rate(settings.stride_rate);
        }
        if let Some(shared) = &self.shared {
            shared.set_drain_window(settings.drain_timeout);
        }
        if self.state != ActivityState::Initialized {
            self.scale_to(settings.concurrency);
        }
        info!(
            activity = %self.name,
            version = snapshot.version,
            changed = %delta.keys().collect::<Vec<_>>().join(","),
            "activity reconfigured"
        );
        Ok(snapshot)
    }

    fn scale_to(&mut self, concurrency: usize) {
        let current = self.motors.len();
        if concurrency > current {
            for _ in current..concurrency {
                self.spawn_motor();
            }
        } else if concurrency < current {
            for motor in self.motors.drain(concurrency..) {
                motor.control.send_replace(RunCommand::Stop);
                self.retired.push(motor);
            }
        }
        if concurrency != current {
            debug!(activity = %self.name, from = current, to = concurrency, "motors rescaled");
        }
    }

    /// Resolves once no motor task is running.
    pub fn exited(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut live = self.live.subscribe();
        async move {
            let _ = live.wait_for(|count| *count == 0).await;
        }
    }

    /// Stops every motor, letting in-flight operations finish within
    /// `drain` (the `drain_timeout_ms` setting when `None`).
    pub async fn stop(&mut self, drain: Option<Duration>) -> Result<ActivitySummary, ActivityError> {
        match self.state {
            ActivityState::Initialized => {
                self.state = ActivityState::Stopped;
                self.ended_at = Some(Utc::now());
                return Ok(self.summary());
            }
            state if state.is_terminal() => return Ok(self.summary()),
            _ => {}
        }
        if let (Some(shared), Some(window)) = (&self.shared, drain) {
            shared.set_drain_window(window);
        }
        info!(
            activity = %self.name,
            position = self.cycles.position(),
            drain_ms = ?drain.map(|window| window.as_millis() as u64),
            "activity stopping"
        );
        self.state = ActivityState::Stopping;
        self.broadcast(RunCommand::Stop);
        let joined = self.join_motors().await;
        self.conclude(ActivityState::Stopped).await;
        joined.map(|()| self.summary())
    }

    /// Waits until the motors exit on their own: cycles exhausted or the
    /// activity halted.
    pub async fn await_completion(&mut self) -> Result<ActivitySummary, ActivityError> {
        match self.state {
            ActivityState::Initialized => return Err(self.invalid("await completion")),
            state if state.is_terminal() => return Ok(self.summary()),
            _ => {}
        }
        let joined = self.join_motors().await;
        self.conclude(ActivityState::Finished).await;
        joined.map(|()| self.summary())
    }

    async fn join_motors(&mut self) -> Result<(), ActivityError> {
        let mut first_error = None;
        let handles: Vec<MotorHandle> = self.retired.drain(..).chain(self.motors.drain(..)).collect();
        for handle in handles {
            match handle.task.await {
                Ok(report) => self.reports.push(report),
                Err(join_error) => {
                    warn!(
                        activity = %self.name,
                        slot = handle.slot,
                        error = %join_error,
                        "motor task failed"
                    );
                    first_error.get_or_insert(ActivityError::MotorFailed {
                        activity: self.name.clone(),
                        slot: handle.slot,
                        message: join_error.to_string(),
                    });
                }
            }
        }
        self.reports.sort_by_key(|report| report.slot);
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn conclude(&mut self, clean: ActivityState) {
        if let Some(buffered) = &self.buffered {
            buffered.flush().await;
        }
        if let Some(reporter) = self.reporter.take() {
            reporter.shutdown.cancel();
            let _ = reporter.task.await;
        }
        self.state = if self.halt.is_cancelled() {
            ActivityState::Halted
        } else {
            clean
        };
        self.ended_at = Some(Utc::now());
        let snapshot = self.metrics.snapshot();
        info!(
            activity = %self.name,
            state = %self.state,
            completed = snapshot.completed(),
            failed = snapshot.failed,
            position = self.cycles.position(),
            "activity ended"
        );
    }

    pub fn motor_states(&self) -> Vec<MotorStatus> {
        self.motors
            .iter()
            .map(|motor| MotorStatus {
                slot: motor.slot,
                state: motor.state.load(),
            })
            .collect()
    }

    fn dropped_metric_events(&self) -> u64 {
        self.buffered.as_ref().map_or(0, |buffered| buffered.dropped())
    }

    pub fn status(&self) -> ActivityStatus {
        let snapshot = self.config.current();
        ActivityStatus {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            halted: self.halt.is_cancelled(),
            version: snapshot.version,
            params: snapshot.params.to_string(),
            cycles: snapshot.settings.cycles.to_string(),
            position: self.cycles.position(),
            remaining: self.cycles.remaining(),
            motors: self.motor_states(),
            metrics: self.metrics.snapshot(),
            limiters: self.gate.states().into_iter().collect(),
            failures: self.failures.total(),
            first_fatal: self.failures.first_fatal(),
            dropped_metric_events: self.dropped_metric_events(),
        }
    }

    pub fn summary(&self) -> ActivitySummary {
        ActivitySummary {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            cycles: self.config.current().settings.cycles.to_string(),
            position: self.cycles.position(),
            motors: self.reports.clone(),
            metrics: self.metrics.snapshot(),
            failures: self.failures.total(),
            first_fatal: self.failures.first_fatal(),
            recent_failures: self.failures.recent(),
            abandoned: self
                .reports
                .iter()
                .flat_map(|report| report.abandoned.iter().copied())
                .collect(),
            dropped_metric_events: self.dropped_metric_events(),
        }
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        for motor in self.motors.iter().chain(self.retired.iter()) {
            motor.task.abort();
        }
        if let Some(reporter) = &self.reporter {
            reporter.shutdown.cancel();
        }
    }
}
