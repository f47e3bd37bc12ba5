//! cyclerun - cycle-driven concurrent activity execution engine.

pub mod activity;
pub mod config;
pub mod controller;
pub mod cycles;
pub mod errors;
pub mod flow;
pub mod inflight;
pub mod metrics;
pub mod motor;
pub mod ops;
pub mod params;
pub mod ratelimit;
pub mod retry;

pub use cyclerun_observability_macros::obs;

pub use activity::{
    Activity, ActivityDef, ActivityError, ActivityState, ActivityStatus, ActivitySummary,
    MotorStatus,
};
pub use config::{
    ActivityConfig, ConfigSnapshot, EngineConfig, get_config, set_config, try_get_config,
};
pub use controller::{ActivityController, ControllerError, ControllerHandle, EngineError};
pub use cycles::{Cycle, CycleError, CycleRange, CycleSegment, CycleSequence};
pub use errors::{
    BindingError, CycleFailure, ErrorKind, FailureLog, FailureRecord, OpError, TransientKind,
    ValueKind,
};
pub use flow::{FlowContext, FlowVariables, VarOrdinal};
pub use inflight::{DrainReport, InFlightTracker, TrackedOp, TrackedOpId, TrackedState};
pub use metrics::{
    ActivityMetrics, BufferedSink, CycleOutcome, MetricsSink, MetricsSnapshot, OutcomeStatus,
    RecordingSink, SinkSet,
};
pub use motor::{MotorReport, MotorState, RunCommand};
pub use ops::{
    Adapter, BindingFn, Bindings, ChainStep, FieldSpec, OpDispenser, OpFuture, OpTemplate,
    Operation, OperationKind, SequencerKind, TemplateDispenser,
};
pub use params::{ActivityParams, ActivitySettings, ErrorMode, ParamDelta, ParamError};
pub use ratelimit::{DispatchGate, RateLimiter, RateLimiterState, RateSpec};
pub use retry::{BackoffConfig, RecoveryAction, RetryPolicy};
