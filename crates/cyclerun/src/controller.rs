//! Lifecycle surface over named activities.
//!
//! [`ActivityController`] can be driven directly, or moved onto its own task
//! with [`ActivityController::spawn`] and driven through a cloneable
//! [`ControllerHandle`]. Commands are processed one at a time; waiting for an
//! activity to finish does not hold up other commands.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityDef, ActivityError, ActivityStatus, ActivitySummary};
use crate::config::{ConfigSnapshot, EngineConfig, get_config};
use crate::cycles::CycleError;
use crate::errors::OpError;
use crate::params::{ParamDelta, ParamError};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no activity named `{0}`")]
    UnknownActivity(String),
    #[error("an activity named `{0}` is already registered")]
    DuplicateActivity(String),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error("activity controller is no longer running")]
    Closed,
}

/// Any error the engine reports to its embedder.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error(transparent)]
    Cycles(#[from] CycleError),
    #[error(transparent)]
    Operation(#[from] OpError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

pub struct ActivityController {
    engine: EngineConfig,
    activities: BTreeMap<String, Activity>,
}

impl Default for ActivityController {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityController {
    pub fn new() -> Self {
        Self::with_engine(get_config())
    }

    pub fn with_engine(engine: EngineConfig) -> Self {
        Self {
            engine,
            activities: BTreeMap::new(),
        }
    }

    fn activity(&mut self, name: &str) -> Result<&mut Activity, ControllerError> {
        self.activities
            .get_mut(name)
            .ok_or_else(|| ControllerError::UnknownActivity(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.activities.keys().cloned().collect()
    }

    /// Validates and registers an activity without starting it.
    pub fn register(&mut self, def: ActivityDef) -> Result<Uuid, ControllerError> {
        if self.activities.contains_key(&def.name) {
            return Err(ControllerError::DuplicateActivity(def.name));
        }
        let activity = Activity::with_engine(def, self.engine.clone())?;
        let id = activity.id();
        debug!(activity = %activity.name(), %id, "activity registered");
        self.activities.insert(activity.name().to_string(), activity);
        Ok(id)
    }

    pub fn start(&mut self, name: &str) -> Result<(), ControllerError> {
        Ok(self.activity(name)?.start()?)
    }

    pub fn pause(&mut self, name: &str) -> Result<(), ControllerError> {
        Ok(self.activity(name)?.pause()?)
    }

    pub fn resume(&mut self, name: &str) -> Result<(), ControllerError> {
        Ok(self.activity(name)?.resume()?)
    }

    /// Stops `name`, giving in-flight operations `drain_timeout_ms` to finish
    /// (the activity's `drain_timeout_ms` setting when `None`).
    pub async fn stop(
        &mut self,
        name: &str,
        drain_timeout_ms: Option<u64>,
    ) -> Result<ActivitySummary, ControllerError> {
        let drain = drain_timeout_ms.map(Duration::from_millis);
        Ok(self.activity(name)?.stop(drain).await?)
    }

    pub fn reconfigure(
        &mut self,
        name: &str,
        delta: &ParamDelta,
    ) -> Result<Arc<ConfigSnapshot>, ControllerError> {
        Ok(self.activity(name)?.reconfigure(delta)?)
    }

    pub async fn await_activity(&mut self, name: &str) -> Result<ActivitySummary, ControllerError> {
        Ok(self.activity(name)?.await_completion().await?)
    }

    pub fn status(&self, name: &str) -> Result<ActivityStatus, ControllerError> {
        self.activities
            .get(name)
            .map(Activity::status)
            .ok_or_else(|| ControllerError::UnknownActivity(name.to_string()))
    }

    pub fn statuses(&self) -> Vec<ActivityStatus> {
        self.activities.values().map(Activity::status).collect()
    }

    /// Stops every activity that has not already ended. Failures are logged
    /// and the remaining activities are still stopped.
    pub async fn stop_all(&mut self, drain: Option<Duration>) -> Vec<ActivitySummary> {
        let mut summaries = Vec::with_capacity(self.activities.len());
        for activity in self.activities.values_mut() {
            match activity.stop(drain).await {
                Ok(summary) => summaries.push(summary),
                Err(error) => {
                    warn!(activity = %activity.name(), error = %error, "activity failed to stop cleanly");
                    summaries.push(activity.summary());
                }
            }
        }
        summaries
    }

    /// Moves the controller onto its own task. The task ends, stopping every
    /// activity, once all handles are dropped.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let loopback = sender.downgrade();
        let task = tokio::spawn(self.serve(receiver, loopback));
        (ControllerHandle { sender }, task)
    }

    async fn serve(
        mut self,
        mut commands: mpsc::Receiver<ControllerCommand>,
        loopback: mpsc::WeakSender<ControllerCommand>,
    ) {
        info!("activity controller started");
        while let Some(command) = commands.recv().await {
            match command {
                ControllerCommand::Register { def, reply } => {
                    let _ = reply.send(self.register(*def));
                }
                ControllerCommand::Start { name, reply } => {
                    let _ = reply.send(self.start(&name));
                }
                ControllerCommand::Pause { name, reply } => {
                    let _ = reply.send(self.pause(&name));
                }
                ControllerCommand::Resume { name, reply } => {
                    let _ = reply.send(self.resume(&name));
                }
                ControllerCommand::Stop {
                    name,
                    drain_timeout_ms,
                    reply,
                } => {
                    let _ = reply.send(self.stop(&name, drain_timeout_ms).await);
                }
                ControllerCommand::Reconfigure { name, delta, reply } => {
                    let _ = reply.send(self.reconfigure(&name, &delta));
                }
                ControllerCommand::Await { name, reply } => {
                    let Some(activity) = self.activities.get(&name) else {
                        let _ = reply.send(Err(ControllerError::UnknownActivity(name)));
                        continue;
                    };
                    let Some(sender) = loopback.upgrade() else {
                        let _ = reply.send(Err(ControllerError::Closed));
                        continue;
                    };
                    let exited = activity.exited();
                    tokio::spawn(async move {
                        exited.await;
                        let _ = sender
                            .send(ControllerCommand::Collect { name, reply })
                            .await;
                    });
                }
                ControllerCommand::Collect { name, reply } => {
                    let _ = reply.send(self.await_activity(&name).await);
                }
                ControllerCommand::Status { name, reply } => {
                    let _ = reply.send(self.status(&name));
                }
                ControllerCommand::List { reply } => {
                    let _ = reply.send(self.statuses());
                }
                ControllerCommand::StopAll { drain, reply } => {
                    let _ = reply.send(self.stop_all(drain).await);
                }
            }
        }
        let summaries = self.stop_all(None).await;
        info!(activities = summaries.len(), "activity controller exiting");
    }
}

type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

enum ControllerCommand {
    Register {
        def: Box<ActivityDef>,
        reply: Reply<Uuid>,
    },
    Start {
        name: String,
        reply: Reply<()>,
    },
    Pause {
        name: String,
        reply: Reply<()>,
    },
    Resume {
        name: String,
        reply: Reply<()>,
    },
    Stop {
        name: String,
        drain_timeout_ms: Option<u64>,
        reply: Reply<ActivitySummary>,
    },
    Reconfigure {
        name: String,
        delta: ParamDelta,
        reply: Reply<Arc<ConfigSnapshot>>,
    },
    Await {
        name: String,
        reply: Reply<ActivitySummary>,
    },
    /// Sent back to the controller once an awaited activity's motors exit.
    Collect {
        name: String,
        reply: Reply<ActivitySummary>,
    },
    Status {
        name: String,
        reply: Reply<ActivityStatus>,
    },
    List {
        reply: oneshot::Sender<Vec<ActivityStatus>>,
    },
    StopAll {
        drain: Option<Duration>,
        reply: oneshot::Sender<Vec<ActivitySummary>>,
    },
}

/// Cloneable client for a spawned [`ActivityController`].
#[derive(Clone)]
pub struct ControllerHandle {
    sender: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> Result<T, ControllerError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| ControllerError::Closed)?;
        response.await.map_err(|_| ControllerError::Closed)
    }

    pub async fn register(&self, def: ActivityDef) -> Result<Uuid, ControllerError> {
        let def = Box::new(def);
        self.request(|reply| ControllerCommand::Register { def, reply })
            .await?
    }

    pub async fn start(&self, name: impl Into<String>) -> Result<(), ControllerError> {
        let name = name.into();
        self.request(|reply| ControllerCommand::Start { name, reply })
            .await?
    }

    pub async fn pause(&self, name: impl Into<String>) -> Result<(), ControllerError> {
        let name = name.into();
        self.request(|reply| ControllerCommand::Pause { name, reply })
            .await?
    }

    pub async fn resume(&self, name: impl Into<String>) -> Result<(), ControllerError> {
        let name = name.into();
        self.request(|reply| ControllerCommand::Resume { name, reply })
            .await?
    }

    pub async fn stop(
        &self,
        name: impl Into<String>,
        drain_timeout_ms: Option<u64>,
    ) -> Result<ActivitySummary, ControllerError> {
        let name = name.into();
        self.request(|reply| ControllerCommand::Stop {
            name,
            drain_timeout_ms,
            reply,
        })
        .await?
    }

    pub async fn reconfigure(
        &self,
        name: impl Into<String>,
        delta: ParamDelta,
    ) -> Result<Arc<ConfigSnapshot>, ControllerError> {
        let name = name.into();
        self.request(|reply| ControllerCommand::Reconfigure { name, delta, reply })
            .await?
    }

    /// Resolves once the activity's motors exit on their own.
    pub async fn await_activity(
        &self,
        name: impl Into<String>,
    ) -> Result<ActivitySummary, ControllerError> {
        let name = name.into();
        self.request(|reply| ControllerCommand::Await { name, reply })
            .await?
    }

    pub async fn status(&self, name: impl Into<String>) -> Result<ActivityStatus, ControllerError> {
        let name = name.into();
        self.request(|reply| ControllerCommand::Status { name, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<ActivityStatus>, ControllerError> {
        self.request(|reply| ControllerCommand::List { reply }).await
    }

    pub async fn stop_all(
        &self,
        drain: Option<Duration>,
    ) -> Result<Vec<ActivitySummary>, ControllerError> {
        self.request(|reply| ControllerCommand::StopAll { drain, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::activity::ActivityState;
    use crate::cycles::Cycle;
    use crate::ops::Operation;

    fn noop(_cycle: Cycle) -> Result<Operation, OpError> {
        Ok(Operation::sync_value(|_| Ok(Value::Null)))
    }

    fn engine() -> EngineConfig {
        EngineConfig {
            progress_interval: None,
            ..EngineConfig::default()
        }
    }

    fn def(name: &str, params: &str) -> ActivityDef {
        ActivityDef::new(name, params.parse().unwrap(), Arc::new(noop))
    }

    #[tokio::test]
    async fn unknown_and_duplicate_names_are_rejected() {
        let mut controller = ActivityController::with_engine(engine());
        controller.register(def("reads", "cycles=5")).unwrap();
        assert!(matches!(
            controller.register(def("reads", "cycles=5")),
            Err(ControllerError::DuplicateActivity(name)) if name == "reads"
        ));
        assert!(matches!(
            controller.start("writes"),
            Err(ControllerError::UnknownActivity(_))
        ));
        assert!(matches!(
            controller.register(def("bad", "cycles=5;rate=fast")),
            Err(ControllerError::Activity(ActivityError::Params { .. }))
        ));
        assert_eq!(controller.names(), vec!["reads".to_string()]);
    }

    #[tokio::test]
    async fn direct_lifecycle_runs_to_completion() {
        let mut controller = ActivityController::with_engine(engine());
        controller.register(def("reads", "cycles=100;concurrency=4")).unwrap();
        controller.start("reads").unwrap();
        let summary = controller.await_activity("reads").await.unwrap();
        assert_eq!(summary.state, ActivityState::Finished);
        assert_eq!(summary.metrics.succeeded, 100);
        assert_eq!(controller.status("reads").unwrap().state, ActivityState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_drives_spawned_controller() {
        let (handle, task) = ActivityController::with_engine(engine()).spawn();
        handle.register(def("writes", "cycles=400;rate=100")).await.unwrap();
        handle.start("writes").await.unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.await_activity("writes").await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.pause("writes").await.unwrap();
        let paused = handle.status("writes").await.unwrap();
        assert_eq!(paused.state, ActivityState::Paused);

        let snapshot = handle
            .reconfigure("writes", ParamDelta::new().set("rate", "1000"))
            .await
            .unwrap();
        assert_eq!(snapshot.version, 2);
        handle.resume("writes").await.unwrap();

        let summary = waiter.await.unwrap().unwrap();
        assert_eq!(summary.state, ActivityState::Finished);
        assert_eq!(summary.metrics.completed(), 400);
        assert_eq!(handle.list().await.unwrap().len(), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_ends_unbounded_activities() {
        let (handle, task) = ActivityController::with_engine(engine()).spawn();
        handle.register(def("a", "cycles=0..;rate=50")).await.unwrap();
        handle.register(def("b", "cycles=0..;rate=50")).await.unwrap();
        handle.start("a").await.unwrap();
        handle.start("b").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let summaries = handle.stop_all(Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|summary| summary.state == ActivityState::Stopped));
        assert!(summaries.iter().all(|summary| summary.metrics.completed() > 0));
        drop(handle);
        task.await.unwrap();
    }
}
