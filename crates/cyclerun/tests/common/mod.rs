//! Shared helpers for engine integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use cyclerun::{
    Activity, ActivityDef, ActivitySummary, Adapter, BindingError, Bindings, Cycle, EngineConfig,
    FlowVariables, OpDispenser, OpError, OpTemplate, Operation, RecordingSink,
};

/// Engine settings for tests: no progress reporter.
pub fn engine() -> EngineConfig {
    EngineConfig {
        progress_interval: None,
        ..EngineConfig::default()
    }
}

/// Builds, starts and awaits an activity, recording every metrics event.
pub async fn run_to_completion(
    params: &str,
    dispenser: Arc<dyn OpDispenser>,
) -> anyhow::Result<(ActivitySummary, Arc<RecordingSink>)> {
    let recorder = Arc::new(RecordingSink::new());
    let def = ActivityDef::new("under-test", params.parse()?, dispenser).with_sink(recorder.clone());
    let mut activity = Activity::with_engine(def, engine())?;
    activity.start()?;
    let summary = activity.await_completion().await?;
    Ok((summary, recorder))
}

pub fn noop(cycle: Cycle) -> Result<Operation, OpError> {
    Ok(Operation::sync_value(move |_| Ok(json!(cycle))))
}

/// Wraps a dispenser and counts calls per cycle on every path.
pub struct Counted {
    inner: Arc<dyn OpDispenser>,
    created: Mutex<BTreeMap<Cycle, u32>>,
    diagnosed: Mutex<BTreeMap<Cycle, u32>>,
    rebound: Mutex<BTreeMap<Cycle, u32>>,
}

impl Counted {
    pub fn new(inner: Arc<dyn OpDispenser>) -> Self {
        Self {
            inner,
            created: Mutex::new(BTreeMap::new()),
            diagnosed: Mutex::new(BTreeMap::new()),
            rebound: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn created(&self) -> BTreeMap<Cycle, u32> {
        self.created.lock().unwrap().clone()
    }

    pub fn diagnosed(&self) -> BTreeMap<Cycle, u32> {
        self.diagnosed.lock().unwrap().clone()
    }

    pub fn rebound(&self) -> BTreeMap<Cycle, u32> {
        self.rebound.lock().unwrap().clone()
    }
}

impl OpDispenser for Counted {
    fn create(&self, cycle: Cycle) -> Result<Operation, OpError> {
        *self.created.lock().unwrap().entry(cycle).or_default() += 1;
        self.inner.create(cycle)
    }

    fn diagnose(&self, cycle: Cycle) -> Result<Bindings, OpError> {
        *self.diagnosed.lock().unwrap().entry(cycle).or_default() += 1;
        self.inner.diagnose(cycle)
    }

    fn rebind(&self, cycle: Cycle, bindings: &Bindings) -> Result<Operation, OpError> {
        *self.rebound.lock().unwrap().entry(cycle).or_default() += 1;
        self.inner.rebind(cycle, bindings)
    }
}

/// Key/value adapter whose fast path requires `key` to already be an integer.
#[derive(Default)]
pub struct KvAdapter {
    pub prepares: AtomicU32,
}

impl Adapter for KvAdapter {
    type Prepared = String;

    fn name(&self) -> &str {
        "kv"
    }

    fn prepare(&self, template: &OpTemplate, _: &FlowVariables) -> Result<String, OpError> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(template.statement.clone())
    }

    fn bind(
        &self,
        prepared: &Arc<String>,
        _: &OpTemplate,
        _: Cycle,
        bindings: Bindings,
    ) -> Result<Operation, OpError> {
        let key = bindings
            .get("key")
            .and_then(Value::as_i64)
            .ok_or_else(|| BindingError::unqualified("could not bind key"))?;
        let statement = Arc::clone(prepared);
        Ok(Operation::sync_value(move |_| {
            Ok(json!({ "statement": *statement, "key": key }))
        }))
    }
}
