//! Synthetic adapter: operations that exercise the engine without a real
//! target system.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};

use cyclerun::{
    Adapter, BindingError, BindingFn, Bindings, Cycle, FieldSpec, FlowVariables, OpError,
    OpTemplate, Operation, ValueKind, VarOrdinal,
};

/// Workload shape selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Workload {
    /// Inline operations that return immediately.
    Noop,
    /// Async operations that sleep for a per-cycle delay.
    Sleep,
    /// Sleeping operations that time out on a fraction of attempts.
    Flaky,
    /// Three noops, one sleep and one flaky op per stride.
    Mixed,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkloadShape {
    pub delay_ms: u64,
    pub jitter_ms: u64,
    pub fail_ratio: f64,
}

#[derive(Debug)]
pub enum Prepared {
    /// Records the cycle it ran in a flow variable of its space.
    Noop { last_cycle: VarOrdinal },
    Sleep,
    Flaky { fail_ratio: f64 },
}

pub struct SyntheticAdapter {
    shape: WorkloadShape,
}

impl SyntheticAdapter {
    pub fn new(shape: WorkloadShape) -> Self {
        Self { shape }
    }
}

impl Adapter for SyntheticAdapter {
    type Prepared = Prepared;

    fn name(&self) -> &str {
        "synthetic"
    }

    fn prepare(
        &self,
        template: &OpTemplate,
        flow_vars: &FlowVariables,
    ) -> Result<Prepared, OpError> {
        match template.statement.as_str() {
            "noop" => Ok(Prepared::Noop {
                last_cycle: flow_vars.ordinal(template.space(), "last_cycle"),
            }),
            "sleep" => Ok(Prepared::Sleep),
            "flaky" => Ok(Prepared::Flaky {
                fail_ratio: self.shape.fail_ratio.clamp(0.0, 1.0),
            }),
            other => Err(OpError::configuration(format!(
                "synthetic adapter has no `{other}` operation"
            ))),
        }
    }

    fn bind(
        &self,
        prepared: &Arc<Prepared>,
        _template: &OpTemplate,
        cycle: Cycle,
        bindings: Bindings,
    ) -> Result<Operation, OpError> {
        match prepared.as_ref() {
            Prepared::Noop { last_cycle } => {
                let last_cycle = *last_cycle;
                Ok(Operation::runnable(move |flow| {
                    flow.set(last_cycle, json!(cycle));
                    Ok(())
                }))
            }
            Prepared::Sleep => {
                let delay_ms = delay_of(&bindings)?;
                Ok(Operation::async_value(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    Ok(json!({ "cycle": cycle, "slept_ms": delay_ms }))
                }))
            }
            Prepared::Flaky { fail_ratio } => {
                let delay_ms = delay_of(&bindings)?;
                let fails = rand::thread_rng().gen_bool(*fail_ratio);
                Ok(Operation::async_value(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if fails {
                        Err(OpError::timeout(format!("cycle {cycle}: synthetic timeout")))
                    } else {
                        Ok(json!({ "cycle": cycle }))
                    }
                }))
            }
        }
    }
}

fn delay_of(bindings: &Bindings) -> Result<u64, OpError> {
    bindings
        .get("delay_ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| BindingError::unqualified("delay_ms is not an unsigned integer").into())
}

/// Per-cycle delay: the base delay plus jitter drawn from an rng seeded by the cycle.
fn delay_bindings(shape: WorkloadShape) -> BindingFn {
    Arc::new(move |cycle: Cycle| {
        let jitter = if shape.jitter_ms == 0 {
            0
        } else {
            StdRng::seed_from_u64(cycle).gen_range(0..=shape.jitter_ms)
        };
        Ok(Bindings::from([(
            "delay_ms".to_string(),
            json!(shape.delay_ms + jitter),
        )]))
    })
}

fn no_bindings() -> BindingFn {
    Arc::new(|_: Cycle| Ok(Bindings::new()))
}

pub fn templates(workload: Workload, shape: WorkloadShape) -> Vec<(OpTemplate, BindingFn)> {
    let noop = || {
        (
            OpTemplate::new("noop", "noop").in_space("synthetic"),
            no_bindings(),
        )
    };
    let sleep = || {
        (
            OpTemplate::new("sleep", "sleep")
                .with_field(FieldSpec::required("delay_ms", ValueKind::Integer)),
            delay_bindings(shape),
        )
    };
    let flaky = || {
        (
            OpTemplate::new("flaky", "flaky")
                .with_field(FieldSpec::required("delay_ms", ValueKind::Integer)),
            delay_bindings(shape),
        )
    };
    match workload {
        Workload::Noop => vec![noop()],
        Workload::Sleep => vec![sleep()],
        Workload::Flaky => vec![flaky()],
        Workload::Mixed => {
            let (template, bindings) = noop();
            vec![(template.with_ratio(3), bindings), sleep(), flaky()]
        }
    }
}
