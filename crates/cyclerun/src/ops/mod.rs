//! Operations and the dispensers that build them from cycles.

mod dispenser;
mod sequence;
mod template;

use std::fmt;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::errors::OpError;
use crate::flow::FlowContext;

pub use dispenser::{Adapter, OpDispenser, PreparedCache, TemplateDispenser};
pub use sequence::{OpSequence, SequencerKind};
pub use template::{
    BindingFn, Bindings, FieldSpec, OpTemplate, TemplateKey, diagnose_bindings,
};

pub type OpFuture = BoxFuture<'static, Result<Value, OpError>>;

type RunFn = Box<dyn FnOnce(&mut FlowContext) -> Result<(), OpError> + Send>;
type ValueFn = Box<dyn FnOnce(&mut FlowContext) -> Result<Value, OpError> + Send>;
type ChainFn = Box<dyn FnOnce(&mut FlowContext) -> Result<ChainStep, OpError> + Send>;

/// One schedulable unit of work built for a single cycle. Consumed by
/// execution; a retry asks the dispenser for a fresh instance.
pub enum Operation {
    /// Fire-and-forget; success carries no value.
    Runnable(RunFn),
    /// Produces a value inline on the motor.
    SyncValue(ValueFn),
    /// Produces a value off the motor, tracked by the in-flight tracker.
    /// The future never sees the slot's [`FlowContext`]: values it needs are
    /// captured at bind time. To read or write flow variables around async
    /// work, return it as the follow-up of a [`Operation::SelfChaining`] link.
    AsyncValue(OpFuture),
    /// Produces a value and optionally a follow-up (pagination continuation).
    SelfChaining(ChainFn),
}

/// Result of one link in a self-chaining operation.
pub struct ChainStep {
    pub value: Value,
    pub next: Option<Operation>,
}

impl ChainStep {
    pub fn done(value: Value) -> Self {
        Self { value, next: None }
    }

    pub fn then(value: Value, next: Operation) -> Self {
        Self {
            value,
            next: Some(next),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Runnable,
    SyncValue,
    AsyncValue,
    SelfChaining,
}

impl Operation {
    pub fn runnable<F>(f: F) -> Self
    where
        F: FnOnce(&mut FlowContext) -> Result<(), OpError> + Send + 'static,
    {
        Operation::Runnable(Box::new(f))
    }

    pub fn sync_value<F>(f: F) -> Self
    where
        F: FnOnce(&mut FlowContext) -> Result<Value, OpError> + Send + 'static,
    {
        Operation::SyncValue(Box::new(f))
    }

    pub fn async_value<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<Value, OpError>> + Send + 'static,
    {
        Operation::AsyncValue(Box::pin(future))
    }

    pub fn self_chaining<F>(f: F) -> Self
    where
        F: FnOnce(&mut FlowContext) -> Result<ChainStep, OpError> + Send + 'static,
    {
        Operation::SelfChaining(Box::new(f))
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Runnable(_) => OperationKind::Runnable,
            Operation::SyncValue(_) => OperationKind::SyncValue,
            Operation::AsyncValue(_) => OperationKind::AsyncValue,
            Operation::SelfChaining(_) => OperationKind::SelfChaining,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Operation::AsyncValue(_))
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Operation").field(&self.kind()).finish()
    }
}

/// Where inline execution of an operation ended.
pub enum Inline {
    Done(Value),
    /// A chain handed off to an async follow-up, still to be awaited.
    Deferred(OpFuture),
}

impl fmt::Debug for Inline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inline::Done(value) => f.debug_tuple("Done").field(value).finish(),
            Inline::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Runs a non-async operation inline, following self-chained links up to
/// `chain_limit` follow-ups. Returns the last produced value.
pub fn run_inline(
    op: Operation,
    flow: &mut FlowContext,
    chain_limit: u32,
) -> Result<Value, OpError> {
    match run_until_async(op, flow, chain_limit)? {
        Inline::Done(value) => Ok(value),
        Inline::Deferred(_) => Err(OpError::fatal(
            "async operation cannot be continued inline from a chain",
        )),
    }
}

/// Like [`run_inline`], but stops at the first async link and hands its
/// future back. The hand-off counts as a follow-up.
pub fn run_until_async(
    op: Operation,
    flow: &mut FlowContext,
    chain_limit: u32,
) -> Result<Inline, OpError> {
    let mut current = op;
    let mut follow_ups = 0u32;
    loop {
        let step = match current {
            Operation::Runnable(run) => return run(flow).map(|()| Inline::Done(Value::Null)),
            Operation::SyncValue(produce) => return produce(flow).map(Inline::Done),
            Operation::AsyncValue(future) => return Ok(Inline::Deferred(future)),
            Operation::SelfChaining(link) => link(flow)?,
        };
        match step.next {
            None => return Ok(Inline::Done(step.value)),
            Some(next) => {
                follow_ups += 1;
                if follow_ups > chain_limit {
                    return Err(OpError::unexpected_paging(format!(
                        "operation chained more than {chain_limit} follow-ups"
                    )));
                }
                current = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::{ErrorKind, TransientKind};
    use crate::flow::FlowVariables;

    fn pages(remaining: u32) -> Operation {
        Operation::self_chaining(move |_| {
            if remaining == 0 {
                Ok(ChainStep::done(json!("last")))
            } else {
                Ok(ChainStep::then(json!(remaining), pages(remaining - 1)))
            }
        })
    }

    #[test]
    fn chain_within_limit_returns_last_value() {
        let mut flow = FlowContext::new(0);
        let value = run_inline(pages(3), &mut flow, 3).unwrap();
        assert_eq!(value, json!("last"));
    }

    #[test]
    fn chain_over_limit_is_unexpected_paging() {
        let mut flow = FlowContext::new(0);
        let error = run_inline(pages(5), &mut flow, 2).unwrap_err();
        assert_eq!(error.transient_kind(), Some(TransientKind::UnexpectedPaging));
        assert_eq!(error.kind(), ErrorKind::UnexpectedPaging);
    }

    #[test]
    fn runnable_yields_null_and_sync_propagates_errors() {
        let mut flow = FlowContext::new(0);
        assert_eq!(
            run_inline(Operation::runnable(|_| Ok(())), &mut flow, 0).unwrap(),
            Value::Null
        );
        let error = run_inline(
            Operation::sync_value(|_| Err(OpError::unapplied("cas lost"))),
            &mut flow,
            0,
        )
        .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Unapplied);
        assert_eq!(
            Operation::async_value(async { Ok(Value::Null) }).kind(),
            OperationKind::AsyncValue
        );
    }

    #[tokio::test]
    async fn chain_hands_async_follow_up_back_with_flow_applied() {
        let vars = FlowVariables::new();
        let token = vars.ordinal("session", "token");
        let mut flow = FlowContext::new(0);
        flow.reset(7);

        let op = Operation::self_chaining(move |flow| {
            flow.set(token, json!("t-7"));
            let captured = flow.get(token).cloned().unwrap_or(Value::Null);
            Ok(ChainStep::then(
                json!("login"),
                Operation::async_value(async move { Ok(json!({ "token": captured })) }),
            ))
        });
        let Inline::Deferred(future) = run_until_async(op, &mut flow, 1).unwrap() else {
            panic!("expected the async follow-up");
        };
        assert_eq!(flow.get(token), Some(&json!("t-7")));
        assert_eq!(future.await.unwrap(), json!({ "token": "t-7" }));

        let inline = run_inline(
            Operation::self_chaining(|_| {
                Ok(ChainStep::then(Value::Null, Operation::async_value(async { Ok(Value::Null) })))
            }),
            &mut flow,
            1,
        );
        assert_eq!(inline.unwrap_err().kind(), ErrorKind::Fatal);
    }
}
