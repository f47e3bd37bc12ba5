//! End-to-end activity scenarios: coverage, rate, retries and diagnostics.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use cyclerun::{
    ActivityDef, ActivityState, BindingFn, Bindings, ChainStep, Cycle, CycleOutcome, ErrorKind,
    FieldSpec, OpDispenser, OpError, OpTemplate, Operation, ValueKind,
};

use common::{Counted, KvAdapter, noop, run_to_completion};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_motors_complete_every_cycle_exactly_once() -> Result<()> {
    let (summary, recorder) =
        run_to_completion("concurrency=4;cycles=0..999;rate=unlimited", Arc::new(noop)).await?;

    assert_eq!(summary.state, ActivityState::Finished);
    assert_eq!(summary.metrics.succeeded, 1000);
    let counts = recorder.completion_counts();
    assert_eq!(counts.len(), 1000);
    assert!(counts.values().all(|count| *count == 1));
    assert_eq!(
        counts.keys().copied().collect::<BTreeSet<_>>(),
        (0..1000).collect::<BTreeSet<_>>()
    );
    assert_eq!(recorder.started().len(), 1000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rate_limited_run_takes_expected_wall_time() -> Result<()> {
    let started = tokio::time::Instant::now();
    let (summary, _) = run_to_completion("rate=100;cycles=0..199", Arc::new(noop)).await?;
    let elapsed = started.elapsed();

    assert_eq!(summary.metrics.completed(), 200);
    assert!(
        elapsed >= Duration::from_millis(1900) && elapsed <= Duration::from_millis(2100),
        "elapsed {elapsed:?}"
    );
    Ok(())
}

#[tokio::test]
async fn retryable_failure_exhausts_exactly_maxtries() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let dispenser = move |_cycle: Cycle| -> Result<Operation, OpError> {
        Ok(Operation::sync_value({
            let counter = Arc::clone(&counter);
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(OpError::timeout("downstream did not answer"))
            }
        }))
    };
    let (summary, recorder) =
        run_to_completion("cycles=1;maxtries=3;retryable_errors=timeout", Arc::new(dispenser))
            .await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        recorder.outcome_of(0),
        Some(CycleOutcome::failed(ErrorKind::TriesExhausted, 3))
    );
    assert_eq!(recorder.errors().len(), 3);
    let fatal = summary.first_fatal.expect("exhaustion is fatal");
    assert_eq!(fatal.kind, ErrorKind::TriesExhausted);
    assert_eq!(fatal.tries, 3);
    assert_eq!(fatal.cycle, 0);
    assert_eq!(summary.state, ActivityState::Halted);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn async_retryable_failure_exhausts_exactly_maxtries() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let dispenser = move |_cycle: Cycle| -> Result<Operation, OpError> {
        let counter = Arc::clone(&counter);
        Ok(Operation::async_value(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            Err(OpError::timeout("downstream did not answer"))
        }))
    };
    let (summary, recorder) = run_to_completion(
        "cycles=8;async=4;maxtries=3;errors=count;retryable_errors=timeout",
        Arc::new(dispenser),
    )
    .await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 24);
    for cycle in 0..8 {
        assert_eq!(
            recorder.outcome_of(cycle),
            Some(CycleOutcome::failed(ErrorKind::TriesExhausted, 3))
        );
    }
    assert_eq!(recorder.errors().len(), 24);
    assert_eq!(summary.metrics.failed, 8);
    assert_eq!(summary.state, ActivityState::Finished);
    Ok(())
}

#[tokio::test]
async fn unapplied_is_not_retried_when_only_timeouts_are() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let dispenser = move |_cycle: Cycle| -> Result<Operation, OpError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Operation::sync_value(|_| Err(OpError::unapplied("condition not met"))))
    };
    let (summary, recorder) =
        run_to_completion("cycles=1;maxtries=5;retryable_errors=timeout", Arc::new(dispenser))
            .await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.outcome_of(0),
        Some(CycleOutcome::failed(ErrorKind::Unapplied, 1))
    );
    assert_eq!(summary.failures, 1);
    Ok(())
}

fn kv_bindings() -> BindingFn {
    Arc::new(|cycle: Cycle| {
        let key = match cycle {
            7 => json!("7"),
            42 => json!("forty-two"),
            other => json!(other),
        };
        Ok(Bindings::from([("key".to_string(), key)]))
    })
}

#[tokio::test]
async fn binding_error_runs_diagnostics_once_for_that_cycle() -> Result<()> {
    let template =
        OpTemplate::new("put", "PUT ?").with_field(FieldSpec::required("key", ValueKind::Integer));
    let def = ActivityDef::from_templates(
        "kv",
        "cycles=100;errors=count".parse()?,
        KvAdapter::default(),
        vec![(template, kv_bindings())],
    )?;
    let counted = Arc::new(Counted::new(def.dispenser));
    let (summary, recorder) = run_to_completion("cycles=100;errors=count", counted.clone()).await?;

    assert_eq!(summary.state, ActivityState::Finished);
    let diagnosed = counted.diagnosed();
    assert_eq!(diagnosed.get(&42), Some(&1));
    // Cycle 7 carries a convertible string and is corrected on the slow path.
    assert_eq!(diagnosed.get(&7), Some(&1));
    assert_eq!(diagnosed.len(), 2);
    assert_eq!(recorder.outcome_of(7), Some(CycleOutcome::succeeded(2)));

    assert_eq!(summary.failures, 1);
    let fatal = summary.first_fatal.expect("cycle 42 fails");
    assert_eq!(fatal.cycle, 42);
    assert_eq!(fatal.kind, ErrorKind::Binding);
    assert!(fatal.message.contains("`key`"), "message: {}", fatal.message);
    assert!(fatal.message.contains("forty-two"), "message: {}", fatal.message);
    assert_eq!(summary.metrics.succeeded, 99);
    Ok(())
}

#[tokio::test]
async fn diagnosis_is_kept_across_retries_of_a_cycle() -> Result<()> {
    let template =
        OpTemplate::new("put", "PUT ?").with_field(FieldSpec::required("key", ValueKind::Integer));
    let timeouts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&timeouts);
    let bindings: BindingFn = Arc::new(|cycle: Cycle| {
        Ok(Bindings::from([("key".to_string(), json!(cycle.to_string()))]))
    });
    let def = ActivityDef::from_templates(
        "kv",
        "cycles=42..42".parse()?,
        KvAdapter::default(),
        vec![(template, bindings)],
    )?;
    // Corrected bindings still bind, but the write itself keeps timing out.
    struct TimingOut {
        inner: Arc<dyn OpDispenser>,
        timeouts: Arc<AtomicU32>,
    }
    impl OpDispenser for TimingOut {
        fn create(&self, cycle: Cycle) -> Result<Operation, OpError> {
            self.inner.create(cycle)
        }
        fn diagnose(&self, cycle: Cycle) -> Result<Bindings, OpError> {
            self.inner.diagnose(cycle)
        }
        fn rebind(&self, cycle: Cycle, bindings: &Bindings) -> Result<Operation, OpError> {
            self.inner.rebind(cycle, bindings)?;
            let timeouts = Arc::clone(&self.timeouts);
            Ok(Operation::sync_value(move |_| {
                timeouts.fetch_add(1, Ordering::SeqCst);
                Err(OpError::timeout("write timed out"))
            }))
        }
    }
    let counted = Arc::new(Counted::new(Arc::new(TimingOut {
        inner: def.dispenser,
        timeouts: seen,
    })));
    let (summary, recorder) =
        run_to_completion("cycles=42..42;maxtries=5;errors=count", counted.clone()).await?;

    assert_eq!(counted.diagnosed().get(&42), Some(&1));
    assert_eq!(counted.created().get(&42), Some(&1));
    assert_eq!(counted.rebound().get(&42), Some(&4));
    assert_eq!(timeouts.load(Ordering::SeqCst), 4);
    assert_eq!(
        recorder.outcome_of(42),
        Some(CycleOutcome::failed(ErrorKind::TriesExhausted, 5))
    );
    assert_eq!(summary.state, ActivityState::Finished);
    Ok(())
}

#[tokio::test]
async fn fatal_error_halts_in_stop_mode_and_is_counted_otherwise() -> Result<()> {
    let failing = |cycle: Cycle| -> Result<Operation, OpError> {
        if cycle == 10 {
            return Ok(Operation::sync_value(|_| Err(OpError::fatal("constraint violated"))));
        }
        noop(cycle)
    };

    let (halted, _) = run_to_completion("cycles=1000;errors=stop", Arc::new(failing)).await?;
    assert_eq!(halted.state, ActivityState::Halted);
    assert!(halted.metrics.completed() < 1000);
    let fatal = halted.first_fatal.expect("halting failure is recorded");
    assert_eq!((fatal.cycle, fatal.kind), (10, ErrorKind::Fatal));

    let (counted, _) = run_to_completion("cycles=1000;errors=count", Arc::new(failing)).await?;
    assert_eq!(counted.state, ActivityState::Finished);
    assert_eq!(counted.metrics.completed(), 1000);
    assert_eq!(counted.metrics.failed, 1);
    Ok(())
}

#[tokio::test]
async fn self_chaining_pages_within_limit_and_fails_beyond_it() -> Result<()> {
    fn pages(remaining: u32) -> Operation {
        Operation::self_chaining(move |_| {
            if remaining == 0 {
                Ok(ChainStep::done(json!("done")))
            } else {
                Ok(ChainStep::then(json!(remaining), pages(remaining - 1)))
            }
        })
    }
    let dispenser = |cycle: Cycle| -> Result<Operation, OpError> { Ok(pages((cycle % 5) as u32)) };
    let (summary, recorder) =
        run_to_completion(
            "cycles=20;chain_limit=3;errors=count;retryable_errors=none",
            Arc::new(dispenser),
        )
        .await?;

    // Cycles ending in 4 or 9 need four follow-ups.
    assert_eq!(summary.metrics.failed, 4);
    assert_eq!(
        recorder.outcome_of(4),
        Some(CycleOutcome::failed(ErrorKind::UnexpectedPaging, 1))
    );
    assert_eq!(recorder.outcome_of(3), Some(CycleOutcome::succeeded(1)));
    Ok(())
}
