//! Runs one synthetic activity and prints its summary as JSON.
//!
//! Activity parameters are passed as `key=value` arguments, e.g.
//!
//!   cyclerun --workload sleep cycles=0..9999 concurrency=8 async=16 rate=500
//!
//! Ctrl-C stops the activity, giving in-flight operations the drain window.

mod synthetic;


use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use cyclerun::{
    ActivityController, ActivityDef, ActivityParams, ActivitySummary, EngineConfig, set_config,
};
use cyclerun_observability_setup::ObservabilityOptions;

use synthetic::{SyntheticAdapter, Workload, WorkloadShape};

#[derive(Parser, Debug)]
#[command(name = "cyclerun", about = "Run a cycle-driven synthetic activity")]
struct Args {
    /// Activity parameters as `key=value` pairs
    #[arg(value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Activity name used in logs and the summary
    #[arg(long, default_value = "synthetic")]
    name: String,

    /// Operation mix to run
    #[arg(long, value_enum, default_value = "noop")]
    workload: Workload,

    /// Base delay of sleeping operations, in milliseconds
    #[arg(long, default_value = "5")]
    delay_ms: u64,

    /// Extra per-cycle delay drawn from 0..=jitter
    #[arg(long, default_value = "0")]
    jitter_ms: u64,

    /// Fraction of flaky attempts that time out
    #[arg(long, default_value = "0.1")]
    fail_ratio: f64,

    /// Drain window after Ctrl-C; defaults to the activity setting
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Progress report interval in seconds (0 disables it)
    #[arg(long)]
    progress_secs: Option<u64>,

    /// Log filter directives; RUST_LOG wins when set
    #[arg(long)]
    log: Option<String>,

    /// Write a chrome trace here (needs the `trace` feature)
    #[arg(long)]
    trace: Option<String>,

    #[arg(long, default_value = "false")]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut engine = EngineConfig::from_env().context("invalid engine environment")?;
    if let Some(secs) = args.progress_secs {
        engine.progress_interval = (secs > 0).then(|| std::time::Duration::from_secs(secs));
    }

    cyclerun_observability_setup::init(ObservabilityOptions {
        log_filter: args.log.clone().or_else(|| Some(engine.log_filter.clone())),
        trace_path: args.trace.clone(),
        no_color: args.no_color,
    });
    set_config(engine.clone());

    let summary = run(&args, engine).await;
    cyclerun_observability_setup::flush();
    let summary = summary?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.is_success() {
        bail!(
            "activity `{}` ended {} with {} failed cycles",
            summary.name,
            summary.state,
            summary.failures
        );
    }
    Ok(())
}

async fn run(args: &Args, engine: EngineConfig) -> Result<ActivitySummary> {
    let params: ActivityParams = args
        .params
        .join(";")
        .parse()
        .context("invalid activity parameters")?;
    let shape = WorkloadShape {
        delay_ms: args.delay_ms,
        jitter_ms: args.jitter_ms,
        fail_ratio: args.fail_ratio,
    };
    let def = ActivityDef::from_templates(
        &args.name,
        params,
        SyntheticAdapter::new(shape),
        synthetic::templates(args.workload, shape),
    )?;

    let (handle, server) = ActivityController::with_engine(engine).spawn();
    handle.register(def).await?;
    handle.start(args.name.as_str()).await?;
    info!(activity = %args.name, workload = ?args.workload, "activity started");

    let waiter = {
        let handle = handle.clone();
        let name = args.name.clone();
        tokio::spawn(async move { handle.await_activity(name).await })
    };
    let waiter_abort = waiter.abort_handle();

    let summary = tokio::select! {
        joined = waiter => joined.context("activity waiter panicked")??,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            warn!(activity = %args.name, "interrupted, stopping activity");
            waiter_abort.abort();
            handle.stop(args.name.as_str(), args.drain_timeout_ms).await?
        }
    };

    drop(handle);
    server.await.context("controller task panicked")?;
    Ok(summary)
}
