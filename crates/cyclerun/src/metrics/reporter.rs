//! Background progress logging for a running activity.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ActivityMetrics;
use crate::cycles::CycleSequence;

/// Spawn a task that logs throughput, latency and error counts every
/// `interval` until `shutdown` is cancelled.
pub fn spawn_progress_reporter(
    activity: String,
    metrics: Arc<ActivityMetrics>,
    cycles: Arc<CycleSequence>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            activity = %activity,
            interval_ms = interval.as_millis() as u64,
            "progress reporter started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = metrics.snapshot();
                    let errors: u64 = stats.errors.values().sum();
                    info!(
                        activity = %activity,
                        position = cycles.position(),
                        remaining = ?cycles.remaining(),
                        started = stats.started,
                        completed = stats.completed(),
                        failed = stats.failed,
                        errors,
                        ops_per_sec = format_args!("{:.1}", stats.throughput_per_sec),
                        median_ms = ?stats.median_latency_ms,
                        p99_ms = ?stats.p99_latency_ms,
                        "activity progress"
                    );
                }
                _ = shutdown.cancelled() => {
                    info!(activity = %activity, "progress reporter shutting down");
                    break;
                }
            }
        }
    })
}
