use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::common::{ObservabilityOptions, env_filter};

/// Install the fmt subscriber. Safe to call more than once; later calls are ignored.
pub fn init(options: ObservabilityOptions) {
    if options.trace_path.is_some() {
        eprintln!("chrome tracing disabled. Rebuild with --features trace to enable it.");
    }
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(!options.no_color);
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter(&options))
        .with(fmt_layer)
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }
}

pub fn flush() {}
