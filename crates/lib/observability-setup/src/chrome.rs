use std::sync::{Mutex, OnceLock, PoisonError};

use tracing_chrome::FlushGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::common::{ObservabilityOptions, env_filter};

static TRACE_GUARD: OnceLock<Mutex<Option<FlushGuard>>> = OnceLock::new();

fn store_trace_guard(guard: FlushGuard) {
    let cell = TRACE_GUARD.get_or_init(|| Mutex::new(None));
    let mut slot = cell.lock().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(guard);
}

/// Flush and close the chrome trace file, if one is open.
pub fn flush() {
    if let Some(cell) = TRACE_GUARD.get() {
        let mut slot = cell.lock().unwrap_or_else(PoisonError::into_inner);
        slot.take();
    }
}

/// Install the fmt subscriber plus an optional chrome trace layer.
pub fn init(options: ObservabilityOptions) {
    let (chrome_layer, trace_guard) = match options.trace_path.clone() {
        Some(path) => {
            let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path.clone())
                .include_args(true)
                .build();
            eprintln!("tracing-chrome enabled (trace at {path})");
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(!options.no_color);
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter(&options))
        .with(fmt_layer)
        .with(chrome_layer)
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }

    if let Some(guard) = trace_guard {
        store_trace_guard(guard);
    }
}
