use tracing_subscriber::EnvFilter;

/// Default filter used when neither the caller nor `RUST_LOG` provides one.
pub const DEFAULT_LOG_FILTER: &str = "cyclerun=info";

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Filter directives, e.g. `cyclerun=debug`. `RUST_LOG` wins when set.
    pub log_filter: Option<String>,
    /// Write a chrome trace to this path (requires the `trace` feature).
    pub trace_path: Option<String>,
    /// Disable ANSI colors (log files, CI).
    pub no_color: bool,
}

pub(crate) fn env_filter(options: &ObservabilityOptions) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = options.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    })
}
