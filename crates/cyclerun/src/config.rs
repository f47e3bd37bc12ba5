//! Activity configuration versions and engine-wide settings.
//!
//! Engine settings come from environment variables (a `.env` file is loaded
//! first when present):
//! - `CYCLERUN_LOG`: default tracing filter when `RUST_LOG` is unset (default: cyclerun=info)
//! - `CYCLERUN_METRICS_BUFFER`: events buffered per activity before dropping (default: 4096)
//! - `CYCLERUN_PROGRESS_INTERVAL_MS`: progress log interval, 0 disables (default: 10000)
//! - `CYCLERUN_DRAIN_TIMEOUT_MS`: default drain window on stop (default: 5000)
//! - `CYCLERUN_DEFAULT_CONCURRENCY`: motors per activity when `concurrency` is unset (default: 1)

use std::{
    env,
    str::FromStr,
    sync::{Arc, Mutex, OnceLock, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::warn;

use crate::params::{ActivityParams, ActivitySettings, ParamDelta, ParamError, SettingDefaults};

pub const DEFAULT_LOG_FILTER: &str = "cyclerun=info";
pub const DEFAULT_METRICS_BUFFER: usize = 4096;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Global configuration cache
static CONFIG: OnceLock<RwLock<EngineConfig>> = OnceLock::new();

/// Process-wide engine settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Tracing filter used when `RUST_LOG` is unset
    pub log_filter: String,

    /// Capacity of each activity's metrics buffer
    pub metrics_buffer: usize,

    /// Progress log interval; `None` disables the reporter
    pub progress_interval: Option<Duration>,

    /// Drain window applied when a stop request does not name one
    pub drain_timeout: Duration,

    /// Motors per activity when the `concurrency` parameter is absent
    pub default_concurrency: usize,

    /// Available CPUs, reported for sizing decisions
    pub available_cpus: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            metrics_buffer: DEFAULT_METRICS_BUFFER,
            progress_interval: Some(Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS)),
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
            default_concurrency: 1,
            available_cpus: num_cpus::get(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name} value `{raw}`")),
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let log_filter = lookup("CYCLERUN_LOG")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.log_filter);

        let metrics_buffer: usize =
            parse_var(&lookup, "CYCLERUN_METRICS_BUFFER", defaults.metrics_buffer)?;
        if metrics_buffer == 0 {
            anyhow::bail!("CYCLERUN_METRICS_BUFFER must be at least 1");
        }

        let progress_interval_ms: u64 = parse_var(
            &lookup,
            "CYCLERUN_PROGRESS_INTERVAL_MS",
            DEFAULT_PROGRESS_INTERVAL_MS,
        )?;

        let drain_timeout_ms: u64 =
            parse_var(&lookup, "CYCLERUN_DRAIN_TIMEOUT_MS", DEFAULT_DRAIN_TIMEOUT_MS)?;

        let default_concurrency: usize = parse_var(
            &lookup,
            "CYCLERUN_DEFAULT_CONCURRENCY",
            defaults.default_concurrency,
        )?;
        if default_concurrency == 0 {
            anyhow::bail!("CYCLERUN_DEFAULT_CONCURRENCY must be at least 1");
        }

        Ok(Self {
            log_filter,
            metrics_buffer,
            progress_interval: (progress_interval_ms > 0)
                .then(|| Duration::from_millis(progress_interval_ms)),
            drain_timeout: Duration::from_millis(drain_timeout_ms),
            default_concurrency,
            available_cpus: defaults.available_cpus,
        })
    }

    pub fn setting_defaults(&self) -> SettingDefaults {
        SettingDefaults {
            concurrency: self.default_concurrency,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// Get the global configuration, loading from environment if not yet initialized.
///
/// Invalid environment values are logged and replaced by defaults; use
/// [`try_get_config`] to surface them instead.
pub fn get_config() -> EngineConfig {
    CONFIG
        .get_or_init(|| {
            let config = EngineConfig::from_env().unwrap_or_else(|err| {
                warn!(error = %format!("{err:#}"), "invalid engine configuration, using defaults");
                EngineConfig::default()
            });
            RwLock::new(config)
        })
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Get the global configuration, returning an error if loading fails.
pub fn try_get_config() -> Result<EngineConfig> {
    match CONFIG.get() {
        Some(lock) => Ok(lock.read().unwrap_or_else(PoisonError::into_inner).clone()),
        None => {
            let config = EngineConfig::from_env()?;
            let lock = CONFIG.get_or_init(|| RwLock::new(config));
            Ok(lock.read().unwrap_or_else(PoisonError::into_inner).clone())
        }
    }
}

/// Replace the global configuration, e.g. with command-line overrides.
pub fn set_config(config: EngineConfig) {
    let lock = CONFIG.get_or_init(|| RwLock::new(config.clone()));
    *lock.write().unwrap_or_else(PoisonError::into_inner) = config;
}

/// One immutable version of an activity's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub params: ActivityParams,
    pub settings: ActivitySettings,
}

/// Versioned, copy-on-write activity configuration. Motors hold a receiver
/// and pick up new versions only at cycle boundaries.
#[derive(Debug)]
pub struct ActivityConfig {
    sender: watch::Sender<Arc<ConfigSnapshot>>,
    defaults: SettingDefaults,
    apply_lock: Mutex<()>,
}

impl ActivityConfig {
    pub fn new(params: ActivityParams, defaults: SettingDefaults) -> Result<Self, ParamError> {
        let settings = ActivitySettings::from_params_with(&params, defaults)?;
        let (sender, _) = watch::channel(Arc::new(ConfigSnapshot {
            version: 1,
            params,
            settings,
        }));
        Ok(Self {
            sender,
            defaults,
            apply_lock: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.sender.borrow())
    }

    pub fn version(&self) -> u64 {
        self.sender.borrow().version
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.sender.subscribe()
    }

    /// Validates `delta` against the current version and publishes the
    /// result as the next version. On error nothing changes.
    pub fn apply(&self, delta: &ParamDelta) -> Result<Arc<ConfigSnapshot>, ParamError> {
        let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current();
        delta.validate_against(&current.params)?;
        let params = current.params.merged(delta);
        let settings = ActivitySettings::from_params_with(&params, self.defaults)?;
        let next = Arc::new(ConfigSnapshot {
            version: current.version + 1,
            params,
            settings,
        });
        self.sender.send_replace(Arc::clone(&next));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serial_test::serial;

    use super::*;
    use crate::ratelimit::RateSpec;

    fn lookup(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn engine_defaults_apply_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.setting_defaults().concurrency, 1);
    }

    #[test]
    fn engine_reads_overrides_and_rejects_garbage() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("CYCLERUN_LOG", "cyclerun=debug"),
            ("CYCLERUN_METRICS_BUFFER", "128"),
            ("CYCLERUN_PROGRESS_INTERVAL_MS", "0"),
            ("CYCLERUN_DEFAULT_CONCURRENCY", "6"),
        ]))
        .unwrap();
        assert_eq!(config.log_filter, "cyclerun=debug");
        assert_eq!(config.metrics_buffer, 128);
        assert_eq!(config.progress_interval, None);
        assert_eq!(config.default_concurrency, 6);

        let error = EngineConfig::from_lookup(lookup(&[("CYCLERUN_DRAIN_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(format!("{error:#}").contains("CYCLERUN_DRAIN_TIMEOUT_MS"));
        assert!(EngineConfig::from_lookup(lookup(&[("CYCLERUN_METRICS_BUFFER", "0")])).is_err());
    }

    #[test]
    #[serial]
    fn from_env_reads_process_environment() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe {
            env::set_var("CYCLERUN_DRAIN_TIMEOUT_MS", "750");
        }
        let config = EngineConfig::from_env();
        unsafe {
            env::remove_var("CYCLERUN_DRAIN_TIMEOUT_MS");
        }
        assert_eq!(config.unwrap().drain_timeout, Duration::from_millis(750));
    }

    #[test]
    #[serial]
    fn set_config_overrides_cache() {
        let mut config = get_config();
        config.metrics_buffer = 99;
        set_config(config.clone());
        assert_eq!(get_config().metrics_buffer, 99);
        assert_eq!(try_get_config().unwrap(), config);
        set_config(EngineConfig::default());
    }

    #[test]
    fn apply_publishes_next_version() {
        let config = ActivityConfig::new(
            ActivityParams::new().with("rate", "10").with("cycles", "100"),
            SettingDefaults::default(),
        )
        .unwrap();
        let mut receiver = config.subscribe();
        assert_eq!(config.version(), 1);

        let next = config.apply(&ParamDelta::new().set("rate", "20")).unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(next.settings.rate, RateSpec::per_second(20.0));
        assert!(receiver.has_changed().unwrap());
        assert_eq!(receiver.borrow_and_update().version, 2);

        let rejected = config.apply(&ParamDelta::new().set("cycles", "5"));
        assert_eq!(rejected, Err(ParamError::Immutable("cycles".to_string())));
        let invalid = config.apply(&ParamDelta::new().set("maxtries", "zero"));
        assert!(invalid.is_err());
        assert_eq!(config.version(), 2);
        assert!(!receiver.has_changed().unwrap());
    }
}
