//! Activity parameters: raw `key=value` pairs and their validated form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cycles::CycleRange;
use crate::errors::TransientKind;
use crate::ops::SequencerKind;
use crate::ratelimit::RateSpec;
use crate::retry::{BackoffConfig, RetryPolicy};

pub const DEFAULT_CHAIN_LIMIT: u32 = 100;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(5000);

pub const KNOWN_KEYS: &[&str] = &[
    "async",
    "chain_limit",
    "concurrency",
    "cycles",
    "drain_timeout_ms",
    "errors",
    "maxtries",
    "op_timeout_ms",
    "rate",
    "retry_backoff",
    "retryable_errors",
    "seq",
    "stride",
    "stride_rate",
];

/// Keys fixed for the lifetime of a running activity.
pub const IMMUTABLE_KEYS: &[&str] = &["cycles", "seq"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("malformed parameter `{0}` (expected key=value)")]
    Malformed(String),
    #[error("unknown parameter `{0}`")]
    Unknown(String),
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("parameter `{0}` cannot be changed while the activity is running")]
    Immutable(String),
}

fn split_pair(raw: &str) -> Result<(String, String), ParamError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ParamError::Malformed(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ParamError::Malformed(raw.to_string()));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Raw parameter set, ordered by key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityParams(BTreeMap<String, String>);

impl ActivityParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from `key=value` items, such as command-line arguments.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::new();
        for pair in pairs {
            let (key, value) = split_pair(pair.as_ref())?;
            params.0.insert(key, value);
        }
        Ok(params)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Returns a new parameter set with `delta` applied.
    pub fn merged(&self, delta: &ParamDelta) -> Self {
        let mut merged = self.0.clone();
        for (key, value) in &delta.0 {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Self(merged)
    }
}

impl FromStr for ActivityParams {
    type Err = ParamError;

    /// `key=value;key=value`. Empty segments are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_pairs(s.split(';').map(str::trim).filter(|part| !part.is_empty()))
    }
}

impl fmt::Display for ActivityParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Runtime change to an activity's parameters. `None` resets a key to
/// its default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDelta(BTreeMap<String, Option<String>>);

impl ParamDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), Some(value.to_string()));
        self
    }

    pub fn reset(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn touches(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Rejects unknown keys and changes to keys that are fixed at start.
    pub fn validate_against(&self, current: &ActivityParams) -> Result<(), ParamError> {
        for (key, value) in &self.0 {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(ParamError::Unknown(key.clone()));
            }
            if IMMUTABLE_KEYS.contains(&key.as_str()) && value.as_deref() != current.get(key) {
                return Err(ParamError::Immutable(key.clone()));
            }
        }
        Ok(())
    }
}

impl FromStr for ParamDelta {
    type Err = ParamError;

    /// `key=value;key=` where an empty value resets the key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut delta = Self::new();
        for part in s.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            let (key, value) = split_pair(part)?;
            delta
                .0
                .insert(key, if value.is_empty() { None } else { Some(value) });
        }
        Ok(delta)
    }
}

/// What one fatal cycle outcome does to the activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Halt every motor at its next cycle boundary.
    #[default]
    Stop,
    /// Record and continue.
    Count,
}

impl FromStr for ErrorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(ErrorMode::Stop),
            "count" => Ok(ErrorMode::Count),
            other => Err(format!("unknown error mode `{other}` (expected stop or count)")),
        }
    }
}

/// Defaults for settings whose fallback comes from engine configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettingDefaults {
    pub concurrency: usize,
    pub drain_timeout: Duration,
}

impl Default for SettingDefaults {
    fn default() -> Self {
        Self {
            concurrency: 1,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Validated, typed activity parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivitySettings {
    pub concurrency: usize,
    pub cycles: CycleRange,
    pub rate: RateSpec,
    pub stride_rate: RateSpec,
    pub stride: u64,
    pub async_limit: usize,
    pub max_tries: u32,
    pub retryable: BTreeSet<TransientKind>,
    pub retry_backoff: BackoffConfig,
    pub op_timeout: Option<Duration>,
    pub chain_limit: u32,
    pub error_mode: ErrorMode,
    pub drain_timeout: Duration,
    pub sequencer: SequencerKind,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        let defaults = SettingDefaults::default();
        Self {
            concurrency: defaults.concurrency,
            cycles: CycleRange::default(),
            rate: RateSpec::unlimited(),
            stride_rate: RateSpec::unlimited(),
            stride: 1,
            async_limit: 1,
            max_tries: policy.max_tries,
            retryable: policy.retryable,
            retry_backoff: policy.backoff,
            op_timeout: None,
            chain_limit: DEFAULT_CHAIN_LIMIT,
            error_mode: ErrorMode::Stop,
            drain_timeout: defaults.drain_timeout,
            sequencer: SequencerKind::Bucket,
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ParamError {
    ParamError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn positive<T>(key: &str, value: &str) -> Result<T, ParamError>
where
    T: FromStr + PartialOrd + Default,
{
    let parsed: T = value
        .parse()
        .map_err(|_| invalid(key, value, "expected a positive integer"))?;
    if parsed <= T::default() {
        return Err(invalid(key, value, "must be at least 1"));
    }
    Ok(parsed)
}

fn millis(key: &str, value: &str) -> Result<u64, ParamError> {
    value
        .parse()
        .map_err(|_| invalid(key, value, "expected milliseconds"))
}

fn parse_retryable(value: &str) -> Result<BTreeSet<TransientKind>, ParamError> {
    if value.trim().eq_ignore_ascii_case("none") || value.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    if value.trim().eq_ignore_ascii_case("all") {
        return Ok(TransientKind::ALL.into_iter().collect());
    }
    value
        .split(',')
        .map(|kind| kind.parse::<TransientKind>())
        .collect::<Result<_, _>>()
        .map_err(|error| invalid("retryable_errors", value, error))
}

impl ActivitySettings {
    pub fn from_params(params: &ActivityParams) -> Result<Self, ParamError> {
        Self::from_params_with(params, SettingDefaults::default())
    }

    pub fn from_params_with(
        params: &ActivityParams,
        defaults: SettingDefaults,
    ) -> Result<Self, ParamError> {
        let mut settings = Self {
            concurrency: defaults.concurrency.max(1),
            drain_timeout: defaults.drain_timeout,
            ..Self::default()
        };
        for (key, value) in params.iter() {
            match key {
                "concurrency" => settings.concurrency = positive(key, value)?,
                "cycles" => {
                    settings.cycles = value.parse().map_err(|error| invalid(key, value, error))?;
                }
                "rate" => settings.rate = value.parse().map_err(|error| invalid(key, value, error))?,
                "stride_rate" => {
                    settings.stride_rate =
                        value.parse().map_err(|error| invalid(key, value, error))?;
                }
                "stride" => settings.stride = positive(key, value)?,
                "async" => settings.async_limit = positive(key, value)?,
                "maxtries" => settings.max_tries = positive(key, value)?,
                "retryable_errors" => settings.retryable = parse_retryable(value)?,
                "retry_backoff" => {
                    settings.retry_backoff =
                        value.parse().map_err(|error| invalid(key, value, error))?;
                }
                "op_timeout_ms" => {
                    settings.op_timeout = match millis(key, value)? {
                        0 => None,
                        ms => Some(Duration::from_millis(ms)),
                    };
                }
                "chain_limit" => {
                    settings.chain_limit = value
                        .parse()
                        .map_err(|_| invalid(key, value, "expected a non-negative integer"))?;
                }
                "errors" => {
                    settings.error_mode = value.parse().map_err(|error| invalid(key, value, error))?;
                }
                "drain_timeout_ms" => {
                    settings.drain_timeout = Duration::from_millis(millis(key, value)?);
                }
                "seq" => settings.sequencer = value.parse().map_err(|error| invalid(key, value, error))?,
                unknown => return Err(ParamError::Unknown(unknown.to_string())),
            }
        }
        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_tries, self.retryable.iter().copied())
            .with_backoff(self.retry_backoff)
    }
}
