//! Failure recovery for a single cycle: diagnose binding errors, retry
//! configured transient kinds with backoff, fail everything else.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::cycles::Cycle;
use crate::errors::{CycleFailure, OpError, TransientKind};

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_TRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BackoffConfig {
    /// No delay between retries (immediate retry)
    #[default]
    None,
    /// Linear backoff: delay = base_delay_ms * retry_number
    Linear { base_delay_ms: u64 },
    /// Exponential backoff: delay = base_delay_ms * multiplier^(retry_number - 1)
    Exponential { base_delay_ms: u64, multiplier: f64 },
}

impl BackoffConfig {
    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffConfig::None => "none",
            BackoffConfig::Linear { .. } => "linear",
            BackoffConfig::Exponential { .. } => "exponential",
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => *base_delay_ms,
            BackoffConfig::Exponential { base_delay_ms, .. } => *base_delay_ms,
        }
    }

    /// Delay before the `retry_number`-th retry (1-based).
    pub fn delay(&self, retry_number: u32) -> Duration {
        if retry_number == 0 {
            return Duration::ZERO;
        }
        let millis = match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => {
                base_delay_ms.saturating_mul(u64::from(retry_number))
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                let factor = multiplier.powi(retry_number.saturating_sub(1) as i32);
                let millis = *base_delay_ms as f64 * factor;
                if millis.is_finite() && millis < u64::MAX as f64 {
                    millis as u64
                } else {
                    u64::MAX
                }
            }
        };
        Duration::from_millis(millis)
    }
}

impl fmt::Display for BackoffConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffConfig::None => f.write_str("none"),
            BackoffConfig::Linear { base_delay_ms } => write!(f, "linear:{base_delay_ms}"),
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => write!(f, "exponential:{base_delay_ms}:{multiplier}"),
        }
    }
}

impl FromStr for BackoffConfig {
    type Err = String;

    /// `none` | `linear:<ms>` | `exponential:<ms>[:<multiplier>]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let kind = parts.next().unwrap_or_default().to_ascii_lowercase();
        let base = parts.next().map(str::trim);
        let multiplier = parts.next().map(str::trim);
        if parts.next().is_some() {
            return Err(format!("invalid backoff `{s}`: too many components"));
        }
        let parse_base = |raw: Option<&str>| -> Result<u64, String> {
            raw.ok_or_else(|| format!("invalid backoff `{s}`: missing base delay in ms"))?
                .parse()
                .map_err(|_| format!("invalid backoff `{s}`: base delay is not an integer"))
        };
        match kind.as_str() {
            "none" if base.is_none() => Ok(BackoffConfig::None),
            "linear" if multiplier.is_none() => Ok(BackoffConfig::Linear {
                base_delay_ms: parse_base(base)?,
            }),
            "exponential" => {
                let multiplier = match multiplier {
                    None => DEFAULT_EXPONENTIAL_MULTIPLIER,
                    Some(raw) => raw
                        .parse::<f64>()
                        .ok()
                        .filter(|value| value.is_finite() && *value > 0.0)
                        .ok_or_else(|| {
                            format!("invalid backoff `{s}`: multiplier must be a positive number")
                        })?,
                };
                Ok(BackoffConfig::Exponential {
                    base_delay_ms: parse_base(base)?,
                    multiplier,
                })
            }
            _ => Err(format!(
                "invalid backoff `{s}` (expected none, linear:<ms> or exponential:<ms>[:<multiplier>])"
            )),
        }
    }
}

/// What the motor should do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Run the diagnostic path for this cycle; carries the fast-path error.
    Diagnose(OpError),
    /// Attempt again as try `next_try` after `delay`.
    Retry { next_try: u32, delay: Duration },
    Fail(CycleFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub retryable: BTreeSet<TransientKind>,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            retryable: BTreeSet::from([TransientKind::Timeout]),
            backoff: BackoffConfig::None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_tries: u32, retryable: impl IntoIterator<Item = TransientKind>) -> Self {
        Self {
            max_tries: max_tries.max(1),
            retryable: retryable.into_iter().collect(),
            backoff: BackoffConfig::None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_retryable(&self, kind: TransientKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Classifies the failure of try number `tries` (1-based) of `cycle`.
    /// `diagnosed` is true once the cycle has been through the diagnostic path.
    pub fn decide(
        &self,
        cycle: Cycle,
        tries: u32,
        error: OpError,
        diagnosed: bool,
    ) -> RecoveryAction {
        if matches!(error, OpError::Binding(_)) && !diagnosed {
            return RecoveryAction::Diagnose(error);
        }
        let retryable = error
            .transient_kind()
            .is_some_and(|kind| self.is_retryable(kind));
        if !retryable {
            return RecoveryAction::Fail(CycleFailure::Failed {
                cycle,
                tries,
                error,
            });
        }
        if tries < self.max_tries {
            RecoveryAction::Retry {
                next_try: tries + 1,
                delay: self.backoff.delay(tries),
            }
        } else {
            RecoveryAction::Fail(CycleFailure::TriesExhausted {
                cycle,
                tries,
                last: error,
            })
        }
    }
}
