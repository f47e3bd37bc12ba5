//! Virtual-time rate limiting for cycle dispatch.
//!
//! A limiter tracks the scheduled time of the next permit as nanoseconds
//! since its origin. `acquire` advances that position with a single
//! compare-and-swap and returns how long the caller should sleep; nothing is
//! locked across the sleep. When callers fall further behind the schedule
//! than the burst ceiling, the position is pulled forward to `now - burst` so
//! the catch-up burst stays bounded.

use std::fmt;
use std::str::FromStr;
use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use cyclerun_observability_macros::obs;

pub const DEFAULT_BURST: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rate `{input}`: {reason}")]
pub struct RateSpecError {
    pub input: String,
    pub reason: &'static str,
}

/// Parsed `rate`/`stride_rate` value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSpec {
    /// `None` means unlimited.
    pub ops_per_sec: Option<f64>,
    pub burst: Duration,
}

impl RateSpec {
    pub fn unlimited() -> Self {
        Self {
            ops_per_sec: None,
            burst: DEFAULT_BURST,
        }
    }

    pub fn per_second(ops_per_sec: f64) -> Self {
        Self {
            ops_per_sec: Some(ops_per_sec),
            burst: DEFAULT_BURST,
        }
    }

    pub fn with_burst(mut self, burst: Duration) -> Self {
        self.burst = burst;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.ops_per_sec.is_none()
    }

    /// Nanoseconds of virtual time one permit costs; zero when unlimited.
    pub fn interval_nanos(&self) -> u64 {
        match self.ops_per_sec {
            Some(rate) if rate > 0.0 => (1e9 / rate).round().max(1.0) as u64,
            _ => 0,
        }
    }
}

impl Default for RateSpec {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ops_per_sec {
            None => f.write_str("unlimited"),
            Some(rate) => write!(f, "{rate},{}", self.burst.as_secs_f64()),
        }
    }
}

impl FromStr for RateSpec {
    type Err = RateSpecError;

    /// `unlimited` | `<ops/sec>` | `<ops/sec>,<burstSeconds>`. A `/s` or
    /// `/sec` suffix on the rate is tolerated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = |reason| RateSpecError {
            input: s.to_string(),
            reason,
        };
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") || trimmed == "0" {
            return Ok(Self::unlimited());
        }
        let (rate, burst) = match trimmed.split_once(',') {
            Some((rate, burst)) => (rate, Some(burst)),
            None => (trimmed, None),
        };
        let rate = rate
            .trim()
            .trim_end_matches("/sec")
            .trim_end_matches("/s")
            .trim();
        let ops_per_sec: f64 = rate.parse().map_err(|_| error("rate is not a number"))?;
        if !ops_per_sec.is_finite() || ops_per_sec < 0.0 {
            return Err(error("rate must be a non-negative number"));
        }
        if ops_per_sec == 0.0 {
            return Ok(Self::unlimited());
        }
        let burst = match burst {
            None => DEFAULT_BURST,
            Some(raw) => {
                let seconds: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| error("burst is not a number of seconds"))?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(error("burst must be a non-negative number of seconds"));
                }
                Duration::from_secs_f64(seconds)
            }
        };
        Ok(Self {
            ops_per_sec: Some(ops_per_sec),
            burst,
        })
    }
}

#[derive(Debug)]
struct LimiterConfig {
    spec: RateSpec,
    interval_nanos: u64,
    burst_nanos: u64,
}

impl From<RateSpec> for LimiterConfig {
    fn from(spec: RateSpec) -> Self {
        Self {
            spec,
            interval_nanos: spec.interval_nanos(),
            burst_nanos: u64::try_from(spec.burst.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

/// Point-in-time view of a limiter.
#[derive(Clone, Debug, Serialize)]
pub struct RateLimiterState {
    pub name: String,
    /// Scheduled virtual time of the next permit, relative to the limiter origin.
    pub position_nanos: u64,
    pub ops_per_sec: Option<f64>,
    pub burst_nanos: u64,
    pub permits_issued: u64,
    pub scheduled_wait_nanos: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    origin: Instant,
    next_free: AtomicU64,
    config: RwLock<Arc<LimiterConfig>>,
    permits_issued: AtomicU64,
    scheduled_wait_nanos: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, spec: RateSpec) -> Self {
        Self {
            name: name.into(),
            origin: Instant::now(),
            next_free: AtomicU64::new(0),
            config: RwLock::new(Arc::new(LimiterConfig::from(spec))),
            permits_issued: AtomicU64::new(0),
            scheduled_wait_nanos: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> Arc<LimiterConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn spec(&self) -> RateSpec {
        self.config().spec
    }

    /// Reserves `permits` and returns how long the caller must wait before
    /// using them.
    #[obs]
    pub fn acquire(&self, permits: u64) -> Duration {
        let config = self.config();
        self.permits_issued.fetch_add(permits, Ordering::Relaxed);
        if config.interval_nanos == 0 {
            return Duration::ZERO;
        }

        let now = self.now_nanos();
        let floor = now.saturating_sub(config.burst_nanos);
        let cost = config.interval_nanos.saturating_mul(permits);
        let mut current = self.next_free.load(Ordering::Acquire);
        let scheduled = loop {
            let scheduled = current.max(floor);
            match self.next_free.compare_exchange_weak(
                current,
                scheduled.saturating_add(cost),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break scheduled,
                Err(actual) => current = actual,
            }
        };

        let wait = scheduled.saturating_sub(now);
        self.scheduled_wait_nanos.fetch_add(wait, Ordering::Relaxed);
        Duration::from_nanos(wait)
    }

    /// Installs a new rate. Permits already granted keep their schedule;
    /// the next acquisition pays the new interval.
    pub fn set_rate(&self, spec: RateSpec) {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(LimiterConfig::from(spec));
    }

    /// Re-syncs the schedule to the current instant, discarding any
    /// accumulated burst credit.
    pub fn reset(&self) {
        self.next_free.store(self.now_nanos(), Ordering::Release);
    }

    pub fn state(&self) -> RateLimiterState {
        let config = self.config();
        RateLimiterState {
            name: self.name.clone(),
            position_nanos: self.next_free.load(Ordering::Acquire),
            ops_per_sec: config.spec.ops_per_sec,
            burst_nanos: config.burst_nanos,
            permits_issued: self.permits_issued.load(Ordering::Relaxed),
            scheduled_wait_nanos: self.scheduled_wait_nanos.load(Ordering::Relaxed),
        }
    }
}

/// The batch (stride) and operation limiters of one activity.
#[derive(Debug)]
pub struct DispatchGate {
    stride: RateLimiter,
    op: RateLimiter,
}

impl DispatchGate {
    pub fn new(stride_rate: RateSpec, op_rate: RateSpec) -> Self {
        Self {
            stride: RateLimiter::new("stride_rate", stride_rate),
            op: RateLimiter::new("rate", op_rate),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(RateSpec::unlimited(), RateSpec::unlimited())
    }

    /// Wait owed for one cycle: an operation permit always, plus a stride
    /// permit when the cycle opens a new segment. The two compose by max.
    pub fn acquire(&self, starts_stride: bool) -> Duration {
        let op_wait = self.op.acquire(1);
        if starts_stride {
            op_wait.max(self.stride.acquire(1))
        } else {
            op_wait
        }
    }

    pub fn stride_limiter(&self) -> &RateLimiter {
        &self.stride
    }

    pub fn op_limiter(&self) -> &RateLimiter {
        &self.op
    }

    pub fn reset(&self) {
        self.stride.reset();
        self.op.reset();
    }

    pub fn states(&self) -> [RateLimiterState; 2] {
        [self.stride.state(), self.op.state()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_specs() {
        assert_eq!("unlimited".parse::<RateSpec>(), Ok(RateSpec::unlimited()));
        assert_eq!("100".parse::<RateSpec>(), Ok(RateSpec::per_second(100.0)));
        assert_eq!(
            "250/s,0.5".parse::<RateSpec>(),
            Ok(RateSpec::per_second(250.0).with_burst(Duration::from_millis(500)))
        );
        assert!("fast".parse::<RateSpec>().is_err());
        assert!("-1".parse::<RateSpec>().is_err());
        assert!("10,x".parse::<RateSpec>().is_err());
        assert_eq!(RateSpec::per_second(4.0).interval_nanos(), 250_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn permits_are_spaced_by_interval() {
        let limiter = RateLimiter::new("rate", RateSpec::per_second(100.0));
        limiter.reset();
        assert_eq!(limiter.acquire(1), Duration::ZERO);
        assert_eq!(limiter.acquire(1), Duration::from_millis(10));
        assert_eq!(limiter.acquire(1), Duration::from_millis(20));
        assert_eq!(limiter.acquire(3), Duration::from_millis(30));
        assert_eq!(limiter.acquire(1), Duration::from_millis(60));
        assert_eq!(limiter.state().permits_issued, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_catch_up_is_capped_at_ceiling() {
        let limiter = RateLimiter::new("rate", RateSpec::per_second(10.0));
        limiter.reset();
        tokio::time::advance(Duration::from_secs(5)).await;

        // One burst ceiling of credit (10 permits) plus the permit due now.
        let immediate = (0..20)
            .map(|_| limiter.acquire(1))
            .take_while(|wait| wait.is_zero())
            .count();
        assert_eq!(immediate, 11);
        assert_eq!(limiter.acquire(1), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_change_applies_to_later_permits_only() {
        let limiter = RateLimiter::new("rate", RateSpec::per_second(10.0));
        limiter.reset();
        assert_eq!(limiter.acquire(1), Duration::ZERO);
        let granted = limiter.acquire(1);
        assert_eq!(granted, Duration::from_millis(100));

        limiter.set_rate(RateSpec::per_second(1000.0));
        assert_eq!(limiter.acquire(1), Duration::from_millis(200));
        assert_eq!(limiter.acquire(1), Duration::from_millis(201));
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::new("rate", RateSpec::unlimited());
        for _ in 0..10_000 {
            assert_eq!(limiter.acquire(1), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_takes_larger_of_both_waits() {
        let gate = DispatchGate::new(RateSpec::per_second(1.0), RateSpec::per_second(100.0));
        gate.reset();
        assert_eq!(gate.acquire(true), Duration::ZERO);
        assert_eq!(gate.acquire(false), Duration::from_millis(10));
        // The second stride permit is owed a full second out.
        assert_eq!(gate.acquire(true), Duration::from_secs(1));
        assert_eq!(gate.acquire(false), Duration::from_millis(30));
    }
}
