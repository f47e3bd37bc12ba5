//! Error taxonomy for operation construction, execution and cycle outcomes.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cycles::Cycle;

/// Transient execution failures. Each kind is retried only when listed in
/// `retryable_errors`; enabling one never enables another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    /// A conditional write was not applied by the server.
    Unapplied,
    /// A chained operation produced more follow-ups than allowed.
    UnexpectedPaging,
}

impl TransientKind {
    pub const ALL: [TransientKind; 3] = [
        TransientKind::Timeout,
        TransientKind::Unapplied,
        TransientKind::UnexpectedPaging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Timeout => "timeout",
            TransientKind::Unapplied => "unapplied",
            TransientKind::UnexpectedPaging => "unexpected_paging",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error kind `{0}` (expected timeout, unapplied or unexpected_paging)")]
pub struct UnknownErrorKind(pub String);

impl FromStr for TransientKind {
    type Err = UnknownErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timeout" => Ok(TransientKind::Timeout),
            "unapplied" => Ok(TransientKind::Unapplied),
            "unexpected_paging" | "paging" => Ok(TransientKind::UnexpectedPaging),
            other => Err(UnknownErrorKind(other.to_string())),
        }
    }
}

/// Classification attached to every error and failed outcome reported to sinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Binding,
    Timeout,
    Unapplied,
    UnexpectedPaging,
    Fatal,
    TriesExhausted,
    /// Still in flight when the drain window closed.
    Abandoned,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Configuration,
        ErrorKind::Binding,
        ErrorKind::Timeout,
        ErrorKind::Unapplied,
        ErrorKind::UnexpectedPaging,
        ErrorKind::Fatal,
        ErrorKind::TriesExhausted,
        ErrorKind::Abandoned,
    ];

    pub fn index(self) -> usize {
        match self {
            ErrorKind::Configuration => 0,
            ErrorKind::Binding => 1,
            ErrorKind::Timeout => 2,
            ErrorKind::Unapplied => 3,
            ErrorKind::UnexpectedPaging => 4,
            ErrorKind::Fatal => 5,
            ErrorKind::TriesExhausted => 6,
            ErrorKind::Abandoned => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Binding => "binding",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unapplied => "unapplied",
            ErrorKind::UnexpectedPaging => "unexpected_paging",
            ErrorKind::Fatal => "fatal",
            ErrorKind::TriesExhausted => "tries_exhausted",
            ErrorKind::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TransientKind> for ErrorKind {
    fn from(kind: TransientKind) -> Self {
        match kind {
            TransientKind::Timeout => ErrorKind::Timeout,
            TransientKind::Unapplied => ErrorKind::Unapplied,
            TransientKind::UnexpectedPaging => ErrorKind::UnexpectedPaging,
        }
    }
}

/// Shape of a bound value, as declared by op templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Object,
    Any,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(number) if number.is_f64() => ValueKind::Float,
            Value::Number(_) => ValueKind::Integer,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Whether `value` can be bound to a field of this kind without conversion.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, ValueKind::of(value)) {
            (ValueKind::Any, _) => true,
            (ValueKind::Float, ValueKind::Integer) => true,
            (expected, actual) => *expected == actual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Any => "any",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-cycle value could not be adapted to the shape an operation requires.
///
/// The fast path usually raises [`BindingError::Unqualified`]; the diagnostic
/// path replaces it with one of the field-level variants.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BindingError {
    #[error("binding failed: {message}")]
    Unqualified { message: String },
    #[error("template `{template}`: field `{field}` is missing (expected {expected})")]
    MissingField {
        template: String,
        field: String,
        expected: ValueKind,
    },
    #[error(
        "template `{template}`: field `{field}` has {actual} value {value}, expected {expected}"
    )]
    TypeMismatch {
        template: String,
        field: String,
        value: Value,
        expected: ValueKind,
        actual: ValueKind,
    },
    #[error("template `{template}`: field `{field}` is not declared")]
    UndeclaredField { template: String, field: String },
    #[error("template `{template}` rejected validated bindings {bindings}: {message}")]
    Rejected {
        template: String,
        bindings: Value,
        message: String,
    },
}

impl BindingError {
    pub fn unqualified(message: impl Into<String>) -> Self {
        BindingError::Unqualified {
            message: message.into(),
        }
    }

    /// The field this error is about, when the diagnostic path identified one.
    pub fn field(&self) -> Option<&str> {
        match self {
            BindingError::MissingField { field, .. }
            | BindingError::TypeMismatch { field, .. }
            | BindingError::UndeclaredField { field, .. } => Some(field),
            BindingError::Unqualified { .. } | BindingError::Rejected { .. } => None,
        }
    }

    pub fn is_explained(&self) -> bool {
        !matches!(self, BindingError::Unqualified { .. })
    }
}

/// Failure raised while constructing or executing one operation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum OpError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("{kind}: {message}")]
    Transient { kind: TransientKind, message: String },
    #[error("fatal execution error: {0}")]
    Fatal(String),
}

impl OpError {
    pub fn configuration(message: impl Into<String>) -> Self {
        OpError::Configuration(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        OpError::Fatal(message.into())
    }

    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        OpError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Timeout, message)
    }

    pub fn unapplied(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Unapplied, message)
    }

    pub fn unexpected_paging(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::UnexpectedPaging, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Configuration(_) => ErrorKind::Configuration,
            OpError::Binding(_) => ErrorKind::Binding,
            OpError::Transient { kind, .. } => ErrorKind::from(*kind),
            OpError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            OpError::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Terminal failure of one cycle.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CycleFailure {
    #[error("cycle {cycle} failed ({}) after {tries} tries: {error}", .error.kind())]
    Failed {
        cycle: Cycle,
        tries: u32,
        error: OpError,
    },
    #[error("cycle {cycle} exhausted {tries} tries ({}): {last}", .last.kind())]
    TriesExhausted {
        cycle: Cycle,
        tries: u32,
        last: OpError,
    },
    #[error("cycle {cycle} abandoned after {tries} tries: still in flight when the drain window closed")]
    Abandoned { cycle: Cycle, tries: u32 },
}

impl CycleFailure {
    pub fn cycle(&self) -> Cycle {
        match self {
            CycleFailure::Failed { cycle, .. }
            | CycleFailure::TriesExhausted { cycle, .. }
            | CycleFailure::Abandoned { cycle, .. } => *cycle,
        }
    }

    pub fn tries(&self) -> u32 {
        match self {
            CycleFailure::Failed { tries, .. }
            | CycleFailure::TriesExhausted { tries, .. }
            | CycleFailure::Abandoned { tries, .. } => *tries,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CycleFailure::Failed { error, .. } => error.kind(),
            CycleFailure::TriesExhausted { .. } => ErrorKind::TriesExhausted,
            CycleFailure::Abandoned { .. } => ErrorKind::Abandoned,
        }
    }

    /// Whether this outcome counts against the activity's error mode.
    /// Abandonment happens only while stopping and never halts anything.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CycleFailure::Abandoned { .. })
    }
}

/// Serializable record of a failed cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub cycle: Cycle,
    pub kind: ErrorKind,
    pub tries: u32,
    pub message: String,
}

impl From<&CycleFailure> for FailureRecord {
    fn from(failure: &CycleFailure) -> Self {
        Self {
            cycle: failure.cycle(),
            kind: failure.kind(),
            tries: failure.tries(),
            message: failure.to_string(),
        }
    }
}

const DEFAULT_FAILURE_LOG_CAPACITY: usize = 256;

/// Activity-wide error aggregate: the first fatal failure plus a bounded
/// window of the most recent ones.
#[derive(Debug)]
pub struct FailureLog {
    capacity: usize,
    total: AtomicU64,
    inner: Mutex<FailureLogInner>,
}

#[derive(Debug, Default)]
struct FailureLogInner {
    first_fatal: Option<FailureRecord>,
    recent: VecDeque<FailureRecord>,
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FAILURE_LOG_CAPACITY)
    }
}

impl FailureLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
            inner: Mutex::new(FailureLogInner::default()),
        }
    }

    pub fn record(&self, failure: &CycleFailure) -> FailureRecord {
        let record = FailureRecord::from(failure);
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_fatal() && inner.first_fatal.is_none() {
            inner.first_fatal = Some(record.clone());
        }
        if inner.recent.len() >= self.capacity {
            inner.recent.pop_front();
        }
        inner.recent.push_back(record.clone());
        record
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn first_fatal(&self) -> Option<FailureRecord> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first_fatal
            .clone()
    }

    pub fn recent(&self) -> Vec<FailureRecord> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transient_kinds_parse_and_stay_distinct() {
        assert_eq!("timeout".parse::<TransientKind>(), Ok(TransientKind::Timeout));
        assert_eq!(
            " Unapplied ".parse::<TransientKind>(),
            Ok(TransientKind::Unapplied)
        );
        assert_eq!(
            "paging".parse::<TransientKind>(),
            Ok(TransientKind::UnexpectedPaging)
        );
        assert!("deadlock".parse::<TransientKind>().is_err());
        assert_ne!(
            OpError::timeout("slow").kind(),
            OpError::unapplied("cas").kind()
        );
    }

    #[test]
    fn value_kind_accepts_integers_as_floats() {
        assert!(ValueKind::Float.accepts(&json!(3)));
        assert!(ValueKind::Float.accepts(&json!(3.5)));
        assert!(!ValueKind::Integer.accepts(&json!(3.5)));
        assert!(!ValueKind::Integer.accepts(&json!("3")));
        assert!(ValueKind::Any.accepts(&json!({"a": 1})));
    }

    #[test]
    fn failures_carry_cycle_kind_and_detail() {
        let failure = CycleFailure::Failed {
            cycle: 42,
            tries: 1,
            error: OpError::Binding(BindingError::TypeMismatch {
                template: "insert".to_string(),
                field: "user_id".to_string(),
                value: json!("abc"),
                expected: ValueKind::Integer,
                actual: ValueKind::String,
            }),
        };
        let message = failure.to_string();
        assert!(message.contains("cycle 42"));
        assert!(message.contains("binding"));
        assert!(message.contains("user_id"));
        assert!(message.contains("integer"));
        assert_eq!(failure.kind(), ErrorKind::Binding);

        let exhausted = CycleFailure::TriesExhausted {
            cycle: 7,
            tries: 3,
            last: OpError::timeout("no response"),
        };
        assert_eq!(exhausted.kind(), ErrorKind::TriesExhausted);
        assert!(exhausted.to_string().contains("3 tries"));
    }

    #[test]
    fn failure_log_keeps_first_fatal_and_bounded_window() {
        let log = FailureLog::with_capacity(2);
        log.record(&CycleFailure::Abandoned { cycle: 1, tries: 1 });
        for cycle in 2..6 {
            log.record(&CycleFailure::Failed {
                cycle,
                tries: 1,
                error: OpError::fatal("boom"),
            });
        }
        assert_eq!(log.total(), 5);
        assert_eq!(log.first_fatal().map(|record| record.cycle), Some(2));
        let recent: Vec<Cycle> = log.recent().iter().map(|record| record.cycle).collect();
        assert_eq!(recent, vec![4, 5]);
    }
}
