//! Error taxonomy for the resilience control plane
//!
//! The control plane never inspects an operation's error directly. It asks a
//! classifier, and the default classifier is the [`ErrorClassification`]
//! trait defined here. Errors fall into four categories:
//!
//! | Category | Examples | Retried? |
//! |----------|----------|----------|
//! | **Retryable** | network failures, timeouts, HTTP 5xx, HTTP 429 | yes |
//! | **NonRetryable** | validation, authorization, other HTTP 4xx | no |
//! | **Fatal** | programming and configuration errors | never |
//! | **CircuitOpen** | breaker rejected the call without running it | no |
//!
//! ## Generic vs concrete errors
//!
//! The `resilience` layer (breaker, retry, fallback) is generic over the
//! caller's error type `E`. It only requires that `E` can represent the
//! control plane's own interruptions through `From<CircuitOpenError>` and
//! `From<TimeoutError>` (see [`RecoverableError`]), so the original error
//! always reaches the caller unwrapped.
//!
//! The `transaction` and `queue` layers work with the concrete
//! [`ControlError`], which hosts can use directly or map their driver errors
//! into.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type using [`ControlError`]
pub type ControlResult<T> = Result<T, ControlError>;

/// Result type for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Invalid configuration for field '{field}': {message}")]
    InvalidField { field: String, message: String },
}

impl ConfigError {
    /// Create a configuration error without field information
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid { message: message.into() }
    }

    /// Create a configuration error for a specific field
    pub fn field<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::InvalidField { field: field.into(), message: message.into() }
    }
}

/// Raised when a circuit breaker rejects a call without invoking it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker '{name}' is open, rejecting calls")]
pub struct CircuitOpenError {
    /// Name of the protected dependency
    pub name: String,
    /// Time left until the breaker allows a trial call
    pub retry_after: Option<Duration>,
}

/// Raised when a single attempt exceeds its configured timeout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Attempt timed out after {timeout:?}")]
pub struct TimeoutError {
    pub timeout: Duration,
}

/// Raised when every attempt produced a result the validator refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Result rejected by validator after {attempts} attempts")]
pub struct ResultRejected {
    pub attempts: u32,
}

/// Error types the generic resilience layer can propagate
///
/// Implemented automatically for every type that can absorb the control
/// plane's own interruptions. [`ControlError`] qualifies out of the box.
pub trait RecoverableError:
    From<CircuitOpenError> + From<TimeoutError> + fmt::Debug + fmt::Display + 'static
{
}

impl<E> RecoverableError for E where
    E: From<CircuitOpenError> + From<TimeoutError> + fmt::Debug + fmt::Display + 'static
{
}

/// Coarse failure category used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient: network, timeout, 5xx, 429
    Retryable,
    /// Permanent for this input: validation, auth, other 4xx
    NonRetryable,
    /// Programming or configuration error, never retried
    Fatal,
    /// Breaker rejected the call; not retried until its state changes
    CircuitOpen,
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Degraded but operational
    Warning,
    /// Failure requiring attention
    Error,
    /// Immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Standard interface for classifying errors by their characteristics
///
/// Hosts adapt HTTP and database driver errors to the control plane by
/// implementing this trait (or by passing a classifier closure to the retry
/// executor instead).
pub trait ErrorClassification {
    /// Whether a later attempt may succeed
    fn is_retryable(&self) -> bool;

    /// Severity for logging and alerting decisions
    fn severity(&self) -> ErrorSeverity;

    /// Whether the error indicates a programming or configuration fault
    fn is_critical(&self) -> bool;

    /// Suggested delay before the next attempt, if the error carries one
    fn retry_after(&self) -> Option<Duration>;

    /// Coarse category derived from the other classification methods
    fn category(&self) -> ErrorCategory {
        if self.is_critical() {
            ErrorCategory::Fatal
        } else if self.is_retryable() {
            ErrorCategory::Retryable
        } else {
            ErrorCategory::NonRetryable
        }
    }
}

/// Concrete error used by the transaction, saga and queue layers
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// Connectivity failure talking to a dependency
    #[error("Network error from '{service}': {message}")]
    Network { service: String, message: String },

    /// An operation or attempt exceeded its deadline
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// A dependency answered with an HTTP error status
    #[error("'{service}' responded with HTTP {status}: {message}")]
    Http { service: String, status: u16, message: String },

    /// A dependency throttled the caller
    #[error("Rate limited by '{service}'")]
    RateLimited { service: String, retry_after: Option<Duration> },

    /// Input rejected by a dependency or by the caller's own checks
    #[error("Validation error for field '{field}': {message}")]
    Validation { field: String, message: String },

    /// Caller lacks the permission for the operation
    #[error("Unauthorized to perform '{operation}'")]
    Unauthorized { operation: String },

    /// Invariant violation or programming error
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Invalid control plane configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The key/value store or a transaction resource failed
    #[error("Store error during '{operation}': {message}")]
    Store { operation: String, message: String },

    /// JSON or TOML encoding failure
    #[error("Serialization error ({format}): {message}")]
    Serialization { format: String, message: String },

    /// A circuit breaker rejected the call
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Every fallback source failed
    #[error("All {attempted} fallback sources failed; last error: {source}")]
    AllSourcesFailed {
        attempted: usize,
        #[source]
        source: Box<ControlError>,
    },

    /// Every attempt produced a result the validator refused
    #[error(transparent)]
    ResultRejected(#[from] ResultRejected),
}

impl ControlError {
    /// Create a network error
    pub fn network<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Network { service: service.into(), message: message.into() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Create an HTTP status error
    pub fn http<S: Into<String>, M: Into<String>>(service: S, status: u16, message: M) -> Self {
        Self::Http { service: service.into(), status, message: message.into() }
    }

    /// Create a rate limit error
    pub fn rate_limited<S: Into<String>>(service: S, retry_after: Option<Duration>) -> Self {
        Self::RateLimited { service: service.into(), retry_after }
    }

    /// Create a validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Create an authorization error
    pub fn unauthorized<O: Into<String>>(operation: O) -> Self {
        Self::Unauthorized { operation: operation.into() }
    }

    /// Create an internal (fatal) error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create a store error
    pub fn store<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Store { operation: operation.into(), message: message.into() }
    }

    /// Create a serialization error
    pub fn serialization<F: Into<String>, M: Into<String>>(format: F, message: M) -> Self {
        Self::Serialization { format: format.into(), message: message.into() }
    }

    /// Structured fields for `tracing` events
    pub fn as_tracing_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("error.message", self.to_string()),
            ("error.category", format!("{:?}", self.category())),
            ("error.severity", self.severity().to_string()),
        ];
        if let Self::Http { status, .. } = self {
            fields.push(("error.http_status", status.to_string()));
        }
        fields
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

impl ErrorClassification for ControlError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Network { .. } | Self::Http { .. } | Self::Store { .. } => ErrorSeverity::Error,
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::CircuitOpen(_) => {
                ErrorSeverity::Warning
            }
            Self::Validation { .. } | Self::ResultRejected(_) => ErrorSeverity::Error,
            Self::Unauthorized { .. } => ErrorSeverity::Warning,
            Self::Internal { .. } | Self::Config(_) => ErrorSeverity::Critical,
            Self::Serialization { .. } => ErrorSeverity::Error,
            Self::AllSourcesFailed { .. } => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::Config(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::CircuitOpen(open) => open.retry_after,
            _ => None,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::CircuitOpen(_) => ErrorCategory::CircuitOpen,
            _ if self.is_critical() => ErrorCategory::Fatal,
            _ if self.is_retryable() => ErrorCategory::Retryable,
            _ => ErrorCategory::NonRetryable,
        }
    }
}

impl From<TimeoutError> for ControlError {
    fn from(err: TimeoutError) -> Self {
        Self::timeout("attempt", err.timeout)
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON", err.to_string())
    }
}

impl From<toml::de::Error> for ControlError {
    fn from(err: toml::de::Error) -> Self {
        Self::serialization("TOML", err.to_string())
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        Self::store("io", err.to_string())
    }
}
