//! Error taxonomy for the engine.
//!
//! Every error carries a kind that tells a loop what to do with it:
//! - Transient: retried by the activity runner, then the loop continues-as-new
//! - InvariantViolation: the iteration is skipped
//! - StopRenew: the loop ends without continuing-as-new
//! - everything else surfaces to the caller

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Transient,
    InvariantViolation,
    StopRenew,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorKind::StopRenew => "STOP_RENEW",
            ErrorKind::Fatal => "FATAL",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    /// Some chunks of a fan-out went out before another failed. Never
    /// retried, since a retry would deliver the sent chunks again.
    #[error("partial delivery: {0}")]
    PartialDelivery(String),

    #[error("activity {activity} timed out ({stage})")]
    Timeout {
        activity: String,
        stage: &'static str,
    },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("INVALID_LOCATION")]
    InvalidLocation,

    #[error("TOO_FREQUENT")]
    TooFrequent,

    #[error("STOP_RENEW")]
    StopRenew,

    #[error("workflow cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Store(_)
            | EngineError::Delivery(_)
            | EngineError::PartialDelivery(_)
            | EngineError::Timeout { .. }
            | EngineError::Cancelled => ErrorKind::Transient,
            EngineError::InvalidLocation | EngineError::TooFrequent => {
                ErrorKind::InvariantViolation
            }
            EngineError::StopRenew => ErrorKind::StopRenew,
            EngineError::Encoding(_) | EngineError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the activity runner should try again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
            && !matches!(self, EngineError::Cancelled | EngineError::PartialDelivery(_))
    }

    /// Returns true if the loop should quietly skip this iteration.
    pub fn is_skip(&self) -> bool {
        self.kind() == ErrorKind::InvariantViolation
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                EngineError::Conflict(db.message().to_string())
            }
            _ => EngineError::Store(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Delivery(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        EngineError::Encoding(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        EngineError::Encoding(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Fatal(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Central sink for errors caught at a loop's activity boundary.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, workflow_id: &str, err: &EngineError);
}

/// Default reporter: one structured `error!` event per failure.
#[derive(Debug, Default, Clone)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, workflow_id: &str, err: &EngineError) {
        tracing::error!(
            workflow_id,
            error_kind = err.kind().as_str(),
            error = %err,
            "workflow iteration failed"
        );
    }
}
