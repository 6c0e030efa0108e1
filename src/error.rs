//! Error types for family-points

use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Rule is inactive: {0}")]
    RuleInactive(String),

    #[error("Child {child_id} does not belong to family {family_id}")]
    ChildNotInFamily { child_id: String, family_id: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Insufficient balance for child {child_id}: balance {balance}, delta {delta}")]
    InsufficientBalance {
        child_id: String,
        balance: i64,
        delta: i64,
    },

    #[error("Insufficient points: have {balance}, need {required}")]
    InsufficientPoints { balance: i64, required: i64 },

    #[error("Event already applied: {0}")]
    DuplicateApplication(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Stable machine-readable code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::RuleNotFound(_) => "RULE_NOT_FOUND",
            LedgerError::RuleInactive(_) => "RULE_INACTIVE",
            LedgerError::ChildNotInFamily { .. } => "CHILD_NOT_IN_FAMILY",
            LedgerError::Unauthorized(_) => "UNAUTHORIZED",
            LedgerError::Auth(_) => "AUTH_REQUIRED",
            LedgerError::InvalidState(_) => "INVALID_STATE",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::InsufficientPoints { .. } => "INSUFFICIENT_POINTS",
            LedgerError::DuplicateApplication(_) => "DUPLICATE_APPLICATION",
            LedgerError::AlreadyExists(_) => "ALREADY_EXISTS",
            LedgerError::InvalidInput(_) | LedgerError::Json(_) => "INVALID_INPUT",
            LedgerError::Storage(_) => "STORAGE_FAILURE",
            LedgerError::Io(_) | LedgerError::Config(_) | LedgerError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            LedgerError::NotFound(_) | LedgerError::RuleNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::ChildNotInFamily { .. } | LedgerError::Unauthorized(_) => {
                StatusCode::FORBIDDEN
            }
            LedgerError::Auth(_) => StatusCode::UNAUTHORIZED,
            LedgerError::RuleInactive(_)
            | LedgerError::InvalidState(_)
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::InsufficientPoints { .. }
            | LedgerError::DuplicateApplication(_)
            | LedgerError::AlreadyExists(_) => StatusCode::CONFLICT,
            LedgerError::InvalidInput(_) | LedgerError::Json(_) => StatusCode::BAD_REQUEST,
            LedgerError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Io(_) | LedgerError::Config(_) | LedgerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Only transient storage failures are worth retrying, with the same event id
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }

    /// Message safe to show to an end user
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::InsufficientPoints { balance, required } => format!(
                "Not enough points for this reward: {} available, {} required",
                balance, required
            ),
            LedgerError::Storage(_)
            | LedgerError::Io(_)
            | LedgerError::Config(_)
            | LedgerError::Internal(_) => {
                "Something went wrong on our side, please try again later".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Classify a rusqlite error.
    ///
    /// Lock contention is transient. A constraint violation means the caller
    /// reused an id or referenced a missing row, which no retry will fix.
    pub fn from_sqlite(context: &str, err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                LedgerError::Storage(format!("{}: {}", context, err))
            }
            Some(ErrorCode::ConstraintViolation) => LedgerError::AlreadyExists(format!(
                "{}: id already in use or references a missing record",
                context
            )),
            _ => LedgerError::Internal(format!("{}: {}", context, err)),
        }
    }
}

/// Shorthand used by the repository layer
pub(crate) fn sql_err(context: &'static str) -> impl Fn(rusqlite::Error) -> LedgerError {
    move |e| LedgerError::from_sqlite(context, e)
}
