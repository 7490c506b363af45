use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type MessagingResult<T> = Result<T, MessagingError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient i/o error: {0}")]
    TransientIo(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl MessagingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessagingError::TransientIo(_) | MessagingError::Conflict(_) => ErrorKind::Retryable,
            MessagingError::Validation(_) | MessagingError::NotFound(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            MessagingError::Validation(_) => "VALIDATION_ERROR",
            MessagingError::NotFound(_) => "NOT_FOUND",
            MessagingError::TransientIo(_) => "TRANSIENT_IO",
            MessagingError::Conflict(_) => "CONFLICT",
        }
    }

    fn detail(&self) -> &str {
        match self {
            MessagingError::Validation(m)
            | MessagingError::NotFound(m)
            | MessagingError::TransientIo(m)
            | MessagingError::Conflict(m) => m,
        }
    }
}

impl From<rusqlite::Error> for MessagingError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => MessagingError::NotFound("no such row".into()),
            other => MessagingError::TransientIo(format!("database: {other}")),
        }
    }
}

impl From<std::io::Error> for MessagingError {
    fn from(e: std::io::Error) -> Self {
        MessagingError::TransientIo(e.to_string())
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        MessagingError::Validation(format!("malformed request: {e}"))
    }
}

/// Error as it travels over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&MessagingError> for ErrorBody {
    fn from(e: &MessagingError) -> Self {
        ErrorBody {
            code: e.error_code().to_string(),
            message: e.detail().to_string(),
        }
    }
}

impl From<ErrorBody> for MessagingError {
    fn from(body: ErrorBody) -> Self {
        match body.code.as_str() {
            "VALIDATION_ERROR" => MessagingError::Validation(body.message),
            "NOT_FOUND" => MessagingError::NotFound(body.message),
            "CONFLICT" => MessagingError::Conflict(body.message),
            _ => MessagingError::TransientIo(body.message),
        }
    }
}
