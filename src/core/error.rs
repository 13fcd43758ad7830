//! Status codes and the error type returned by the service operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error code carried by service errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    InvalidArgument,
    ResourceExhausted,
    AlreadyExists,
    NotFound,
    FailedPrecondition,
    DeadlineExceeded,
    /// Refused by the emergency stop
    Aborted,
    Internal,
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Code::InvalidArgument => "invalid argument",
            Code::ResourceExhausted => "resource exhausted",
            Code::AlreadyExists => "already exists",
            Code::NotFound => "not found",
            Code::FailedPrecondition => "failed precondition",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::Aborted => "aborted",
            Code::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error returned synchronously from Submit, Exec and Status
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: Code,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServiceError::already_exists("work 123 already executed");
        assert_eq!(err.to_string(), "already exists: work 123 already executed");
        assert_eq!(err.code, Code::AlreadyExists);
    }
}
