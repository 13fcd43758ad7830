//! The RPC surface a client calls through.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Code, Service, ServiceError};
use crate::domain::{WorkRequest, WorkStatus};

/// Failure of a single call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The service answered with a coded error
    #[error(transparent)]
    Status(#[from] ServiceError),

    /// The call never produced a coded answer
    #[error("transport failure: {0}")]
    Transport(String),
}

impl CallError {
    pub fn code(&self) -> Option<Code> {
        match self {
            CallError::Status(e) => Some(e.code),
            CallError::Transport(_) => None,
        }
    }

    /// Fatal errors are neither retried nor counted by the circuit breaker.
    ///
    /// Only uncoded failures, `DeadlineExceeded` and `ResourceExhausted`
    /// are worth another attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.code(),
            None | Some(Code::DeadlineExceeded) | Some(Code::ResourceExhausted)
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, req: &WorkRequest) -> Result<Uuid, CallError>;

    async fn exec(&self, id: Uuid) -> Result<(), CallError>;

    async fn status(&self, id: Uuid) -> Result<WorkStatus, CallError>;
}

/// In-process transport
#[async_trait]
impl Transport for Service {
    async fn submit(&self, req: &WorkRequest) -> Result<Uuid, CallError> {
        Ok(Service::submit(self, req.clone()).await?)
    }

    async fn exec(&self, id: Uuid) -> Result<(), CallError> {
        Ok(Service::exec(self, id).await?)
    }

    async fn status(&self, id: Uuid) -> Result<WorkStatus, CallError> {
        Ok(Service::status(self, id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let coded = |code| CallError::from(ServiceError::new(code, "x"));

        assert!(!CallError::Transport("connection reset".into()).is_fatal());
        assert!(!coded(Code::DeadlineExceeded).is_fatal());
        assert!(!coded(Code::ResourceExhausted).is_fatal());

        assert!(coded(Code::NotFound).is_fatal());
        assert!(coded(Code::InvalidArgument).is_fatal());
        assert!(coded(Code::AlreadyExists).is_fatal());
        assert!(coded(Code::Aborted).is_fatal());
        assert!(coded(Code::Internal).is_fatal());
    }
}
