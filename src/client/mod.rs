//! Resilient client for the work service.
//!
//! Every call runs under a deadline inside a retry loop with exponential
//! backoff, and the whole loop sits behind a circuit breaker. Only
//! non-fatal errors (see [`CallError::is_fatal`]) are retried or counted
//! against the breaker.

mod backoff;
mod circuit_breaker;
mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::core::{Code, ServiceError};
use crate::domain::{WorkRequest, WorkStatus};

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use transport::{CallError, Transport};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Deadline applied when the caller supplies none
    pub default_deadline: Duration,
    pub backoff: BackoffPolicy,
    pub breaker: CircuitBreakerConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// A fatal answer, returned on the first occurrence
    #[error(transparent)]
    Call(CallError),

    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded {
        attempts: u32,
        last: Option<CallError>,
    },

    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl ClientError {
    pub fn code(&self) -> Option<Code> {
        match self {
            ClientError::Call(e) => e.code(),
            ClientError::DeadlineExceeded { .. } => Some(Code::DeadlineExceeded),
            ClientError::CircuitOpen => None,
        }
    }
}

pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    options: ClientOptions,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, ClientOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            transport,
            breaker: CircuitBreaker::new(options.breaker.clone()),
            options,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[instrument(skip_all, fields(workflow = %req.name))]
    pub async fn submit(
        &self,
        req: &WorkRequest,
        deadline: Option<Duration>,
    ) -> Result<Uuid, ClientError> {
        let transport = self.transport.as_ref();
        self.call("submit", deadline, move || transport.submit(req))
            .await
    }

    #[instrument(skip(self))]
    pub async fn exec(&self, id: Uuid, deadline: Option<Duration>) -> Result<(), ClientError> {
        let transport = self.transport.as_ref();
        self.call("exec", deadline, move || transport.exec(id)).await
    }

    #[instrument(skip(self))]
    pub async fn status(
        &self,
        id: Uuid,
        deadline: Option<Duration>,
    ) -> Result<WorkStatus, ClientError> {
        let transport = self.transport.as_ref();
        self.call("status", deadline, move || transport.status(id))
            .await
    }

    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        deadline: Option<Duration>,
        attempt: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        if !self.breaker.allow_request() {
            debug!(op, "Circuit breaker open, refusing call");
            return Err(ClientError::CircuitOpen);
        }

        let result = self.retry(op, deadline, attempt).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(ClientError::Call(e)) if e.is_fatal() => self.breaker.record_ignored(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    async fn retry<T, F, Fut>(
        &self,
        op: &'static str,
        deadline: Option<Duration>,
        mut attempt: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let deadline_at = Instant::now() + deadline.unwrap_or(self.options.default_deadline);
        let mut attempts = 0;
        let mut last = None;

        loop {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::DeadlineExceeded { attempts, last });
            }

            attempts += 1;
            let err = match tokio::time::timeout(remaining, attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => CallError::Status(ServiceError::new(
                    Code::DeadlineExceeded,
                    format!("{op} did not answer in time"),
                )),
            };

            if err.is_fatal() {
                debug!(op, error = %err, "Fatal error, not retrying");
                return Err(ClientError::Call(err));
            }

            let delay = self.options.backoff.delay_for_attempt(attempts);
            if Instant::now() + delay > deadline_at {
                warn!(op, attempts, error = %err, "Giving up, next retry would pass the deadline");
                return Err(ClientError::DeadlineExceeded {
                    attempts,
                    last: Some(err),
                });
            }

            debug!(op, attempts, ?delay, error = %err, "Retrying");
            last = Some(err);
            tokio::time::sleep(delay).await;
        }
    }
}
