//! Submit / Exec / Status lifecycle on top of the executor.
//!
//! Requests are validated and persisted at submit, executed at most once,
//! and their status served from memory while running and from disk after.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::{Uuid, Version};

use crate::domain::{WorkRequest, WorkStatus};

use super::error::ServiceError;
use super::estop::StopStatus;
use super::executor::{EngineContext, Executor, ValidationError};
use super::store::{StoreError, WorkStore};

/// What [`Service::recent`] knows about one piece of work
#[derive(Debug, Clone, PartialEq)]
pub enum RecentStatus {
    /// Submitted but never executed
    Submitted,
    Known(WorkStatus),
    /// A status was recorded but cannot be read back
    Unreadable(String),
}

/// Service limits
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Concurrent in-flight calls allowed per operation
    pub max_in_flight: usize,

    /// Oldest work ID that may still be executed
    pub exec_window: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            exec_window: Duration::from_secs(3600),
        }
    }
}

type ActiveTable = HashMap<Uuid, watch::Receiver<WorkStatus>>;

/// Orchestration façade exposed to clients
pub struct Service {
    ctx: EngineContext,
    store: WorkStore,
    active: Arc<Mutex<ActiveTable>>,
    submit_limit: Semaphore,
    exec_limit: Semaphore,
    status_limit: Semaphore,
    exec_window: Duration,
}

fn admit<'a>(limit: &'a Semaphore, op: &str) -> Result<SemaphorePermit<'a>, ServiceError> {
    limit.try_acquire().map_err(|_| {
        warn!(op, "Too many concurrent calls, rejecting");
        ServiceError::resource_exhausted(format!("too many concurrent {op} calls"))
    })
}

fn storage_error(e: StoreError) -> ServiceError {
    error!(error = %e, "Storage failure");
    ServiceError::internal(e.to_string())
}

fn validation_error(e: ValidationError) -> ServiceError {
    if e.is_security_violation() {
        ServiceError::internal(e.to_string())
    } else {
        ServiceError::invalid_argument(e.to_string())
    }
}

impl Service {
    pub fn new(ctx: EngineContext, store: WorkStore, config: ServiceConfig) -> Self {
        Self {
            ctx,
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
            submit_limit: Semaphore::new(config.max_in_flight),
            exec_limit: Semaphore::new(config.max_in_flight),
            status_limit: Semaphore::new(config.max_in_flight),
            exec_window: config.exec_window,
        }
    }

    pub fn store(&self) -> &WorkStore {
        &self.store
    }

    /// Validate and persist a request, returning its new ID
    #[instrument(skip_all, fields(workflow = %req.name))]
    pub async fn submit(&self, req: WorkRequest) -> Result<Uuid, ServiceError> {
        let _permit = admit(&self.submit_limit, "submit")?;
        self.check_estop(&req.name)?;

        let executor = Executor::new(req, self.ctx.clone());
        executor
            .validate(&CancellationToken::new())
            .await
            .map_err(validation_error)?;

        loop {
            let id = Uuid::now_v7();
            if self
                .store
                .create_request(id, executor.request())
                .await
                .map_err(storage_error)?
            {
                info!(%id, "Work submitted");
                return Ok(id);
            }
            debug!(%id, "Work ID already taken, generating another");
        }
    }

    /// Start executing a submitted request.
    ///
    /// Returns as soon as the run is registered; progress is observed
    /// through [`Service::status`].
    #[instrument(skip(self))]
    pub async fn exec(&self, id: Uuid) -> Result<(), ServiceError> {
        let _permit = admit(&self.exec_limit, "exec")?;

        // Held until the run is registered so two execs cannot both pass
        let mut active = self.active.lock().await;

        if active.contains_key(&id) {
            return Err(ServiceError::already_exists(format!(
                "work {id} is already running"
            )));
        }
        if self.store.has_status(id).await.map_err(storage_error)? {
            return Err(ServiceError::already_exists(format!(
                "work {id} was already executed"
            )));
        }
        self.check_fresh(id)?;

        let req = self
            .store
            .load_request(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ServiceError::not_found(format!("work {id} was never submitted")))?;
        self.check_estop(&req.name)?;

        let executor = Executor::new(req, self.ctx.clone());
        self.store
            .write_status(id, &executor.status())
            .await
            .map_err(storage_error)?;

        active.insert(id, executor.subscribe());
        drop(active);

        self.spawn_run(id, executor);
        info!("Work started");
        Ok(())
    }

    /// Latest status: live while running, from disk afterwards
    #[instrument(skip(self))]
    pub async fn status(&self, id: Uuid) -> Result<WorkStatus, ServiceError> {
        let _permit = admit(&self.status_limit, "status")?;

        if let Some(live) = self.active.lock().await.get(&id) {
            return Ok(live.borrow().clone());
        }

        match self.store.load_status(id).await {
            Ok(Some(status)) => Ok(status),
            Ok(None) => Err(ServiceError::invalid_argument(format!(
                "no status recorded for work {id}"
            ))),
            Err(e) => Err(storage_error(e)),
        }
    }

    /// The most recent submissions, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<(Uuid, RecentStatus)>, ServiceError> {
        let ids = self.store.list().await.map_err(storage_error)?;
        let mut recent = Vec::new();

        for id in ids.into_iter().take(limit) {
            let live = self
                .active
                .lock()
                .await
                .get(&id)
                .map(|rx| rx.borrow().clone());
            let status = match live {
                Some(status) => RecentStatus::Known(status),
                None => match self.store.load_status(id).await {
                    Ok(Some(status)) => RecentStatus::Known(status),
                    Ok(None) => RecentStatus::Submitted,
                    Err(e) => {
                        warn!(%id, error = %e, "Unreadable work status");
                        RecentStatus::Unreadable(e.to_string())
                    }
                },
            };
            recent.push((id, status));
        }

        Ok(recent)
    }

    /// Number of runs currently in flight
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    fn check_estop(&self, workflow: &str) -> Result<(), ServiceError> {
        if self.ctx.estop.status(workflow) != StopStatus::Go {
            return Err(ServiceError::aborted(format!(
                "workflow {workflow:?} is emergency stopped"
            )));
        }
        Ok(())
    }

    fn check_fresh(&self, id: Uuid) -> Result<(), ServiceError> {
        let created = id
            .get_timestamp()
            .filter(|_| id.get_version() == Some(Version::SortRand))
            .and_then(|ts| {
                let (secs, nanos) = ts.to_unix();
                DateTime::<Utc>::from_timestamp(i64::try_from(secs).ok()?, nanos)
            })
            .ok_or_else(|| {
                ServiceError::invalid_argument(format!("{id} is not a valid work id"))
            })?;

        let age = (Utc::now() - created).to_std().unwrap_or_default();
        if age > self.exec_window {
            return Err(ServiceError::failed_precondition(format!(
                "work {id} is {}s old, older than the {}s execution window",
                age.as_secs(),
                self.exec_window.as_secs()
            )));
        }
        Ok(())
    }

    fn spawn_run(&self, id: Uuid, executor: Executor) {
        let store = self.store.clone();
        let active = Arc::clone(&self.active);
        let updates = executor.subscribe();

        let run = async move {
            let writer = tokio::spawn(persist_updates(store.clone(), id, updates));
            let last = executor.run(CancellationToken::new()).await;

            if let Err(e) = writer.await {
                error!(error = %e, "Status writer failed");
            }
            if let Err(e) = store.write_status(id, &last).await {
                error!(error = %e, "Failed to persist final status");
            }

            active.lock().await.remove(&id);
            debug!(status = %last.status, "Run removed from active table");
        };

        tokio::spawn(run.instrument(info_span!("run", %id)));
    }
}

/// Mirror status updates to disk.
///
/// The watch channel holds one value, so while a write is in progress newer
/// updates replace each other and only the latest is written next.
async fn persist_updates(store: WorkStore, id: Uuid, mut updates: watch::Receiver<WorkStatus>) {
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        if let Err(e) = store.write_status(id, &snapshot).await {
            warn!(%id, error = %e, "Failed to persist status update");
        }
    }
}
