//! Emergency stop: a per-workflow Go/Stop kill switch.
//!
//! The table is read from a YAML document on a fixed interval:
//!
//! ```yaml
//! - name: Demo
//!   status: go
//! - name: Nightly
//!   status: stop
//! ```
//!
//! Workflows missing from the table are treated as stopped. Running
//! workflows hold a [`Subscription`] and receive a single `Stop` when their
//! entry leaves `Go`; after that the channel is closed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::reload::spawn_periodic;

/// Whether a workflow may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopStatus {
    #[serde(alias = "Go", alias = "GO")]
    Go,
    #[serde(alias = "Stop", alias = "STOP")]
    Stop,
}

impl std::fmt::Display for StopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopStatus::Go => write!(f, "go"),
            StopStatus::Stop => write!(f, "stop"),
        }
    }
}

/// One line of the emergency stop document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopEntry {
    pub name: String,
    pub status: StopStatus,
}

impl StopEntry {
    pub fn go(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StopStatus::Go,
        }
    }

    pub fn stop(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StopStatus::Stop,
        }
    }
}

#[derive(Debug, Error)]
pub enum StopConfigError {
    #[error("failed to read emergency stop config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse emergency stop config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("workflow {0:?} is listed more than once")]
    Duplicate(String),
}

type StopTable = HashMap<String, StopStatus>;

/// Parse an emergency stop document into a lookup table
pub fn parse_table(content: &str) -> Result<StopTable, StopConfigError> {
    if content.trim().is_empty() {
        return Ok(StopTable::new());
    }

    let entries: Vec<StopEntry> = serde_yaml::from_str(content)?;
    build_table(entries)
}

fn build_table(entries: impl IntoIterator<Item = StopEntry>) -> Result<StopTable, StopConfigError> {
    let mut table = StopTable::new();
    for entry in entries {
        if table.insert(entry.name.clone(), entry.status).is_some() {
            return Err(StopConfigError::Duplicate(entry.name));
        }
    }
    Ok(table)
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<StopStatus>,
}

struct StopState {
    path: Option<PathBuf>,
    table: RwLock<Arc<StopTable>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl StopState {
    fn status(&self, name: &str) -> StopStatus {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(StopStatus::Stop)
    }

    /// Swap in a new table and notify subscribers that are no longer `Go`
    fn apply(&self, table: StopTable) {
        let table = Arc::new(table);

        // Held across the swap so a concurrent subscribe sees either the old
        // table and gets notified here, or the new table directly.
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&table);

        subscribers.retain(|_, sub| {
            if table.get(&sub.name) == Some(&StopStatus::Go) {
                return true;
            }
            info!(workflow = %sub.name, "Emergency stop triggered");
            // Capacity is never exhausted: at most Go then Stop are sent
            let _ = sub.tx.try_send(StopStatus::Stop);
            false
        });
    }

    async fn reload(&self) -> Result<(), StopConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let parsed = match tokio::fs::read_to_string(path).await {
            Ok(content) => parse_table(&content),
            Err(e) => Err(StopConfigError::Io {
                path: path.clone(),
                source: e,
            }),
        };

        match parsed {
            Ok(table) => {
                self.apply(table);
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Emergency stop reload failed, stopping all workflows");
                self.apply(StopTable::new());
                Err(e)
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Handle that keeps an emergency stop subscription registered.
///
/// Dropping it (or calling [`Subscription::cancel`]) removes the
/// registration and closes the channel.
pub struct Subscription {
    id: u64,
    state: Weak<StopState>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.unsubscribe(self.id);
        }
    }
}

/// Process-wide emergency stop table with live subscriptions
pub struct EmergencyStop {
    state: Arc<StopState>,
    shutdown: CancellationToken,
}

impl EmergencyStop {
    /// Load the table from `path`; the initial load must succeed
    #[instrument]
    pub async fn load(path: &Path) -> Result<Self, StopConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StopConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        let table = parse_table(&content)?;
        info!(workflows = table.len(), "Loaded emergency stop table");

        Ok(Self::with_state(Some(path.to_path_buf()), table))
    }

    /// An in-memory table that only changes through [`EmergencyStop::set_entries`]
    pub fn from_entries(
        entries: impl IntoIterator<Item = StopEntry>,
    ) -> Result<Self, StopConfigError> {
        Ok(Self::with_state(None, build_table(entries)?))
    }

    fn with_state(path: Option<PathBuf>, table: StopTable) -> Self {
        Self {
            state: Arc::new(StopState {
                path,
                table: RwLock::new(Arc::new(table)),
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Re-read the source every `period` until dropped
    pub fn start_reloading(&self, period: Duration) {
        let state = Arc::clone(&self.state);
        spawn_periodic("emergency_stop", period, self.shutdown.clone(), move || {
            let state = Arc::clone(&state);
            async move {
                // Failures already force-stop every subscriber
                let _ = state.reload().await;
            }
        });
    }

    /// Re-read the source now.
    ///
    /// A parse or read failure empties the table, so every workflow is
    /// treated as stopped until a good document is loaded.
    pub async fn reload(&self) -> Result<(), StopConfigError> {
        self.state.reload().await
    }

    /// Replace the whole table
    pub fn set_entries(
        &self,
        entries: impl IntoIterator<Item = StopEntry>,
    ) -> Result<(), StopConfigError> {
        self.state.apply(build_table(entries)?);
        Ok(())
    }

    /// Point lookup; unknown workflows are `Stop`
    pub fn status(&self, name: &str) -> StopStatus {
        self.state.status(name)
    }

    /// Subscribe to stop notifications for `name`.
    ///
    /// The current status is available immediately. If it is `Stop` the
    /// channel closes right after it; otherwise a single `Stop` follows when
    /// the workflow leaves `Go`, and the channel closes after that.
    pub fn subscribe(&self, name: &str) -> (mpsc::Receiver<StopStatus>, Subscription) {
        let (tx, rx) = mpsc::channel(2);
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self
            .state
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let status = self.state.status(name);
        // Fresh channel with spare capacity
        let _ = tx.try_send(status);

        if status == StopStatus::Go {
            subscribers.insert(
                id,
                Subscriber {
                    name: name.to_string(),
                    tx,
                },
            );
        } else {
            warn!(workflow = %name, "Subscribed while stopped");
        }

        (
            rx,
            Subscription {
                id,
                state: Arc::downgrade(&self.state),
            },
        )
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.state
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for EmergencyStop {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_table() {
        let table = parse_table("- name: Demo\n  status: go\n- name: Old\n  status: Stop\n").unwrap();
        assert_eq!(table.get("Demo"), Some(&StopStatus::Go));
        assert_eq!(table.get("Old"), Some(&StopStatus::Stop));

        assert!(parse_table("").unwrap().is_empty());
        assert!(matches!(
            parse_table("- name: A\n  status: go\n- name: A\n  status: stop\n"),
            Err(StopConfigError::Duplicate(_))
        ));
        assert!(parse_table("- name: A\n  status: maybe\n").is_err());
    }

    #[test]
    fn test_status_lookup() {
        let estop = EmergencyStop::from_entries([StopEntry::go("Demo"), StopEntry::stop("Old")])
            .unwrap();

        assert_eq!(estop.status("Demo"), StopStatus::Go);
        assert_eq!(estop.status("Old"), StopStatus::Stop);
        assert_eq!(estop.status("Unknown"), StopStatus::Stop);
    }

    #[tokio::test]
    async fn test_subscribe_to_stopped_workflow_closes_immediately() {
        let estop = EmergencyStop::from_entries([StopEntry::stop("Old")]).unwrap();

        for name in ["Old", "Unknown"] {
            let (mut rx, _sub) = estop.subscribe(name);
            assert_eq!(rx.recv().await, Some(StopStatus::Stop));
            assert_eq!(rx.recv().await, None);
        }
        assert_eq!(estop.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_transition_delivers_single_stop() {
        let estop = EmergencyStop::from_entries([StopEntry::go("Demo"), StopEntry::go("Other")])
            .unwrap();

        let (mut rx, _sub) = estop.subscribe("Demo");
        let (mut other_rx, _other) = estop.subscribe("Other");
        assert_eq!(rx.recv().await, Some(StopStatus::Go));
        assert_eq!(estop.subscriber_count(), 2);

        estop
            .set_entries([StopEntry::stop("Demo"), StopEntry::go("Other")])
            .unwrap();

        assert_eq!(rx.recv().await, Some(StopStatus::Stop));
        assert_eq!(rx.recv().await, None);
        assert_eq!(estop.subscriber_count(), 1);

        assert_eq!(other_rx.recv().await, Some(StopStatus::Go));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_subscription() {
        let estop = EmergencyStop::from_entries([StopEntry::go("Demo")]).unwrap();

        let (mut rx, sub) = estop.subscribe("Demo");
        assert_eq!(estop.subscriber_count(), 1);

        sub.cancel();
        assert_eq!(estop.subscriber_count(), 0);
        assert_eq!(rx.recv().await, Some(StopStatus::Go));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_bad_reload_stops_everything() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("estop.yaml");
        std::fs::write(&path, "- name: Demo\n  status: go\n").unwrap();

        let estop = EmergencyStop::load(&path).await.unwrap();
        let (mut rx, _sub) = estop.subscribe("Demo");
        assert_eq!(rx.recv().await, Some(StopStatus::Go));

        std::fs::write(&path, "- name: [broken").unwrap();
        assert!(estop.reload().await.is_err());

        assert_eq!(rx.recv().await, Some(StopStatus::Stop));
        assert_eq!(rx.recv().await, None);
        assert_eq!(estop.status("Demo"), StopStatus::Stop);

        std::fs::write(&path, "- name: Demo\n  status: go\n").unwrap();
        estop.reload().await.unwrap();
        assert_eq!(estop.status("Demo"), StopStatus::Go);
    }
}
