//! Durable storage for submitted requests and their status.
//!
//! Layout inside the storage directory:
//! - `<id>`: the serialized request (JSON), written once at submit
//! - `<id>_status`: the latest status snapshot (JSON), replaced atomically

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{WorkRequest, WorkStatus};

const STATUS_SUFFIX: &str = "_status";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-based store, one directory for all work
#[derive(Debug, Clone)]
pub struct WorkStore {
    dir: PathBuf,
}

impl WorkStore {
    /// Open (creating if needed) the storage directory and prove it is
    /// writable by writing and removing a probe file
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let probe = dir.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"probe").await.map_err(io_error(&probe))?;
        fs::remove_file(&probe).await.map_err(io_error(&probe))?;

        debug!(dir = %dir.display(), "Storage directory is writable");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn request_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(id.to_string())
    }

    fn status_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}{STATUS_SUFFIX}"))
    }

    /// Persist a request under a new key.
    ///
    /// Returns `false` without touching the existing file if `id` is taken.
    pub async fn create_request(&self, id: Uuid, req: &WorkRequest) -> Result<bool, StoreError> {
        let path = self.request_path(id);
        let bytes = serde_json::to_vec(req).map_err(StoreError::Serialize)?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(io_error(&path)(e)),
        };

        file.write_all(&bytes).await.map_err(io_error(&path))?;
        file.sync_all().await.map_err(io_error(&path))?;

        Ok(true)
    }

    pub async fn load_request(&self, id: Uuid) -> Result<Option<WorkRequest>, StoreError> {
        self.read_json(&self.request_path(id)).await
    }

    /// Replace the status snapshot for `id`.
    ///
    /// Written to a temporary file and renamed into place, so a crash leaves
    /// either the previous snapshot or the new one.
    pub async fn write_status(&self, id: Uuid, status: &WorkStatus) -> Result<(), StoreError> {
        let path = self.status_path(id);
        let tmp = self.dir.join(format!("{id}{STATUS_SUFFIX}.tmp"));
        let bytes = serde_json::to_vec(status).map_err(StoreError::Serialize)?;

        let mut file = fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
        file.write_all(&bytes).await.map_err(io_error(&tmp))?;
        file.sync_all().await.map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, &path).await.map_err(io_error(&path))?;
        Ok(())
    }

    pub async fn load_status(&self, id: Uuid) -> Result<Option<WorkStatus>, StoreError> {
        self.read_json(&self.status_path(id)).await
    }

    pub async fn has_status(&self, id: Uuid) -> Result<bool, StoreError> {
        let path = self.status_path(id);
        fs::try_exists(&path).await.map_err(io_error(&path))
    }

    /// Stored work IDs, newest first
    pub async fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_error(&self.dir))?;

        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = Uuid::parse_str(name) {
                    ids.push(id);
                }
            }
        }

        // v7 IDs sort by creation time
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path)(e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }
}
