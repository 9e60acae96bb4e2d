//! Transfer workers.
//!
//! A [`TransferJob`] describes one file moving through a router relay slot.
//! Workers are state machines (`start -> handshake -> transfer -> download |
//! upload -> quit`) that spawn shards, each with its own router connection,
//! claiming chunks from the shared [`Transfer`].

mod download;
mod manager;
mod shard;
mod upload;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use demonsaw_files::{Queued, Transfer};

use crate::error::Result;
use crate::group::Group;
use crate::status::Status;

pub use download::DownloadWorker;
pub use manager::TransferManager;
pub use upload::UploadWorker;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Receive a file
    Download,
    /// Send a file
    Upload,
}

#[derive(Debug)]
struct JobInner {
    id: String,
    path: PathBuf,
    file_name: String,
    direction: Direction,
    transfer: Transfer,
    status: Mutex<Status>,
    group: OnceLock<Arc<Group>>,
}

/// A file transfer through relay slot `id`. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransferJob {
    inner: Arc<JobInner>,
}

impl TransferJob {
    fn new(id: String, path: PathBuf, file_size: u64, direction: Direction) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            inner: Arc::new(JobInner {
                id,
                path,
                file_name,
                direction,
                transfer: Transfer::new(file_size),
                status: Mutex::new(Status::Queued),
                group: OnceLock::new(),
            }),
        }
    }

    /// Receive `file_size` bytes from slot `id` into `path`.
    #[must_use]
    pub fn download(id: impl Into<String>, path: impl Into<PathBuf>, file_size: u64) -> Self {
        Self::new(id.into(), path.into(), file_size, Direction::Download)
    }

    /// Send the file at `path` through slot `id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the file cannot be inspected.
    pub async fn upload(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_size = tokio::fs::metadata(&path).await?.len();
        Ok(Self::new(id.into(), path, file_size, Direction::Upload))
    }

    /// Wrap chunk payloads with a group cipher chain. Only the first group
    /// set on a job is kept.
    #[must_use]
    pub fn with_group(self, group: Arc<Group>) -> Self {
        let _ = self.inner.group.set(group);
        self
    }

    /// Relay slot id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Local path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// File name for display and priority matching.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    /// Direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Progress state.
    #[must_use]
    pub fn transfer(&self) -> &Transfer {
        &self.inner.transfer
    }

    /// Group chain, if payloads are wrapped.
    #[must_use]
    pub fn group(&self) -> Option<&Group> {
        self.inner.group.get().map(Arc::as_ref)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the status.
    pub fn set_status(&self, status: Status) {
        *self.inner.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub(crate) fn seal(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.group() {
            Some(group) => group.encrypt(&data),
            None => Ok(data),
        }
    }

    pub(crate) fn unseal(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.group() {
            Some(group) => group.decrypt(&data),
            None => Ok(data),
        }
    }
}

impl Queued for TransferJob {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    fn file_size(&self) -> u64 {
        self.inner.transfer.file_size()
    }

    fn is_upload(&self) -> bool {
        self.inner.direction == Direction::Upload
    }
}
