//! Collaborator seams of the coordinator: the transfer session that owns the
//! durable task registry and the actual network I/O, the URL policy consulted
//! before a download starts, and the file store that persists finished
//! payloads.

pub mod http;
pub mod registry;
pub mod store;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

/// Opaque token allowing a partially completed transfer to continue without
/// restarting from zero.
#[derive(Debug, Clone)]
pub struct ResumeData {
    pub partial_path: PathBuf,
    pub bytes_received: u64,
}

/// A task still known to the durable transfer layer but not tracked by any
/// in-memory download, left behind by a previous process lifetime.
#[derive(Debug, Clone)]
pub struct OrphanedTask {
    pub url: Url,
    pub resume: ResumeData,
}

/// A payload persisted by the [`FileStore`].
#[derive(Debug, Clone)]
pub struct SavedFile {
    pub path: PathBuf,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Resume,
    Suspend,
    Cancel,
}

/// Handle to one underlying transfer task.
///
/// Commands are fire-and-forget: a send to a task that already reached a
/// terminal state is silently dropped, mirroring how stale events are dropped
/// on the way back.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: Uuid,
    control: mpsc::UnboundedSender<TaskControl>,
}

impl TaskHandle {
    pub fn new(id: Uuid, control: mpsc::UnboundedSender<TaskControl>) -> Self {
        Self { id, control }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resume(&self) {
        let _ = self.control.send(TaskControl::Resume);
    }

    pub fn suspend(&self) {
        let _ = self.control.send(TaskControl::Suspend);
    }

    pub fn cancel(&self) {
        let _ = self.control.send(TaskControl::Cancel);
    }
}

/// The underlying transfer layer.
///
/// `start` and `resume` only construct an idle task; network I/O begins when
/// the returned handle receives its first `Resume`. The session's durable
/// registry, not the coordinator's active set, is the state that survives
/// process restarts, and `orphaned_tasks` is how the active set gets rebuilt
/// on top of it.
#[async_trait]
pub trait TransferSession: Send + Sync {
    fn start(&self, url: &Url) -> TaskHandle;

    fn resume(&self, url: &Url, resume: ResumeData) -> TaskHandle;

    async fn orphaned_tasks(&self) -> anyhow::Result<Vec<OrphanedTask>>;
}

/// Whether the platform can open a URL at all, consulted before starting.
pub trait UrlPolicy: Send + Sync {
    fn can_open(&self, url: &Url) -> bool;
}

/// Accepts URLs whose scheme is in a fixed allow-list.
pub struct SchemePolicy {
    schemes: Vec<&'static str>,
}

impl SchemePolicy {
    pub fn http() -> Self {
        Self {
            schemes: vec!["http", "https"],
        }
    }
}

impl UrlPolicy for SchemePolicy {
    fn can_open(&self, url: &Url) -> bool {
        self.schemes.contains(&url.scheme())
    }
}

/// Moves a finished payload from its temporary location to durable storage.
/// Invoked exactly once per successful download.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn save(&self, location: &Path, file_name: &str) -> anyhow::Result<SavedFile>;
}
