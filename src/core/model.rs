use std::sync::{Arc, Mutex};

use url::Url;

use crate::session::TaskHandle;

/// Lifecycle of a single download, driven by the coordinator in response to
/// transfer-layer events or explicit caller action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Waiting,
    Running,
    Suspended,
    Canceling,
    Completed,
}

/// Byte-level progress of one transfer.
///
/// The expected total is latched exactly once from the first authoritative
/// size report; until then the progress is "initial" and no percentage can be
/// derived.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    bytes_received: u64,
    total_bytes: Option<u64>,
}

impl Progress {
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    /// True until the expected size has been reported.
    pub fn is_initial(&self) -> bool {
        self.total_bytes.is_none()
    }

    pub fn percent(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.bytes_received as f64 / total as f64) * 100.0
            }
        })
    }

    /// First authoritative size report wins; later reports are ignored.
    pub(crate) fn latch_total(&mut self, total: u64) {
        if self.total_bytes.is_none() {
            self.total_bytes = Some(total);
        }
    }

    /// Cumulative bytes written, clamped to the total once it is known.
    pub(crate) fn set_bytes_received(&mut self, bytes: u64) {
        self.bytes_received = match self.total_bytes {
            Some(total) => bytes.min(total),
            None => bytes,
        };
    }
}

#[derive(Debug)]
struct DownloadInner {
    state: DownloadState,
    progress: Progress,
    file_name: String,
    file_name_was_set: bool,
}

/// One in-flight download. Identity (and equality) is the source URL alone;
/// cloning yields another reference to the same shared entity.
///
/// Field mutation goes through the coordinator; callers only get the thin
/// `resume`/`pause`/`cancel` wrappers over the transfer task handle.
#[derive(Debug, Clone)]
pub struct Download {
    url: Url,
    handle: TaskHandle,
    inner: Arc<Mutex<DownloadInner>>,
}

impl Download {
    pub(crate) fn new(url: Url, handle: TaskHandle, file_name: Option<String>) -> Self {
        let (file_name, file_name_was_set) = match file_name {
            Some(name) => (name, true),
            None => (default_file_name(&url), false),
        };
        Self {
            url,
            handle,
            inner: Arc::new(Mutex::new(DownloadInner {
                state: DownloadState::Waiting,
                progress: Progress::default(),
                file_name,
                file_name_was_set,
            })),
        }
    }

    /// Rebuilds an entity from an orphaned task left behind by a previous
    /// process. Starts out waiting, with the already-received bytes counted.
    pub(crate) fn recovered(url: Url, handle: TaskHandle, bytes_received: u64) -> Self {
        let download = Self::new(url, handle, None);
        download.update_progress(|p| p.set_bytes_received(bytes_received));
        download
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> DownloadState {
        self.inner.lock().expect("download lock").state
    }

    pub fn progress(&self) -> Progress {
        self.inner.lock().expect("download lock").progress
    }

    pub fn file_name(&self) -> String {
        self.inner.lock().expect("download lock").file_name.clone()
    }

    /// Fixes the file name explicitly; a server-suggested name will no longer
    /// override it.
    pub fn set_file_name(&self, name: impl Into<String>) {
        let mut inner = self.inner.lock().expect("download lock");
        inner.file_name = name.into();
        inner.file_name_was_set = true;
    }

    /// Adopts the server-suggested name, but only while the caller never
    /// explicitly set one.
    pub(crate) fn adopt_suggested_name(&self, name: &str) {
        let mut inner = self.inner.lock().expect("download lock");
        if !inner.file_name_was_set && inner.file_name != name {
            inner.file_name = name.to_string();
        }
    }

    /// Starts or resumes the underlying transfer.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().expect("download lock");
        if matches!(inner.state, DownloadState::Waiting | DownloadState::Suspended) {
            inner.state = DownloadState::Running;
            self.handle.resume();
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("download lock");
        if inner.state == DownloadState::Running {
            inner.state = DownloadState::Suspended;
            self.handle.suspend();
        }
    }

    /// Cancellation completes asynchronously; the transfer layer reports it
    /// back as a terminal error event while the state is `Canceling`.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().expect("download lock");
        if !matches!(
            inner.state,
            DownloadState::Completed | DownloadState::Canceling
        ) {
            inner.state = DownloadState::Canceling;
            self.handle.cancel();
        }
    }

    pub(crate) fn set_state(&self, state: DownloadState) {
        self.inner.lock().expect("download lock").state = state;
    }

    pub(crate) fn update_progress(&self, f: impl FnOnce(&mut Progress)) {
        f(&mut self.inner.lock().expect("download lock").progress);
    }
}

impl PartialEq for Download {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Download {}

/// Last path segment of the URL, sanitized for the filesystem.
pub(crate) fn default_file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|s| s.last())
        .filter(|s| !s.is_empty())
        .map(sanitize_filename::sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "download.bin".to_string())
}
