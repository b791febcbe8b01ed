use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use url::Url;

use crate::core::error::DownloadError;
use crate::core::events::{DownloaderDelegate, TaskEvent};
use crate::core::model::{Download, DownloadState};
use crate::session::{FileStore, TransferSession, UrlPolicy};

/// The download session coordinator.
///
/// Owns the process-local active set: an insertion-ordered list of in-flight
/// downloads, deduplicated by URL. The set is only a cache — the transfer
/// session's durable registry is what survives restarts, and
/// [`load_unfinished_downloads`](Self::load_unfinished_downloads) rebuilds
/// the set on top of it.
///
/// Cheap to clone; clones share the same active set and delegate.
#[derive(Clone)]
pub struct Downloader {
    session: Arc<dyn TransferSession>,
    policy: Arc<dyn UrlPolicy>,
    file_store: Arc<dyn FileStore>,
    downloads: Arc<Mutex<Vec<Download>>>,
    delegate: Arc<RwLock<Option<Weak<dyn DownloaderDelegate>>>>,
}

impl Downloader {
    pub fn new(
        session: Arc<dyn TransferSession>,
        policy: Arc<dyn UrlPolicy>,
        file_store: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            session,
            policy,
            file_store,
            downloads: Arc::new(Mutex::new(Vec::new())),
            delegate: Arc::new(RwLock::new(None)),
        }
    }

    /// Registers the observer for lifecycle notifications. The reference is
    /// non-owning; a dropped delegate simply stops receiving events.
    pub fn set_delegate(&self, delegate: &Arc<dyn DownloaderDelegate>) {
        *self.delegate.write().expect("delegate lock") = Some(Arc::downgrade(delegate));
    }

    fn delegate(&self) -> Option<Arc<dyn DownloaderDelegate>> {
        self.delegate
            .read()
            .expect("delegate lock")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Starts downloading `url`, optionally under a caller-chosen file name.
    ///
    /// Fails fast with [`DownloadError::AlreadyInProgress`] when the URL is
    /// already active, and never blocks: the returned entity has been
    /// appended to the active set and its transfer kicked off asynchronously.
    pub async fn download_file(
        &self,
        url: &str,
        file_name: Option<String>,
    ) -> Result<Download, DownloadError> {
        let url = Url::parse(url)?;
        if !self.policy.can_open(&url) {
            return Err(DownloadError::UnsupportedUrl(url.scheme().to_string()));
        }

        let download = {
            // Existence check and insertion under one lock, so two racing
            // requests for the same URL cannot both get in.
            let mut downloads = self.downloads.lock().await;
            if downloads.iter().any(|d| d.url() == &url) {
                return Err(DownloadError::AlreadyInProgress);
            }
            let handle = self.session.start(&url);
            let download = Download::new(url, handle, file_name);
            downloads.push(download.clone());
            download
        };

        download.resume();
        tracing::info!(url = %download.url(), "download started");
        if let Some(delegate) = self.delegate() {
            delegate.on_started(&download).await;
        }
        Ok(download)
    }

    /// Rebuilds active-set entries for tasks the transfer layer still knows
    /// about but no in-memory download tracks. Recovered downloads come back
    /// waiting; callers decide when to resume them.
    pub async fn load_unfinished_downloads(&self) -> anyhow::Result<Vec<Download>> {
        let orphans = self.session.orphaned_tasks().await?;

        let mut recovered = Vec::new();
        let mut downloads = self.downloads.lock().await;
        for orphan in orphans {
            if downloads.iter().any(|d| d.url() == &orphan.url) {
                continue;
            }
            let handle = self.session.resume(&orphan.url, orphan.resume.clone());
            let download = Download::recovered(orphan.url, handle, orphan.resume.bytes_received);
            downloads.push(download.clone());
            recovered.push(download);
        }
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "recovered unfinished downloads");
        }
        Ok(recovered)
    }

    /// Snapshot of the active set, in insertion order.
    pub async fn downloads(&self) -> Vec<Download> {
        self.downloads.lock().await.clone()
    }

    /// Drains transfer-layer events into the reconciliation handlers.
    pub fn spawn_event_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<TaskEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let downloader = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                downloader.handle_event(event).await;
            }
        })
    }

    pub(crate) async fn handle_event(&self, event: TaskEvent) {
        match event {
            TaskEvent::BytesWritten {
                url,
                total_written,
                total_expected,
                suggested_name,
            } => {
                self.bytes_written(url, total_written, total_expected, suggested_name)
                    .await;
            }
            TaskEvent::Completed { url, error } => self.task_completed(url, error).await,
            TaskEvent::Finished { url, location } => self.task_finished(url, location).await,
        }
    }

    async fn bytes_written(
        &self,
        url: Url,
        total_written: u64,
        total_expected: Option<u64>,
        suggested_name: Option<String>,
    ) {
        let Some(download) = self.find(&url).await else {
            return; // stale event, already cleaned up
        };

        if let Some(name) = suggested_name {
            download.adopt_suggested_name(&name);
        }

        // Bytes arriving for a download we never saw transition means the
        // start event got lost somewhere; heal the state rather than drop
        // the progress.
        if matches!(
            download.state(),
            DownloadState::Waiting | DownloadState::Suspended
        ) {
            download.set_state(DownloadState::Running);
        }

        download.update_progress(|progress| {
            if progress.is_initial() {
                if let Some(total) = total_expected {
                    progress.latch_total(total);
                }
            }
            progress.set_bytes_received(total_written);
        });
    }

    async fn task_completed(&self, url: Url, error: anyhow::Error) {
        let Some(download) = self.find(&url).await else {
            return;
        };

        match download.state() {
            // Expected teardown of a cancelled task.
            DownloadState::Canceling => {
                tracing::debug!(url = %url, "canceled download removed");
                self.remove(&url).await;
            }
            DownloadState::Running => {
                tracing::warn!(url = %url, %error, "download failed");
                self.remove(&url).await;
                if let Some(delegate) = self.delegate() {
                    delegate.on_failed(&download, &error).await;
                }
            }
            // Stale or already-handled terminal event.
            _ => {}
        }
    }

    async fn task_finished(&self, url: Url, location: std::path::PathBuf) {
        let Some(download) = self.find(&url).await else {
            return;
        };

        download.set_state(DownloadState::Completed);
        self.remove(&url).await;

        // Ownership moves to the file store from here.
        let file_name = download.file_name();
        match self.file_store.save(&location, &file_name).await {
            Ok(file) => {
                tracing::info!(url = %url, path = %file.path.display(), "download finished");
                if let Some(delegate) = self.delegate() {
                    delegate.on_finished(&download, &file).await;
                }
            }
            Err(error) => {
                tracing::warn!(url = %url, %error, "failed to persist download");
                if let Some(delegate) = self.delegate() {
                    delegate.on_failed(&download, &error).await;
                }
            }
        }
    }

    async fn find(&self, url: &Url) -> Option<Download> {
        self.downloads
            .lock()
            .await
            .iter()
            .find(|d| d.url() == url)
            .cloned()
    }

    /// Removing an entry that is already gone is tolerated; terminal events
    /// can race with cleanup done by another path.
    async fn remove(&self, url: &Url) {
        let mut downloads = self.downloads.lock().await;
        if let Some(index) = downloads.iter().position(|d| d.url() == url) {
            downloads.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        OrphanedTask, ResumeData, SavedFile, SchemePolicy, TaskHandle,
    };
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct MockSession {
        started: StdMutex<Vec<Url>>,
        resumed: StdMutex<Vec<Url>>,
        orphans: StdMutex<Vec<OrphanedTask>>,
        // Receivers kept alive so handle commands are deliverable.
        controls: StdMutex<Vec<mpsc::UnboundedReceiver<crate::session::TaskControl>>>,
    }

    impl MockSession {
        fn with_orphans(orphans: Vec<OrphanedTask>) -> Self {
            Self {
                orphans: StdMutex::new(orphans),
                ..Self::default()
            }
        }

        fn handle(&self) -> TaskHandle {
            let (tx, rx) = mpsc::unbounded_channel();
            self.controls.lock().unwrap().push(rx);
            TaskHandle::new(Uuid::new_v4(), tx)
        }

        fn started_count(&self) -> usize {
            self.started.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TransferSession for MockSession {
        fn start(&self, url: &Url) -> TaskHandle {
            self.started.lock().unwrap().push(url.clone());
            self.handle()
        }

        fn resume(&self, url: &Url, _resume: ResumeData) -> TaskHandle {
            self.resumed.lock().unwrap().push(url.clone());
            self.handle()
        }

        async fn orphaned_tasks(&self) -> anyhow::Result<Vec<OrphanedTask>> {
            Ok(self.orphans.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct MockFileStore {
        saves: StdMutex<Vec<(PathBuf, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl FileStore for MockFileStore {
        async fn save(&self, location: &Path, file_name: &str) -> anyhow::Result<SavedFile> {
            self.saves
                .lock()
                .unwrap()
                .push((location.to_path_buf(), file_name.to_string()));
            if self.fail {
                anyhow::bail!("disk full");
            }
            Ok(SavedFile {
                path: PathBuf::from("/saved").join(file_name),
                file_name: file_name.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingDelegate {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DownloaderDelegate for RecordingDelegate {
        async fn on_started(&self, download: &Download) {
            self.events
                .lock()
                .unwrap()
                .push(format!("started:{}", download.url()));
        }

        async fn on_finished(&self, download: &Download, file: &SavedFile) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finished:{}:{}", download.url(), file.file_name));
        }

        async fn on_failed(&self, download: &Download, error: &anyhow::Error) {
            self.events
                .lock()
                .unwrap()
                .push(format!("failed:{}:{}", download.url(), error));
        }
    }

    struct Harness {
        downloader: Downloader,
        session: Arc<MockSession>,
        file_store: Arc<MockFileStore>,
        delegate: Arc<RecordingDelegate>,
        // Keeps the weak delegate reference alive for the test's duration.
        _delegate_dyn: Arc<dyn DownloaderDelegate>,
    }

    fn harness_with(session: MockSession, file_store: MockFileStore) -> Harness {
        let session = Arc::new(session);
        let file_store = Arc::new(file_store);
        let delegate = Arc::new(RecordingDelegate::default());
        let delegate_dyn: Arc<dyn DownloaderDelegate> = delegate.clone();

        let downloader = Downloader::new(
            session.clone(),
            Arc::new(SchemePolicy::http()),
            file_store.clone(),
        );
        downloader.set_delegate(&delegate_dyn);

        Harness {
            downloader,
            session,
            file_store,
            delegate,
            _delegate_dyn: delegate_dyn,
        }
    }

    fn harness() -> Harness {
        harness_with(MockSession::default(), MockFileStore::default())
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn second_request_for_same_url_is_rejected() {
        let h = harness();

        let first = h.downloader.download_file("https://x/a.zip", None).await;
        assert!(first.is_ok());

        let second = h.downloader.download_file("https://x/a.zip", None).await;
        assert!(matches!(second, Err(DownloadError::AlreadyInProgress)));

        assert_eq!(h.downloader.downloads().await.len(), 1);
        assert_eq!(h.session.started_count(), 1);
    }

    #[tokio::test]
    async fn malformed_url_is_rejected_before_the_policy_check() {
        let h = harness();
        let result = h.downloader.download_file("not a url", None).await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl(_))));
        assert!(h.downloader.downloads().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let h = harness();
        let result = h.downloader.download_file("ftp://x/a.zip", None).await;
        assert!(matches!(result, Err(DownloadError::UnsupportedUrl(_))));
        assert_eq!(h.session.started_count(), 0);
    }

    #[tokio::test]
    async fn successful_start_runs_and_notifies() {
        let h = harness();
        let download = h
            .downloader
            .download_file("https://x/a.zip", None)
            .await
            .unwrap();

        assert_eq!(download.state(), DownloadState::Running);
        assert_eq!(h.delegate.events(), vec!["started:https://x/a.zip"]);
    }

    #[tokio::test]
    async fn canceling_download_is_removed_without_failure_notification() {
        let h = harness();
        let download = h
            .downloader
            .download_file("https://x/a.zip", None)
            .await
            .unwrap();
        download.cancel();
        assert_eq!(download.state(), DownloadState::Canceling);

        h.downloader
            .handle_event(TaskEvent::Completed {
                url: url("https://x/a.zip"),
                error: anyhow!("download canceled"),
            })
            .await;

        assert!(h.downloader.downloads().await.is_empty());
        assert_eq!(h.delegate.events(), vec!["started:https://x/a.zip"]);
    }

    #[tokio::test]
    async fn running_download_error_emits_exactly_one_failure() {
        let h = harness();
        h.downloader
            .download_file("https://x/a.zip", None)
            .await
            .unwrap();

        h.downloader
            .handle_event(TaskEvent::Completed {
                url: url("https://x/a.zip"),
                error: anyhow!("connection reset"),
            })
            .await;
        // Duplicate terminal event must be a no-op.
        h.downloader
            .handle_event(TaskEvent::Completed {
                url: url("https://x/a.zip"),
                error: anyhow!("connection reset"),
            })
            .await;

        assert!(h.downloader.downloads().await.is_empty());
        assert_eq!(
            h.delegate.events(),
            vec![
                "started:https://x/a.zip",
                "failed:https://x/a.zip:connection reset"
            ]
        );
    }

    #[tokio::test]
    async fn terminal_event_in_other_states_is_ignored() {
        let h = harness();
        let download = h
            .downloader
            .download_file("https://x/a.zip", None)
            .await
            .unwrap();
        download.pause();

        h.downloader
            .handle_event(TaskEvent::Completed {
                url: url("https://x/a.zip"),
                error: anyhow!("connection reset"),
            })
            .await;

        // A suspended download is neither canceling nor running; keep it.
        assert_eq!(h.downloader.downloads().await.len(), 1);
        assert_eq!(h.delegate.events(), vec!["started:https://x/a.zip"]);
    }

    #[tokio::test]
    async fn progress_total_latches_on_first_report_only() {
        let h = harness();
        let download = h
            .downloader
            .download_file("https://x/a.zip", None)
            .await
            .unwrap();

        h.downloader
            .handle_event(TaskEvent::BytesWritten {
                url: url("https://x/a.zip"),
                total_written: 100,
                total_expected: Some(1000),
                suggested_name: None,
            })
            .await;
        h.downloader
            .handle_event(TaskEvent::BytesWritten {
                url: url("https://x/a.zip"),
                total_written: 200,
                total_expected: Some(2000),
                suggested_name: None,
            })
            .await;

        let progress = download.progress();
        assert_eq!(progress.total_bytes(), Some(1000));
        assert_eq!(progress.bytes_received(), 200);
    }

    #[tokio::test]
    async fn progress_event_without_matching_download_is_a_noop() {
        let h = harness();
        h.downloader
            .download_file("https://x/a.zip", None)
            .await
            .unwrap();

        h.downloader
            .handle_event(TaskEvent::BytesWritten {
                url: url("https://x/other.zip"),
                total_written: 100,
                total_expected: Some(1000),
                suggested_name: None,
            })
            .await;

        let downloads = h.downloader.downloads().await;
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].progress().bytes_received(), 0);
    }

    #[tokio::test]
    async fn bytes_heal_a_download_stuck_in_waiting() {
        let session = MockSession::with_orphans(vec![OrphanedTask {
            url: url("https://x/b.zip"),
            resume: ResumeData {
                partial_path: PathBuf::from("/tmp/b.partial"),
                bytes_received: 10,
            },
        }]);
        let h = harness_with(session, MockFileStore::default());

        let recovered = h.downloader.load_unfinished_downloads().await.unwrap();
        assert_eq!(recovered[0].state(), DownloadState::Waiting);

        h.downloader
            .handle_event(TaskEvent::BytesWritten {
                url: url("https://x/b.zip"),
                total_written: 20,
                total_expected: None,
                suggested_name: None,
            })
            .await;

        assert_eq!(recovered[0].state(), DownloadState::Running);
        assert_eq!(recovered[0].progress().bytes_received(), 20);
    }

    #[tokio::test]
    async fn suggested_name_respects_caller_choice() {
        let h = harness();
        let unnamed = h
            .downloader
            .download_file("https://x/a.zip", None)
            .await
            .unwrap();
        let named = h
            .downloader
            .download_file("https://x/b.zip", Some("mine.zip".to_string()))
            .await
            .unwrap();

        for target in ["https://x/a.zip", "https://x/b.zip"] {
            h.downloader
                .handle_event(TaskEvent::BytesWritten {
                    url: url(target),
                    total_written: 1,
                    total_expected: None,
                    suggested_name: Some("server.zip".to_string()),
                })
                .await;
        }

        assert_eq!(unnamed.file_name(), "server.zip");
        assert_eq!(named.file_name(), "mine.zip");
    }

    #[tokio::test]
    async fn finished_download_is_persisted_exactly_once() {
        let h = harness();
        h.downloader
            .download_file("https://x/c.zip", None)
            .await
            .unwrap();

        h.downloader
            .handle_event(TaskEvent::Finished {
                url: url("https://x/c.zip"),
                location: PathBuf::from("/tmp/c.partial"),
            })
            .await;

        assert!(h.downloader.downloads().await.is_empty());
        let saves = h.file_store.saves.lock().unwrap().clone();
        assert_eq!(saves, vec![(PathBuf::from("/tmp/c.partial"), "c.zip".to_string())]);
        assert_eq!(
            h.delegate.events(),
            vec!["started:https://x/c.zip", "finished:https://x/c.zip:c.zip"]
        );
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_as_download_failure() {
        let h = harness_with(
            MockSession::default(),
            MockFileStore {
                fail: true,
                ..MockFileStore::default()
            },
        );
        h.downloader
            .download_file("https://x/c.zip", None)
            .await
            .unwrap();

        h.downloader
            .handle_event(TaskEvent::Finished {
                url: url("https://x/c.zip"),
                location: PathBuf::from("/tmp/c.partial"),
            })
            .await;

        assert!(h.downloader.downloads().await.is_empty());
        assert_eq!(
            h.delegate.events(),
            vec!["started:https://x/c.zip", "failed:https://x/c.zip:disk full"]
        );
    }

    #[tokio::test]
    async fn orphans_are_recovered_into_the_active_set() {
        let session = MockSession::with_orphans(vec![OrphanedTask {
            url: url("https://x/b.zip"),
            resume: ResumeData {
                partial_path: PathBuf::from("/tmp/b.partial"),
                bytes_received: 4096,
            },
        }]);
        let h = harness_with(session, MockFileStore::default());

        let recovered = h.downloader.load_unfinished_downloads().await.unwrap();
        assert_eq!(recovered.len(), 1);

        let downloads = h.downloader.downloads().await;
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].url().as_str(), "https://x/b.zip");
        assert_eq!(downloads[0].state(), DownloadState::Waiting);
        assert_eq!(downloads[0].progress().bytes_received(), 4096);
        assert_eq!(h.session.resumed.lock().unwrap().len(), 1);

        // Already-tracked URLs are not recovered twice.
        let again = h.downloader.load_unfinished_downloads().await.unwrap();
        assert!(again.is_empty());
        assert_eq!(h.downloader.downloads().await.len(), 1);
    }

    #[tokio::test]
    async fn dropped_delegate_is_tolerated() {
        let session = Arc::new(MockSession::default());
        let downloader = Downloader::new(
            session,
            Arc::new(SchemePolicy::http()),
            Arc::new(MockFileStore::default()),
        );

        {
            let delegate: Arc<dyn DownloaderDelegate> =
                Arc::new(RecordingDelegate::default());
            downloader.set_delegate(&delegate);
        }

        // Delegate is gone; notifications must be dropped, not panic.
        downloader.download_file("https://x/a.zip", None).await.unwrap();
        downloader
            .handle_event(TaskEvent::Completed {
                url: url("https://x/a.zip"),
                error: anyhow!("connection reset"),
            })
            .await;
        assert!(downloader.downloads().await.is_empty());
    }
}
