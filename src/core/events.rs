use std::path::PathBuf;

use async_trait::async_trait;
use url::Url;

use crate::core::model::Download;
use crate::session::SavedFile;

/// Events delivered by the transfer layer to the coordinator.
///
/// Events are keyed by URL, not by entity: the transfer layer has no view of
/// the active set, and an event may arrive after the matching download is
/// already gone. Unmatched events are dropped by the coordinator.
#[derive(Debug)]
pub enum TaskEvent {
    /// Cumulative progress report for one task.
    BytesWritten {
        url: Url,
        total_written: u64,
        total_expected: Option<u64>,
        suggested_name: Option<String>,
    },
    /// Terminal failure, including the teardown of a cancelled task.
    Completed { url: Url, error: anyhow::Error },
    /// The whole payload has been written to a temporary location.
    Finished { url: Url, location: PathBuf },
}

/// Observer of download lifecycle outcomes.
///
/// The coordinator holds a non-owning reference to at most one delegate and
/// tolerates it being unset or dropped.
#[async_trait]
pub trait DownloaderDelegate: Send + Sync {
    async fn on_started(&self, download: &Download);
    async fn on_finished(&self, download: &Download, file: &SavedFile);
    async fn on_failed(&self, download: &Download, error: &anyhow::Error);
}
