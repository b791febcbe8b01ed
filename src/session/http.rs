use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::core::events::TaskEvent;
use crate::session::registry::TaskRegistry;
use crate::session::{OrphanedTask, ResumeData, TaskControl, TaskHandle, TransferSession};

/// How many bytes may accumulate before progress is flushed to the registry.
const REGISTRY_FLUSH_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Directory holding `.partial` payloads until they are persisted.
    pub partial_dir: PathBuf,
}

/// HTTP-backed transfer session.
///
/// Every task runs as its own worker: idle until the first `Resume`, then
/// streaming the response body into a partial file while mirroring its byte
/// count into the [`TaskRegistry`]. A worker that dies mid-transfer leaves
/// its registry row and partial file behind, which is exactly the resume-data
/// that `orphaned_tasks` reports after a restart.
pub struct HttpTransferSession {
    client: reqwest::Client,
    config: HttpSessionConfig,
    registry: TaskRegistry,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl HttpTransferSession {
    pub fn new(
        config: HttpSessionConfig,
        registry: TaskRegistry,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            config,
            registry,
            events,
        })
    }

    fn spawn_task(&self, url: &Url, partial_path: PathBuf, offset: u64) -> TaskHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let worker = TaskWorker {
            client: self.client.clone(),
            user_agent: self.config.user_agent.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            url: url.clone(),
            partial_path,
            offset,
            control_closed: false,
        };
        tokio::spawn(worker.run(control_rx));
        TaskHandle::new(Uuid::new_v4(), control_tx)
    }
}

#[async_trait]
impl TransferSession for HttpTransferSession {
    fn start(&self, url: &Url) -> TaskHandle {
        let partial_path = self
            .config
            .partial_dir
            .join(format!("{}.partial", Uuid::new_v4()));
        self.spawn_task(url, partial_path, 0)
    }

    fn resume(&self, url: &Url, resume: ResumeData) -> TaskHandle {
        self.spawn_task(url, resume.partial_path, resume.bytes_received)
    }

    async fn orphaned_tasks(&self) -> anyhow::Result<Vec<OrphanedTask>> {
        let mut orphans = Vec::new();
        for record in self.registry.list_tasks().await? {
            let url = match Url::parse(&record.source_url) {
                Ok(url) => url,
                Err(error) => {
                    tracing::warn!(url = %record.source_url, %error, "skipping orphan with unparseable URL");
                    continue;
                }
            };
            // The partial file is the authoritative resume offset; a row
            // whose payload is gone cannot be continued.
            let bytes_received = match tokio::fs::metadata(&record.partial_path).await {
                Ok(meta) => meta.len(),
                Err(_) => {
                    tracing::warn!(url = %url, path = %record.partial_path.display(), "skipping orphan with missing partial file");
                    continue;
                }
            };
            orphans.push(OrphanedTask {
                url,
                resume: ResumeData {
                    partial_path: record.partial_path,
                    bytes_received,
                },
            });
        }
        Ok(orphans)
    }
}

enum StreamOutcome {
    Finished,
    Suspended,
    Canceled,
    Failed(anyhow::Error),
}

struct TaskWorker {
    client: reqwest::Client,
    user_agent: String,
    registry: TaskRegistry,
    events: mpsc::UnboundedSender<TaskEvent>,
    url: Url,
    partial_path: PathBuf,
    offset: u64,
    control_closed: bool,
}

impl TaskWorker {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<TaskControl>) {
        loop {
            // Idle until told to start. A task whose every handle is gone
            // before it ever ran can never be resumed, so tear it down.
            match control.recv().await {
                Some(TaskControl::Resume) => {}
                Some(TaskControl::Suspend) => continue,
                Some(TaskControl::Cancel) | None => {
                    self.teardown_canceled().await;
                    return;
                }
            }

            match self.stream_once(&mut control).await {
                StreamOutcome::Finished => {
                    if let Err(error) = self.registry.remove_task(self.url.as_str()).await {
                        tracing::warn!(url = %self.url, %error, "failed to clear finished task from registry");
                    }
                    let _ = self.events.send(TaskEvent::Finished {
                        url: self.url.clone(),
                        location: self.partial_path.clone(),
                    });
                    return;
                }
                StreamOutcome::Suspended => continue,
                StreamOutcome::Canceled => {
                    self.teardown_canceled().await;
                    return;
                }
                StreamOutcome::Failed(error) => {
                    // Registry row and partial file stay behind as resume-data.
                    tracing::debug!(url = %self.url, %error, "transfer task failed");
                    let _ = self.events.send(TaskEvent::Completed {
                        url: self.url.clone(),
                        error,
                    });
                    return;
                }
            }
        }
    }

    /// One attempt at streaming the remainder of the payload, interruptible
    /// by control commands.
    async fn stream_once(&mut self, control: &mut mpsc::UnboundedReceiver<TaskControl>) -> StreamOutcome {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(USER_AGENT, self.user_agent.clone());
        if self.offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", self.offset));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => return StreamOutcome::Failed(error.into()),
        };

        let status = response.status();
        if self.offset > 0 && status == StatusCode::OK {
            // Server ignored the range request; start over from zero.
            self.offset = 0;
        }
        if !status.is_success() {
            return StreamOutcome::Failed(anyhow!("http status {status}"));
        }

        let total_expected = content_length(&response).map(|len| len + self.offset);
        let suggested_name = suggested_file_name(&response);

        let mut file = match self.open_partial().await {
            Ok(file) => file,
            Err(error) => return StreamOutcome::Failed(error),
        };

        if let Err(error) = self
            .registry
            .upsert_task(self.url.as_str(), &self.partial_path)
            .await
        {
            // The transfer itself can proceed; only resumability is lost.
            tracing::warn!(url = %self.url, %error, "failed to register task");
        }

        let mut stream = response.bytes_stream();
        let mut unflushed = 0u64;

        loop {
            tokio::select! {
                biased;
                cmd = control.recv(), if !self.control_closed => {
                    match cmd {
                        Some(TaskControl::Suspend) => {
                            let _ = file.flush().await;
                            self.flush_registry().await;
                            return StreamOutcome::Suspended;
                        }
                        Some(TaskControl::Cancel) => return StreamOutcome::Canceled,
                        Some(TaskControl::Resume) => {} // already running
                        None => self.control_closed = true, // no handles left; finish in the background
                    }
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            if let Err(error) = file.write_all(&bytes).await {
                                return StreamOutcome::Failed(error.into());
                            }
                            self.offset += bytes.len() as u64;
                            unflushed += bytes.len() as u64;
                            if unflushed >= REGISTRY_FLUSH_BYTES {
                                self.flush_registry().await;
                                unflushed = 0;
                            }
                            let _ = self.events.send(TaskEvent::BytesWritten {
                                url: self.url.clone(),
                                total_written: self.offset,
                                total_expected,
                                suggested_name: suggested_name.clone(),
                            });
                        }
                        Some(Err(error)) => {
                            let _ = file.flush().await;
                            self.flush_registry().await;
                            return StreamOutcome::Failed(error.into());
                        }
                        None => {
                            if let Err(error) = file.flush().await {
                                return StreamOutcome::Failed(error.into());
                            }
                            self.flush_registry().await;
                            return StreamOutcome::Finished;
                        }
                    }
                }
            }
        }
    }

    async fn open_partial(&self) -> anyhow::Result<tokio::fs::File> {
        if let Some(parent) = self.partial_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = if self.offset == 0 {
            tokio::fs::File::create(&self.partial_path).await
        } else {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&self.partial_path)
                .await
        }
        .with_context(|| format!("open {}", self.partial_path.display()))?;
        Ok(file)
    }

    async fn flush_registry(&self) {
        if let Err(error) = self
            .registry
            .set_bytes_received(self.url.as_str(), self.offset as i64)
            .await
        {
            tracing::warn!(url = %self.url, %error, "failed to record progress");
        }
    }

    async fn teardown_canceled(&self) {
        if let Err(error) = self.registry.remove_task(self.url.as_str()).await {
            tracing::warn!(url = %self.url, %error, "failed to clear canceled task from registry");
        }
        let _ = tokio::fs::remove_file(&self.partial_path).await;
        let _ = self.events.send(TaskEvent::Completed {
            url: self.url.clone(),
            error: anyhow!("download canceled"),
        });
    }
}

fn content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

fn suggested_file_name(response: &reqwest::Response) -> Option<String> {
    let value = response.headers().get(CONTENT_DISPOSITION)?.to_str().ok()?;
    file_name_from_disposition(value)
}

fn file_name_from_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if part.to_ascii_lowercase().starts_with("filename=") {
            let raw = part["filename=".len()..].trim().trim_matches('"');
            if raw.is_empty() {
                continue;
            }
            let name = sanitize_filename::sanitize(raw);
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}
