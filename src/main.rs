mod core;
mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Notify};
use url::Url;

use crate::core::downloader::Downloader;
use crate::core::events::DownloaderDelegate;
use crate::core::model::Download;
use crate::session::http::{HttpSessionConfig, HttpTransferSession};
use crate::session::registry::TaskRegistry;
use crate::session::store::DiskFileStore;
use crate::session::{SavedFile, SchemePolicy};

fn build_cli() -> Command {
    let download = Command::new("download")
        .about("Download one or more URLs")
        .arg(
            Arg::new("urls")
                .help("URLs to download")
                .action(ArgAction::Append)
                .num_args(1..)
                .required(true),
        )
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Output directory")
                .default_value("./downloads")
                .num_args(1),
        )
        .arg(
            Arg::new("file_name")
                .long("file-name")
                .help("Target file name (single URL only)")
                .num_args(1),
        );

    let resume = Command::new("resume")
        .about("Resume unfinished downloads left over from a previous run")
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Output directory")
                .default_value("./downloads")
                .num_args(1),
        );

    Command::new("bgdl")
        .about("Background file downloader with restart recovery")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(download)
        .subcommand(resume)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("download", m)) => {
            let out_dir: PathBuf = m.get_one::<String>("out_dir").unwrap().into();
            let urls: Vec<String> = m
                .get_many::<String>("urls")
                .unwrap()
                .map(|s| s.to_string())
                .collect();
            let file_name = m.get_one::<String>("file_name").cloned();
            if file_name.is_some() && urls.len() > 1 {
                anyhow::bail!("--file-name only makes sense with a single URL");
            }

            let downloader = build_downloader(&out_dir).await?;
            let progress = MultiProgress::new();
            let delegate = Arc::new(CliDelegate::new(progress.clone()));
            let delegate_dyn: Arc<dyn DownloaderDelegate> = delegate.clone();
            downloader.set_delegate(&delegate_dyn);

            for url in &urls {
                delegate.expect_one();
                match downloader.download_file(url, file_name.clone()).await {
                    Ok(_) => {}
                    Err(error) => {
                        delegate.abandon_one();
                        let _ = progress.println(format!("skipping {}: {}", url, error));
                    }
                }
            }

            let bars = spawn_progress_bars(downloader.clone(), progress);
            delegate.wait_all().await;
            bars.abort();
        }
        Some(("resume", m)) => {
            let out_dir: PathBuf = m.get_one::<String>("out_dir").unwrap().into();

            let downloader = build_downloader(&out_dir).await?;
            let progress = MultiProgress::new();
            let delegate = Arc::new(CliDelegate::new(progress.clone()));
            let delegate_dyn: Arc<dyn DownloaderDelegate> = delegate.clone();
            downloader.set_delegate(&delegate_dyn);

            let recovered = downloader.load_unfinished_downloads().await?;
            if recovered.is_empty() {
                println!("nothing to resume");
                return Ok(());
            }
            println!("resuming {} download(s)", recovered.len());

            for download in &recovered {
                delegate.expect_one();
                download.resume();
            }

            let bars = spawn_progress_bars(downloader.clone(), progress);
            delegate.wait_all().await;
            bars.abort();
        }
        _ => {}
    }

    Ok(())
}

/// Composition root: wires the coordinator to its collaborators and starts
/// the event pump.
async fn build_downloader(out_dir: &Path) -> anyhow::Result<Downloader> {
    let partial_dir = out_dir.join(".bgdl");
    let registry = TaskRegistry::open(&partial_dir.join("tasks.sqlite")).await?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = HttpTransferSession::new(
        HttpSessionConfig {
            user_agent: format!("bgdl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            partial_dir,
        },
        registry,
        events_tx,
    )?;

    let downloader = Downloader::new(
        Arc::new(session),
        Arc::new(SchemePolicy::http()),
        Arc::new(DiskFileStore::new(out_dir)),
    );
    downloader.spawn_event_pump(events_rx);
    Ok(downloader)
}

/// Prints outcomes and tracks how many downloads are still outstanding.
struct CliDelegate {
    progress: MultiProgress,
    remaining: AtomicUsize,
    done: Notify,
}

impl CliDelegate {
    fn new(progress: MultiProgress) -> Self {
        Self {
            progress,
            remaining: AtomicUsize::new(0),
            done: Notify::new(),
        }
    }

    fn expect_one(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }

    fn abandon_one(&self) {
        self.finish_one();
    }

    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.done.notify_waiters();
        }
    }

    async fn wait_all(&self) {
        loop {
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.done.notified();
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait::async_trait]
impl DownloaderDelegate for CliDelegate {
    async fn on_started(&self, download: &Download) {
        let _ = self
            .progress
            .println(format!("downloading {}", download.url()));
    }

    async fn on_finished(&self, _download: &Download, file: &SavedFile) {
        let _ = self
            .progress
            .println(format!("saved {}", file.path.display()));
        self.finish_one();
    }

    async fn on_failed(&self, download: &Download, error: &anyhow::Error) {
        let _ = self
            .progress
            .println(format!("failed {}: {:#}", download.url(), error));
        self.finish_one();
    }
}

/// Polls the active set and mirrors it into progress bars.
fn spawn_progress_bars(
    downloader: Downloader,
    progress: MultiProgress,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sty_bar = ProgressStyle::with_template(
            "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec})",
        )
        .unwrap();
        let sty_spinner = ProgressStyle::with_template("{spinner:.green} {prefix} {bytes}")
            .unwrap()
            .tick_chars("|/-\\ ");

        let mut bars: HashMap<Url, ProgressBar> = HashMap::new();
        loop {
            let downloads = downloader.downloads().await;

            bars.retain(|url, bar| {
                let live = downloads.iter().any(|d| d.url() == url);
                if !live {
                    bar.finish_and_clear();
                }
                live
            });

            for download in &downloads {
                let bar = bars.entry(download.url().clone()).or_insert_with(|| {
                    let bar = progress.add(ProgressBar::new_spinner());
                    bar.set_style(sty_spinner.clone());
                    bar.enable_steady_tick(Duration::from_millis(120));
                    bar
                });
                bar.set_prefix(format!("[{}]", download.file_name()));

                let p = download.progress();
                if let Some(total) = p.total_bytes() {
                    if bar.length() != Some(total) {
                        bar.set_style(sty_bar.clone());
                        bar.set_length(total);
                    }
                    bar.set_position(p.bytes_received());
                } else {
                    bar.set_position(p.bytes_received());
                }
            }

            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    })
}
