//! The periodic progress loop.
//!
//! Each tick unwinds pending cancellations, re-queries every tracked download,
//! renders one block per gid and pushes the result to the active message no
//! more often than the configured interval.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::decrypt::DecryptProgress;
use crate::engine::DownloadEngine;
use crate::error::NotifyError;
use crate::format::{bar, duration, human_bytes, human_speed, percent};
use crate::notify::Notifier;
use crate::record::{DownloadRecord, DownloadStatus};
use crate::registry::{Registry, UploadState, UploadView};
use crate::upload::{ChunkProgress, ChunkStep, UploadCoordinator, UploadHandle};

pub struct ProgressReporter {
    registry: Arc<Registry>,
    engine: Arc<dyn DownloadEngine>,
    uploads: UploadCoordinator,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    tick_interval: Duration,
    stop: CancellationToken,
    last_emit: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn DownloadEngine>,
        uploads: UploadCoordinator,
        notifier: Arc<dyn Notifier>,
        settings: &Settings,
    ) -> Self {
        Self {
            registry,
            engine,
            uploads,
            notifier,
            interval: settings.progress_interval(),
            tick_interval: settings.tick(),
            stop: CancellationToken::new(),
            last_emit: None,
        }
    }

    /// Cancelling the returned token ends [`ProgressReporter::run`].
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn run(mut self) {
        info!("Progress loop started");
        while !self.stop.is_cancelled() {
            self.tick().await;
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }
        info!("Progress loop stopped");
    }

    pub async fn tick(&mut self) {
        self.unwind().await;
        let text = self.check_progress().await;
        self.emit(&text).await;
    }

    /// Tears down every gid marked cancelled since the last tick.
    pub async fn unwind(&self) {
        let mut state = self.registry.lock().await;
        let cancelled = state.take_cancelled();
        if cancelled.is_empty() {
            return;
        }

        for gid in cancelled {
            if state.remove(&gid).is_some() {
                info!("Aborted download: [gid: '{gid}']");
            }
            state.take_decrypt(&gid);
            match state.take_upload(&gid) {
                Some(UploadState::File(_)) => info!("Aborted upload file: [gid: '{gid}']"),
                Some(UploadState::Folder(folder)) => {
                    let running = self.registry.tags().abort(&gid);
                    folder.sequence.close().await;
                    info!("Aborted upload folder: [gid: '{gid}'], {running} item(s) in flight");
                }
                Some(UploadState::Decrypting(progress)) => {
                    progress.cancel();
                    info!("Aborted decrypt: [gid: '{gid}']");
                }
                None => {}
            }
        }
        state.retire_if_idle(self.notifier.as_ref()).await;
    }

    /// Renders the status of every tracked download. Gids are snapshotted
    /// under the lock; ones removed meanwhile are skipped.
    pub async fn check_progress(&self) -> String {
        let mut gids = self.registry.lock().await.gids();
        gids.sort();

        let mut out = String::new();
        for gid in gids {
            let record = match self.engine.tell_status(&gid).await {
                Ok(record) => record,
                Err(e) => {
                    debug!("Skipping progress of [gid: '{gid}'] this tick: {e}");
                    continue;
                }
            };
            let view = {
                let mut state = self.registry.lock().await;
                if !state.refresh(record.clone()) {
                    continue;
                }
                state.view(&gid)
            };

            if matches!(
                record.status,
                DownloadStatus::Error | DownloadStatus::Paused | DownloadStatus::Removed
            ) || (record.is_complete() && record.is_metadata_only)
            {
                continue;
            }

            if !record.is_complete() {
                out.push_str(&download_block(&record));
                continue;
            }
            match view {
                UploadView::Folder { completed, total } => {
                    out.push_str(&folder_block(&record, completed, total))
                }
                UploadView::File(handle) => {
                    if let Some(block) = self.upload_progress(&handle).await {
                        out.push_str(&block);
                    }
                }
                UploadView::Decrypting(progress) => out.push_str(&decrypt_block(&record, &progress)),
                UploadView::None => {}
            }
        }
        out
    }

    /// Advances a file upload by one chunk. Returns its block while in flight;
    /// on the final chunk posts the link and drops the gid.
    async fn upload_progress(&self, handle: &Mutex<UploadHandle>) -> Option<String> {
        let mut upload = handle.lock().await;
        let file = match self.uploads.step_chunk(&mut upload).await {
            Ok(ChunkStep::Partial(progress)) => return Some(upload_block(&upload, progress)),
            Ok(ChunkStep::Done(file)) => file,
            Err(e) => {
                error!("Upload of '{}' stalled, retrying next tick: {e}", upload.name);
                return None;
            }
        };
        let gid = upload.gid.clone();
        drop(upload);

        let mut state = self.registry.lock().await;
        if !state.has_upload(&gid) {
            return None;
        }
        state.reply(self.notifier.as_ref(), &self.uploads.file_link(&file)).await;
        state.remove_both(&gid);
        state.retire_if_idle(self.notifier.as_ref()).await;
        info!("Complete upload: [gid: '{gid}'] as '{}'", file.id);
        None
    }

    /// Pushes `text` to the active message when due. Returns whether it counted
    /// as an emission.
    pub async fn emit(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let now = Instant::now();
        if self
            .last_emit
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return false;
        }

        let result = {
            let mut state = self.registry.lock().await;
            if state.context().is_none() {
                return false;
            }
            state.respond(self.notifier.as_ref(), text).await
        };
        match result {
            Ok(()) | Err(NotifyError::NotModified) => {
                self.last_emit = Some(now);
                true
            }
            Err(NotifyError::FloodWait(wait)) => {
                warn!("Progress update rate limited, waiting {wait:?}");
                tokio::time::sleep(wait).await;
                false
            }
            Err(e) => {
                error!("Error on progress update: {e}");
                self.last_emit = Some(now);
                false
            }
        }
    }
}

fn header(record: &DownloadRecord) -> String {
    format!("`{}`\nGID: `{}`\n", record.name, record.gid)
}

fn download_block(record: &DownloadRecord) -> String {
    let fraction = record.progress();
    format!(
        "{}Status: **{}**\nProgress: [{}] {}%\n__{} of {} @ {}\neta - {}__\n\n",
        header(record),
        record.status.label(),
        bar(fraction),
        percent(fraction),
        human_bytes(record.completed_length),
        human_bytes(record.total_length),
        human_speed(record.download_speed),
        duration(record.eta()),
    )
}

fn folder_block(record: &DownloadRecord, completed: usize, total: usize) -> String {
    let fraction = if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64
    };
    format!(
        "{}__ComputingFolder: [{completed}/{total}] {}%__\n\n",
        header(record),
        percent(fraction)
    )
}

fn decrypt_block(record: &DownloadRecord, progress: &DecryptProgress) -> String {
    let written = progress.written();
    let fraction = if progress.total == 0 {
        0.0
    } else {
        written as f64 / progress.total as f64
    };
    format!(
        "{}Status: **Decrypting**\n__{} of {} {}%__\n\n",
        header(record),
        human_bytes(written),
        human_bytes(progress.total),
        percent(fraction)
    )
}

fn upload_block(upload: &UploadHandle, progress: ChunkProgress) -> String {
    let uploaded = progress.resumable_progress;
    let total = progress.total_size;
    let elapsed = upload.started.elapsed().as_secs_f64().max(0.001);
    let speed = (uploaded as f64 / elapsed) as u64;
    let eta = (speed > 0).then(|| Duration::from_secs(total.saturating_sub(uploaded) / speed));
    let fraction = if total == 0 {
        0.0
    } else {
        uploaded as f64 / total as f64
    };
    format!(
        "`{}`\nGID: `{}`\nStatus: **Uploading**\nProgress: [{}] {}%\n__{} of {} @ {}\neta - {}__\n\n",
        upload.name,
        upload.gid,
        bar(fraction),
        percent(fraction),
        human_bytes(uploaded),
        human_bytes(total),
        human_speed(speed),
        duration(eta),
    )
}
