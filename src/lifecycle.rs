//! Reactions to engine notifications.
//!
//! One handler runs per notification. Handlers mutate the registry only while
//! holding its lock; engine queries and upload steps happen outside it.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::decrypt::{self, DecryptJob, DecryptProgress};
use crate::engine::{DownloadEngine, EngineEvent, with_backoff};
use crate::error::DecryptError;
use crate::notify::Notifier;
use crate::record::{DownloadRecord, DownloadStatus, Location};
use crate::registry::{FolderState, Registry, UploadState};
use crate::seed::Seeder;
use crate::upload::{FolderUpload, UploadCoordinator};

pub struct LifecycleController {
    registry: Arc<Registry>,
    engine: Arc<dyn DownloadEngine>,
    uploads: UploadCoordinator,
    notifier: Arc<dyn Notifier>,
    seeder: Option<Seeder>,
    decrypt_chunk_size: usize,
    rpc_attempts: u32,
}

impl LifecycleController {
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
            seeder: None,
            decrypt_chunk_size: settings.decrypt_chunk_size(),
            rpc_attempts: settings.rpc_attempts,
        }
    }

    pub fn with_seeder(mut self, seeder: Seeder) -> Self {
        self.seeder = Some(seeder);
        self
    }

    /// Dispatches events until the channel closes. Starts are handled inline
    /// so a record is tracked before any later event for its gid runs;
    /// completions and errors get their own task.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            debug!("Engine event {event:?} [gid: '{}']", event.gid());
            if matches!(event, EngineEvent::Start(_)) {
                self.handle(event).await;
                continue;
            }
            let controller = self.clone();
            tokio::spawn(async move { controller.handle(event).await });
        }
        debug!("Engine event channel closed");
    }

    pub async fn handle(&self, event: EngineEvent) {
        match event {
            EngineEvent::Start(gid) => self.on_start(&gid).await,
            EngineEvent::Complete(gid) => self.on_complete(&gid).await,
            EngineEvent::Error(gid) => self.on_error(&gid).await,
        }
    }

    async fn query(&self, gid: &str) -> Option<DownloadRecord> {
        let engine = &self.engine;
        match with_backoff("tellStatus", self.rpc_attempts, || engine.tell_status(gid)).await {
            Ok(record) => Some(record),
            Err(e) => {
                error!("Failed to query download [gid: '{gid}']: {e}");
                None
            }
        }
    }

    async fn on_start(&self, gid: &str) {
        let Some(record) = self.query(gid).await else {
            return;
        };
        if matches!(record.status, DownloadStatus::Error | DownloadStatus::Removed) {
            debug!("Not tracking stopped download [gid: '{gid}']");
            return;
        }
        self.registry.lock().await.upsert(record);
        info!("Starting download: [gid: '{gid}']");
    }

    async fn on_complete(&self, gid: &str) {
        let Some(record) = self.query(gid).await else {
            return;
        };

        let decrypt = {
            let mut state = self.registry.lock().await;
            state.upsert(record.clone());
            if record.is_metadata_only {
                state.remove(gid);
                info!("Complete download: [gid: '{gid}'] - Metadata");
                return;
            }
            state.take_decrypt(gid)
        };

        match record.location().await {
            Location::File => self.upload_file(&record, decrypt).await,
            Location::Directory => self.upload_folder(&record).await,
            Location::Missing => {
                let mut state = self.registry.lock().await;
                state.remove(gid);
                state.retire_if_idle(self.notifier.as_ref()).await;
                warn!(
                    "Can't upload '{}', due to '{}' is not accessible",
                    record.name,
                    record.dir.display()
                );
            }
        }
        info!("Complete download: [gid: '{gid}']");

        if record.is_bittorrent
            && let Some(seeder) = self.seeder.clone()
        {
            let tag = format!("seed-{gid}");
            self.registry.tags().spawn(&tag, async move {
                if let Some(output) = seeder.seed(&record).await {
                    debug!("Seeding finished [gid: '{}']: {output}", record.gid);
                }
            });
        }
    }

    async fn upload_file(&self, record: &DownloadRecord, decrypt: Option<DecryptJob>) {
        let gid = record.gid.as_str();
        let (name, opened) = match decrypt {
            None => (record.name.clone(), self.uploads.upload_file(record).await),
            Some(job) => {
                let Some(path) = self.decrypt(record, job).await else {
                    return;
                };
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| record.name.clone());
                let opened = self.uploads.upload_path(gid, &name, &path).await;
                (name, opened)
            }
        };

        match opened {
            Ok(handle) => {
                let mut state = self.registry.lock().await;
                if !state.set_upload(gid, UploadState::File(Arc::new(Mutex::new(handle)))) {
                    info!("Dropped upload of vanished download: [gid: '{gid}']");
                }
            }
            Err(e) => {
                error!("Failed to start upload of '{name}' [gid: '{gid}']: {e}");
                self.fail(gid, &format!("`{name}`\nStatus: **Upload failed**\nError: __{e}__"))
                    .await;
            }
        }
    }

    /// Runs the decrypt relay; `None` when it was cancelled or failed.
    async fn decrypt(&self, record: &DownloadRecord, job: DecryptJob) -> Option<PathBuf> {
        let gid = record.gid.as_str();
        let progress = Arc::new(DecryptProgress::new(record.total_length));
        if !self
            .registry
            .lock()
            .await
            .set_upload(gid, UploadState::Decrypting(progress.clone()))
        {
            return None;
        }

        info!("Decrypting download: [gid: '{gid}']");
        let result = decrypt::relay(&record.path(), job, self.decrypt_chunk_size, &progress).await;
        self.registry.lock().await.take_upload(gid);

        match result {
            Ok(path) => Some(path),
            Err(DecryptError::Cancelled) => {
                info!("Aborted decrypt: [gid: '{gid}']");
                None
            }
            Err(e) => {
                error!("Failed to decrypt '{}' [gid: '{gid}']: {e}", record.name);
                self.fail(
                    gid,
                    &format!("`{}`\nStatus: **Decrypt failed**\nError: __{e}__", record.name),
                )
                .await;
                None
            }
        }
    }

    async fn upload_folder(&self, record: &DownloadRecord) {
        let gid = record.gid.as_str();
        let folder_id = match self.uploads.create_folder(&record.name).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create folder '{}' [gid: '{gid}']: {e}", record.name);
                self.fail(
                    gid,
                    &format!("`{}`\nStatus: **Upload failed**\nError: __{e}__", record.name),
                )
                .await;
                return;
            }
        };

        let sequence = Arc::new(self.uploads.upload_folder(record.path(), gid, folder_id.clone()));
        let attached = self.registry.lock().await.set_upload(
            gid,
            UploadState::Folder(FolderState {
                sequence: sequence.clone(),
                completed: 0,
                total: record.file_count,
            }),
        );
        if !attached {
            sequence.close().await;
            return;
        }

        let aborted = self.drive_folder(gid, &sequence).await;
        sequence.close().await;

        let mut state = self.registry.lock().await;
        // Nothing spawns under the gid past this point.
        let owned = state.take_upload(gid).is_some();
        self.registry.tags().forget(gid);
        if aborted {
            info!("Aborted upload folder: [gid: '{gid}']");
            return;
        }
        if state.is_cancelled(gid) || !owned {
            return;
        }
        state.remove(gid);

        let link = self.uploads.folder_link(&record.name, &folder_id);
        if state.count() == 0 {
            state.finish_context(self.notifier.as_ref(), &link).await;
        } else {
            state.reply(self.notifier.as_ref(), &link).await;
        }
    }

    /// Awaits folder items one at a time. Returns `true` when the drive was
    /// aborted by a cancellation rather than exhausted.
    async fn drive_folder(&self, gid: &str, sequence: &FolderUpload) -> bool {
        while let Some(next) = sequence.next().await {
            let task = match next {
                Ok(task) => task,
                Err(e) => {
                    warn!("Failed to create sub-folder [gid: '{gid}']: {e}");
                    continue;
                }
            };
            match task.await {
                Err(e) if e.is_cancelled() => return true,
                Err(e) => warn!("Folder item task failed [gid: '{gid}']: {e}"),
                Ok(Err(e)) => warn!("Failed to upload folder item [gid: '{gid}']: {e}"),
                Ok(Ok(file)) => {
                    debug!("Uploaded '{}' as '{}' [gid: '{gid}']", file.name, file.id);
                    if let Some(folder) = self.registry.lock().await.folder_mut(gid) {
                        folder.completed += 1;
                    }
                }
            }
        }
        sequence.is_closed()
    }

    async fn on_error(&self, gid: &str) {
        let record = self.query(gid).await;
        let mut state = self.registry.lock().await;
        if let Some(record) = record {
            let message = record.error_message.as_deref().unwrap_or("unknown error");
            warn!("[gid: '{gid}']: {message}");
            let text = format!(
                "`{}`\nStatus: **{}**\nError: __{message}__\nCode: **{}**",
                record.name,
                record.status.label(),
                record.error_code.as_deref().unwrap_or("-"),
            );
            state.reply(self.notifier.as_ref(), &text).await;
        }
        state.remove_both(gid);
        state.retire_if_idle(self.notifier.as_ref()).await;
    }

    async fn fail(&self, gid: &str, text: &str) {
        let mut state = self.registry.lock().await;
        state.reply(self.notifier.as_ref(), text).await;
        state.remove_both(gid);
        state.retire_if_idle(self.notifier.as_ref()).await;
    }
}
