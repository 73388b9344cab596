//! In-memory source of truth for downloads and their uploads.
//!
//! Every check-then-act sequence over the maps happens while holding the one
//! lock returned by [`Registry::lock`], so the progress loop never observes a
//! half-updated gid.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

use crate::decrypt::{DecryptJob, DecryptProgress};
use crate::error::NotifyError;
use crate::notify::{MessageId, Notifier};
use crate::record::DownloadRecord;
use crate::tasks::TaskTags;
use crate::upload::{FolderUpload, UploadHandle};

/// The user-facing job currently being reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveContext {
    /// Message that requested the download; results are replies to it.
    pub request: MessageId,
    /// Standing progress message, created on first emission.
    pub response: Option<MessageId>,
}

impl ActiveContext {
    pub fn new(request: MessageId) -> Self {
        Self {
            request,
            response: None,
        }
    }
}

pub struct FolderState {
    pub sequence: Arc<FolderUpload>,
    pub completed: usize,
    pub total: usize,
}

pub enum UploadState {
    File(Arc<Mutex<UploadHandle>>),
    Folder(FolderState),
    Decrypting(Arc<DecryptProgress>),
}

/// Cheap copy of an upload's state for rendering outside the lock.
pub enum UploadView {
    None,
    File(Arc<Mutex<UploadHandle>>),
    Folder { completed: usize, total: usize },
    Decrypting(Arc<DecryptProgress>),
}

#[derive(Default)]
pub struct RegistryState {
    downloads: HashMap<String, DownloadRecord>,
    uploads: HashMap<String, UploadState>,
    cancelled: HashSet<String>,
    decrypt_jobs: HashMap<String, DecryptJob>,
    context: Option<ActiveContext>,
}

impl RegistryState {
    pub fn query(&self, gid: &str) -> Option<&DownloadRecord> {
        self.downloads.get(gid)
    }

    pub fn upsert(&mut self, record: DownloadRecord) {
        self.downloads.insert(record.gid.clone(), record);
    }

    /// Replaces a record only if the gid is still tracked.
    pub fn refresh(&mut self, record: DownloadRecord) -> bool {
        match self.downloads.get_mut(&record.gid) {
            Some(current) => {
                *current = record;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, gid: &str) -> Option<DownloadRecord> {
        self.downloads.remove(gid)
    }

    /// Attaches upload state to a tracked download. Refused when the download
    /// is gone (consumed or cancelled meanwhile).
    pub fn set_upload(&mut self, gid: &str, state: UploadState) -> bool {
        if !self.downloads.contains_key(gid) {
            return false;
        }
        self.uploads.insert(gid.to_string(), state);
        true
    }

    pub fn take_upload(&mut self, gid: &str) -> Option<UploadState> {
        self.uploads.remove(gid)
    }

    pub fn has_upload(&self, gid: &str) -> bool {
        self.uploads.contains_key(gid)
    }

    pub fn folder_mut(&mut self, gid: &str) -> Option<&mut FolderState> {
        match self.uploads.get_mut(gid) {
            Some(UploadState::Folder(folder)) => Some(folder),
            _ => None,
        }
    }

    pub fn view(&self, gid: &str) -> UploadView {
        match self.uploads.get(gid) {
            None => UploadView::None,
            Some(UploadState::File(handle)) => UploadView::File(handle.clone()),
            Some(UploadState::Folder(folder)) => UploadView::Folder {
                completed: folder.completed,
                total: folder.total,
            },
            Some(UploadState::Decrypting(progress)) => UploadView::Decrypting(progress.clone()),
        }
    }

    /// Drops download and upload state for `gid` in one step.
    pub fn remove_both(&mut self, gid: &str) {
        self.uploads.remove(gid);
        self.downloads.remove(gid);
    }

    pub fn count(&self) -> usize {
        self.downloads.len()
    }

    pub fn gids(&self) -> Vec<String> {
        self.downloads.keys().cloned().collect()
    }

    pub fn records(&self) -> Vec<DownloadRecord> {
        self.downloads.values().cloned().collect()
    }

    pub fn mark_cancelled(&mut self, gid: &str) {
        self.cancelled.insert(gid.to_string());
    }

    pub fn is_cancelled(&self, gid: &str) -> bool {
        self.cancelled.contains(gid)
    }

    pub fn take_cancelled(&mut self) -> Vec<String> {
        self.cancelled.drain().collect()
    }

    pub fn flag_decrypt(&mut self, gid: &str, job: DecryptJob) {
        self.decrypt_jobs.insert(gid.to_string(), job);
    }

    pub fn take_decrypt(&mut self, gid: &str) -> Option<DecryptJob> {
        self.decrypt_jobs.remove(gid)
    }

    pub fn context(&self) -> Option<ActiveContext> {
        self.context
    }

    /// Retires the previous standing message before installing `context`.
    pub async fn install_context(&mut self, context: ActiveContext, notifier: &dyn Notifier) {
        if let Some(response) = self.context.take().and_then(|c| c.response) {
            delete_quietly(notifier, response).await;
        }
        self.context = Some(context);
    }

    /// Creates or edits the standing progress message.
    pub async fn respond(&mut self, notifier: &dyn Notifier, text: &str) -> Result<(), NotifyError> {
        let Some(context) = self.context.as_mut() else {
            return Ok(());
        };
        match context.response {
            Some(response) => notifier.edit(response, text).await,
            None => {
                context.response = Some(notifier.send(text, Some(context.request)).await?);
                Ok(())
            }
        }
    }

    /// Sends `text` as a fresh reply to the request message.
    pub async fn reply(&self, notifier: &dyn Notifier, text: &str) {
        let Some(context) = self.context else {
            debug!("No active context for reply, dropping: {text}");
            return;
        };
        if let Err(e) = notifier.send(text, Some(context.request)).await {
            error!("Failed to send reply: {e}");
        }
    }

    /// Sends the final reply, removes the standing message and clears the slot.
    pub async fn finish_context(&mut self, notifier: &dyn Notifier, text: &str) {
        self.reply(notifier, text).await;
        if let Some(response) = self.context.take().and_then(|c| c.response) {
            delete_quietly(notifier, response).await;
        }
    }

    /// Once nothing is tracked the standing message is deleted and the slot freed.
    pub async fn retire_if_idle(&mut self, notifier: &dyn Notifier) {
        if self.count() != 0 {
            return;
        }
        let Some(context) = self.context else {
            return;
        };
        if let Some(response) = context.response {
            delete_quietly(notifier, response).await;
            self.context = None;
        }
    }
}

async fn delete_quietly(notifier: &dyn Notifier, id: MessageId) {
    if let Err(e) = notifier.delete(id).await {
        debug!("Failed to delete message {id:?}: {e}");
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
    tags: TaskTags,
}

impl Registry {
    pub fn new(tags: TaskTags) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            tags,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().await
    }

    pub fn tags(&self) -> &TaskTags {
        &self.tags
    }

    pub async fn count(&self) -> usize {
        self.lock().await.count()
    }
}
