//! Upload pipeline the finished downloads are handed to.

pub mod gdrive;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::UploadError;
use crate::format::{human_bytes, index_url};
use crate::record::DownloadRecord;
use crate::tasks::TaskTags;

pub use gdrive::DriveBackend;

const RETRY_BASE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub resumable_progress: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStep {
    Partial(ChunkProgress),
    Done(UploadedFile),
}

/// Backend-side resumable upload state.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub name: String,
    pub path: PathBuf,
    /// Opaque resumable session locator.
    pub location: String,
    pub offset: u64,
    pub total_size: u64,
}

#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, UploadError>;

    async fn open_session(
        &self,
        path: &Path,
        name: &str,
        parent: Option<&str>,
    ) -> Result<UploadSession, UploadError>;

    /// Sends the next chunk. Returns the final result once the last byte is accepted.
    async fn next_chunk(&self, session: &mut UploadSession) -> Result<ChunkStep, UploadError>;

    fn folder_url(&self, folder_id: &str) -> String;
}

/// A single-file upload in flight.
#[derive(Debug)]
pub struct UploadHandle {
    pub gid: String,
    pub name: String,
    pub started: Instant,
    session: UploadSession,
}

pub type FolderTask = JoinHandle<Result<UploadedFile, UploadError>>;

#[derive(Clone)]
pub struct UploadCoordinator {
    backend: Arc<dyn UploadBackend>,
    tags: TaskTags,
    parent_id: Option<String>,
    index_link: Option<String>,
    attempts: u32,
}

impl UploadCoordinator {
    pub fn new(
        backend: Arc<dyn UploadBackend>,
        tags: TaskTags,
        parent_id: Option<String>,
        index_link: Option<String>,
        attempts: u32,
    ) -> Self {
        Self {
            backend,
            tags,
            parent_id,
            index_link,
            attempts: attempts.max(1),
        }
    }

    pub async fn upload_file(&self, record: &DownloadRecord) -> Result<UploadHandle, UploadError> {
        self.upload_path(&record.gid, &record.name, &record.path())
            .await
    }

    pub async fn upload_path(
        &self,
        gid: &str,
        name: &str,
        path: &Path,
    ) -> Result<UploadHandle, UploadError> {
        let session = self
            .backend
            .open_session(path, name, self.parent_id.as_deref())
            .await?;
        Ok(UploadHandle {
            gid: gid.to_string(),
            name: name.to_string(),
            started: Instant::now(),
            session,
        })
    }

    /// Advances the upload by one chunk, retrying failures up to the attempt bound.
    pub async fn step_chunk(&self, handle: &mut UploadHandle) -> Result<ChunkStep, UploadError> {
        step_session(self.backend.as_ref(), &mut handle.session, self.attempts).await
    }

    pub async fn create_folder(&self, name: &str) -> Result<String, UploadError> {
        self.backend
            .create_folder(name, self.parent_id.as_deref())
            .await
    }

    /// Lazy sequence of per-file upload tasks for the tree under `root`.
    /// Each task is tagged with `gid`.
    pub fn upload_folder(&self, root: PathBuf, gid: &str, folder_id: String) -> FolderUpload {
        let mut folders = HashMap::new();
        folders.insert(root.clone(), folder_id);
        FolderUpload {
            gid: gid.to_string(),
            coordinator: self.clone(),
            closed: AtomicBool::new(false),
            walk: Mutex::new(Some(FolderWalk {
                walker: WalkDir::new(&root).sort_by_file_name().into_iter(),
                folders,
            })),
        }
    }

    pub fn file_link(&self, file: &UploadedFile) -> String {
        let mut text = format!(
            "**Mirror Link**: [{}]({}) (__{}__)",
            file.name,
            file.link,
            human_bytes(file.size)
        );
        if let Some(index) = &self.index_link {
            text.push_str(&format!(
                "\n\n__IndexLink__: [Here]({}).",
                index_url(index, &file.name)
            ));
        }
        text
    }

    pub fn folder_link(&self, name: &str, folder_id: &str) -> String {
        let mut text = format!(
            "**Mirror folderLink**: [{name}]({})",
            self.backend.folder_url(folder_id)
        );
        if let Some(index) = &self.index_link {
            text.push_str(&format!(
                "\n\n__IndexLink__: [Here]({}).",
                index_url(index, &format!("{name}/"))
            ));
        }
        text
    }
}

async fn step_session(
    backend: &dyn UploadBackend,
    session: &mut UploadSession,
    attempts: u32,
) -> Result<ChunkStep, UploadError> {
    let mut attempt = 0;
    loop {
        match backend.next_chunk(session).await {
            Err(e) if attempt + 1 < attempts => {
                debug!("Chunk upload of '{}' failed (attempt {}): {e}", session.name, attempt + 1);
                tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

async fn upload_whole(
    backend: Arc<dyn UploadBackend>,
    path: PathBuf,
    name: String,
    parent: String,
    attempts: u32,
) -> Result<UploadedFile, UploadError> {
    let mut session = backend.open_session(&path, &name, Some(&parent)).await?;
    loop {
        if let ChunkStep::Done(file) = step_session(backend.as_ref(), &mut session, attempts).await? {
            return Ok(file);
        }
    }
}

struct FolderWalk {
    walker: walkdir::IntoIter,
    /// Local directory -> remote folder id.
    folders: HashMap<PathBuf, String>,
}

/// Lazily yields one upload task per file under a directory tree, creating
/// remote sub-folders as they are reached. `close` must be called on every
/// exit path; it drops the directory walker and ends the sequence.
pub struct FolderUpload {
    gid: String,
    coordinator: UploadCoordinator,
    closed: AtomicBool,
    walk: Mutex<Option<FolderWalk>>,
}

impl FolderUpload {
    pub async fn next(&self) -> Option<Result<FolderTask, UploadError>> {
        if self.is_closed() {
            return None;
        }
        let mut guard = self.walk.lock().await;
        let walk = guard.as_mut()?;

        loop {
            if self.is_closed() {
                break;
            }
            let entry = match walk.walker.next() {
                None => break,
                Some(Err(e)) => {
                    warn!("Skipping unreadable entry in folder upload [gid: '{}']: {e}", self.gid);
                    continue;
                }
                Some(Ok(entry)) if entry.depth() == 0 => continue,
                Some(Ok(entry)) => entry,
            };

            let Some(parent) = entry
                .path()
                .parent()
                .and_then(|p| walk.folders.get(p))
                .cloned()
            else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();

            if entry.file_type().is_dir() {
                let backend = &self.coordinator.backend;
                match backend.create_folder(&name, Some(&parent)).await {
                    Ok(id) => {
                        walk.folders.insert(entry.path().to_path_buf(), id);
                    }
                    Err(e) => return Some(Err(e)),
                }
            } else if entry.file_type().is_file() {
                let task = self.coordinator.tags.spawn(
                    &self.gid,
                    upload_whole(
                        self.coordinator.backend.clone(),
                        entry.path().to_path_buf(),
                        name,
                        parent,
                        self.coordinator.attempts,
                    ),
                );
                return Some(Ok(task));
            }
        }

        *guard = None;
        None
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.walk.lock().await.take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
