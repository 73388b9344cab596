//! In-memory doubles for the engine, upload backend and notification channel.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::test_settings;
use crate::engine::{DownloadEngine, EngineEvent};
use crate::error::{EngineError, NotifyError, UploadError};
use crate::facade::Orchestrator;
use crate::lifecycle::LifecycleController;
use crate::notify::{MessageId, Notifier};
use crate::progress::ProgressReporter;
use crate::record::{DownloadRecord, DownloadStatus};
use crate::registry::Registry;
use crate::tasks::TaskTags;
use crate::upload::{ChunkProgress, ChunkStep, UploadBackend, UploadCoordinator, UploadSession, UploadedFile};

pub fn record(gid: &str, name: &str) -> DownloadRecord {
    DownloadRecord {
        gid: gid.to_string(),
        name: name.to_string(),
        status: DownloadStatus::Active,
        is_metadata_only: false,
        completed_length: 0,
        total_length: 0,
        download_speed: 0,
        error_code: None,
        error_message: None,
        is_bittorrent: false,
        info_hash: None,
        dir: PathBuf::from("/downloads"),
        file_count: 1,
        followed_by: Vec::new(),
    }
}

pub fn completed(gid: &str, name: &str, dir: &Path) -> DownloadRecord {
    DownloadRecord {
        status: DownloadStatus::Complete,
        dir: dir.to_path_buf(),
        ..record(gid, name)
    }
}

#[derive(Default)]
pub struct MockEngine {
    statuses: Mutex<HashMap<String, DownloadRecord>>,
    calls: Mutex<Vec<String>>,
    next_gid: AtomicU64,
    rejection: Mutex<Option<String>>,
    status_delay: Mutex<Option<Duration>>,
}

impl MockEngine {
    /// Delays the next `tell_status` answer by `delay`.
    pub fn slow_next_status(&self, delay: Duration) {
        *self.status_delay.lock().expect("delay mutex") = Some(delay);
    }

    pub fn set_status(&self, record: DownloadRecord) {
        self.statuses
            .lock()
            .expect("statuses mutex")
            .insert(record.gid.clone(), record);
    }

    pub fn reject_adds(&self, message: &str) {
        *self.rejection.lock().expect("rejection mutex") = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex").clone()
    }

    fn call(&self, name: &str) {
        self.calls.lock().expect("calls mutex").push(name.to_string());
    }

    fn admit(&self, call: &str) -> Result<String, EngineError> {
        self.call(call);
        if let Some(message) = self.rejection.lock().expect("rejection mutex").clone() {
            return Err(EngineError::Rpc { code: 1, message });
        }
        Ok(format!("gid{}", self.next_gid.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

#[async_trait]
impl DownloadEngine for MockEngine {
    async fn add_uri(&self, _uris: Vec<String>, _options: Option<Value>) -> Result<String, EngineError> {
        self.admit("add_uri")
    }

    async fn add_torrent(&self, _torrent: &[u8], _options: Option<Value>) -> Result<String, EngineError> {
        self.admit("add_torrent")
    }

    async fn tell_status(&self, gid: &str) -> Result<DownloadRecord, EngineError> {
        let delay = self.status_delay.lock().expect("delay mutex").take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.statuses
            .lock()
            .expect("statuses mutex")
            .get(gid)
            .cloned()
            .ok_or_else(|| EngineError::Rpc {
                code: 1,
                message: format!("GID {gid} is not found"),
            })
    }

    async fn pause(&self, gid: &str) -> Result<String, EngineError> {
        self.call("pause");
        Ok(gid.to_string())
    }

    async fn force_pause(&self, gid: &str) -> Result<String, EngineError> {
        self.call("force_pause");
        Ok(gid.to_string())
    }

    async fn remove(&self, gid: &str) -> Result<String, EngineError> {
        self.call("remove");
        Ok(gid.to_string())
    }

    async fn force_remove(&self, gid: &str) -> Result<String, EngineError> {
        self.call("force_remove");
        Ok(gid.to_string())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.call("shutdown");
        Ok(())
    }
}

pub struct MockBackend {
    chunk: u64,
    failures: AtomicU32,
    opened: AtomicUsize,
    next_folder: AtomicUsize,
    gate: Mutex<Option<usize>>,
    folders: Mutex<Vec<(String, String)>>,
}

impl MockBackend {
    pub fn with_chunk(chunk: u64) -> Self {
        Self {
            chunk,
            failures: AtomicU32::new(0),
            opened: AtomicUsize::new(0),
            next_folder: AtomicUsize::new(0),
            gate: Mutex::new(None),
            folders: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_chunks(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Sessions past the first `n` never open.
    pub fn block_after(&self, n: usize) {
        *self.gate.lock().expect("gate mutex") = Some(n);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// `(name, parent)` of every folder created.
    pub fn folders(&self) -> Vec<(String, String)> {
        self.folders.lock().expect("folders mutex").clone()
    }
}

#[async_trait]
impl UploadBackend for MockBackend {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, UploadError> {
        let id = format!("folder-{}", self.next_folder.fetch_add(1, Ordering::SeqCst) + 1);
        self.folders
            .lock()
            .expect("folders mutex")
            .push((name.to_string(), parent.unwrap_or_default().to_string()));
        Ok(id)
    }

    async fn open_session(
        &self,
        path: &Path,
        name: &str,
        _parent: Option<&str>,
    ) -> Result<UploadSession, UploadError> {
        let opened = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = *self.gate.lock().expect("gate mutex");
        if gate.is_some_and(|limit| opened > limit) {
            std::future::pending::<()>().await;
        }
        let total_size = tokio::fs::metadata(path).await?.len();
        Ok(UploadSession {
            name: name.to_string(),
            path: path.to_path_buf(),
            location: format!("mock://{name}"),
            offset: 0,
            total_size,
        })
    }

    async fn next_chunk(&self, session: &mut UploadSession) -> Result<ChunkStep, UploadError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(UploadError::Status {
                status: 503,
                body: "backend unavailable".to_string(),
            });
        }
        session.offset = (session.offset + self.chunk).min(session.total_size);
        if session.offset >= session.total_size {
            return Ok(ChunkStep::Done(UploadedFile {
                id: format!("file-{}", session.name),
                name: session.name.clone(),
                size: session.total_size,
                link: format!("https://files.example/{}", session.name),
            }));
        }
        Ok(ChunkStep::Partial(ChunkProgress {
            resumable_progress: session.offset,
            total_size: session.total_size,
        }))
    }

    fn folder_url(&self, folder_id: &str) -> String {
        format!("https://folders.example/{folder_id}")
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    next_id: AtomicU64,
    texts: Mutex<HashMap<MessageId, String>>,
    sent: Mutex<Vec<(MessageId, Option<MessageId>, String)>>,
    edits: Mutex<Vec<(MessageId, String)>>,
    deleted: Mutex<Vec<MessageId>>,
    flood: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    /// The next send or edit fails with a rate-limit signal.
    pub fn flood_once(&self, wait: Duration) {
        *self.flood.lock().expect("flood mutex") = Some(wait);
    }

    pub fn sent(&self) -> Vec<(MessageId, Option<MessageId>, String)> {
        self.sent.lock().expect("sent mutex").clone()
    }

    pub fn edits(&self) -> Vec<(MessageId, String)> {
        self.edits.lock().expect("edits mutex").clone()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().expect("deleted mutex").clone()
    }

    pub fn text_of(&self, id: MessageId) -> Option<String> {
        self.texts.lock().expect("texts mutex").get(&id).cloned()
    }

    /// Every text ever sent or edited in.
    pub fn history(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|(_, _, text)| text)
            .chain(self.edits().into_iter().map(|(_, text)| text))
            .collect()
    }

    fn flooded(&self) -> Result<(), NotifyError> {
        match self.flood.lock().expect("flood mutex").take() {
            Some(wait) => Err(NotifyError::FloodWait(wait)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str, reply_to: Option<MessageId>) -> Result<MessageId, NotifyError> {
        self.flooded()?;
        let id = MessageId(1000 + self.next_id.fetch_add(1, Ordering::SeqCst));
        self.texts
            .lock()
            .expect("texts mutex")
            .insert(id, text.to_string());
        self.sent
            .lock()
            .expect("sent mutex")
            .push((id, reply_to, text.to_string()));
        Ok(id)
    }

    async fn edit(&self, id: MessageId, text: &str) -> Result<(), NotifyError> {
        self.flooded()?;
        let mut texts = self.texts.lock().expect("texts mutex");
        if texts.get(&id).is_some_and(|current| current == text) {
            return Err(NotifyError::NotModified);
        }
        texts.insert(id, text.to_string());
        self.edits
            .lock()
            .expect("edits mutex")
            .push((id, text.to_string()));
        Ok(())
    }

    async fn delete(&self, id: MessageId) -> Result<(), NotifyError> {
        self.texts.lock().expect("texts mutex").remove(&id);
        self.deleted.lock().expect("deleted mutex").push(id);
        Ok(())
    }
}

/// Real registry, lifecycle, reporter and facade wired to the doubles.
pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub backend: Arc<MockBackend>,
    pub notifier: Arc<RecordingNotifier>,
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleController>,
    pub reporter: ProgressReporter,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(chunk: u64) -> Self {
        let engine = Arc::new(MockEngine::default());
        let backend = Arc::new(MockBackend::with_chunk(chunk));
        let notifier = Arc::new(RecordingNotifier::default());
        let tags = TaskTags::default();
        let registry = Arc::new(Registry::new(tags.clone()));
        let uploads = UploadCoordinator::new(backend.clone(), tags, None, None, 5);
        let mut settings = test_settings(PathBuf::from("/downloads"));
        settings.decrypt_chunk_size = 64;
        settings.rpc_attempts = 1;

        let lifecycle = Arc::new(LifecycleController::new(
            registry.clone(),
            engine.clone(),
            uploads.clone(),
            notifier.clone(),
            &settings,
        ));
        let reporter = ProgressReporter::new(
            registry.clone(),
            engine.clone(),
            uploads,
            notifier.clone(),
            &settings,
        );
        let orchestrator = Orchestrator::new(registry.clone(), engine.clone(), notifier.clone());

        Self {
            engine,
            backend,
            notifier,
            registry,
            lifecycle,
            reporter,
            orchestrator,
        }
    }

    pub async fn start(&self, record: DownloadRecord) {
        let gid = record.gid.clone();
        self.engine.set_status(record);
        self.lifecycle.handle(EngineEvent::Start(gid)).await;
    }
}
