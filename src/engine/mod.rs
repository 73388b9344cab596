//! Download engine capability and the notifications it emits.

pub mod aria2;
pub mod retry;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::record::DownloadRecord;

pub use aria2::{Aria2Client, watch_events};
pub use retry::with_backoff;

/// Control operations the relay needs from a download engine.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    async fn add_uri(&self, uris: Vec<String>, options: Option<Value>)
    -> Result<String, EngineError>;

    async fn add_torrent(&self, torrent: &[u8], options: Option<Value>)
    -> Result<String, EngineError>;

    async fn tell_status(&self, gid: &str) -> Result<DownloadRecord, EngineError>;

    async fn pause(&self, gid: &str) -> Result<String, EngineError>;

    async fn force_pause(&self, gid: &str) -> Result<String, EngineError>;

    async fn remove(&self, gid: &str) -> Result<String, EngineError>;

    async fn force_remove(&self, gid: &str) -> Result<String, EngineError>;

    async fn shutdown(&self) -> Result<(), EngineError>;
}

/// Lifecycle notification carrying the gid it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Start(String),
    Complete(String),
    Error(String),
}

impl EngineEvent {
    pub fn gid(&self) -> &str {
        match self {
            Self::Start(gid) | Self::Complete(gid) | Self::Error(gid) => gid,
        }
    }
}
