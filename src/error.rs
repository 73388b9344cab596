//! Error types shared by the relay's collaborators.

use std::time::Duration;

use thiserror::Error;

/// Failures talking to the download engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine accepted the call but rejected it (bad URI, unknown gid, disk full).
    #[error("engine error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The control channel itself failed.
    #[error("engine transport failed")]
    Transport(#[from] reqwest::Error),
    #[error("malformed engine response: {0}")]
    Decode(String),
}

impl EngineError {
    /// Transport hiccups are worth retrying, engine-reported errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// User-facing rendering of an engine rejection.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rpc { message, .. } => format!("__{message}__"),
            other => format!("__{other}__"),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload request failed")]
    Http(#[from] reqwest::Error),
    #[error("upload backend answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upload io failed")]
    Io(#[from] std::io::Error),
    #[error("malformed upload response: {0}")]
    Decode(String),
    #[error("upload task failed to join")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("message content not modified")]
    NotModified,
    #[error("rate limited, retry in {0:?}")]
    FloodWait(Duration),
    #[error("notification channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("decrypt io failed")]
    Io(#[from] std::io::Error),
    #[error("decrypt worker failed to join")]
    Join(#[from] tokio::task::JoinError),
    #[error("decryption cancelled")]
    Cancelled,
    #[error("invalid key material: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },
}
