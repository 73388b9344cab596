use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::decrypt::DecryptJob;
use crate::engine::{DownloadEngine, with_backoff};
use crate::error::EngineError;
use crate::notify::{MessageId, Notifier};
use crate::record::DownloadStatus;
use crate::registry::{ActiveContext, Registry};

const METADATA_ABORT: &str = "__GID belongs to finished metadata, it can't be aborted.__";

pub enum DownloadSource {
    Uri(String),
    Torrent(Vec<u8>),
}

/// Entry points used by the command surface.
pub struct Orchestrator {
    registry: Arc<Registry>,
    engine: Arc<dyn DownloadEngine>,
    notifier: Arc<dyn Notifier>,
    rpc_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn DownloadEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            engine,
            notifier,
            rpc_attempts: 1,
        }
    }

    pub fn with_rpc_attempts(mut self, attempts: u32) -> Self {
        self.rpc_attempts = attempts;
        self
    }

    /// Queues a download and makes `request` the active context, retiring the
    /// previous one. An engine rejection comes back as user-facing text.
    pub async fn add_download(
        &self,
        source: DownloadSource,
        request: MessageId,
        decrypt: Option<DecryptJob>,
        options: Option<Value>,
    ) -> Result<String, String> {
        let engine = &self.engine;
        let added = match &source {
            DownloadSource::Uri(uri) => {
                with_backoff("addUri", self.rpc_attempts, || {
                    engine.add_uri(vec![uri.clone()], options.clone())
                })
                .await
            }
            DownloadSource::Torrent(torrent) => {
                with_backoff("addTorrent", self.rpc_attempts, || {
                    engine.add_torrent(torrent, options.clone())
                })
                .await
            }
        };
        let gid = match added {
            Ok(gid) => gid,
            Err(e) => {
                warn!("Engine rejected download: {e}");
                return Err(e.user_message());
            }
        };

        let mut state = self.registry.lock().await;
        state
            .install_context(ActiveContext::new(request), self.notifier.as_ref())
            .await;
        if let Some(job) = decrypt {
            state.flag_decrypt(&gid, job);
        }
        info!("Queued download: [gid: '{gid}']");
        Ok(gid)
    }

    pub async fn pause_download(&self, gid: &str) -> Result<String, EngineError> {
        self.engine.pause(gid).await
    }

    pub async fn remove_download(&self, gid: &str) -> Result<String, EngineError> {
        self.engine.remove(gid).await
    }

    /// Requests teardown of `gid`. `None` means accepted; the actual unwind
    /// happens on the next progress tick.
    pub async fn cancel_mirror(&self, gid: &str) -> Option<String> {
        let engine = &self.engine;
        let record = match with_backoff("tellStatus", self.rpc_attempts, || engine.tell_status(gid)).await {
            Ok(record) => record,
            Err(e) => return Some(e.user_message().replace(gid, &format!("'{gid}'"))),
        };

        match record.status {
            DownloadStatus::Active => {
                if let Err(e) = self.engine.force_pause(gid).await {
                    warn!("Force pause failed [gid: '{gid}']: {e}");
                }
                if let Err(e) = self.engine.force_remove(gid).await {
                    warn!("Force remove failed [gid: '{gid}']: {e}");
                }
            }
            DownloadStatus::Complete if !record.followed_by.is_empty() => {
                return Some(METADATA_ABORT.to_string());
            }
            _ => {}
        }

        self.registry.lock().await.mark_cancelled(gid);
        info!("Cancel requested: [gid: '{gid}']");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, record};

    #[tokio::test]
    async fn second_download_retires_first_message() {
        let h = Harness::new(16);
        h.orchestrator
            .add_download(DownloadSource::Uri("https://a.example/a".into()), MessageId(1), None, None)
            .await
            .unwrap();
        {
            let mut state = h.registry.lock().await;
            state.respond(h.notifier.as_ref(), "progress").await.unwrap();
        }
        let first = h.registry.lock().await.context().unwrap().response.unwrap();

        h.orchestrator
            .add_download(DownloadSource::Uri("https://a.example/b".into()), MessageId(2), None, None)
            .await
            .unwrap();

        assert_eq!(h.notifier.deleted(), vec![first]);
        assert_eq!(
            h.registry.lock().await.context(),
            Some(ActiveContext::new(MessageId(2)))
        );
    }

    #[tokio::test]
    async fn rejected_add_returns_message_and_keeps_context() {
        let h = Harness::new(16);
        h.engine.reject_adds("No URI to download.");

        let err = h
            .orchestrator
            .add_download(DownloadSource::Torrent(b"d4:infoe".to_vec()), MessageId(1), None, None)
            .await
            .unwrap_err();

        assert_eq!(err, "__No URI to download.__");
        assert!(h.registry.lock().await.context().is_none());
        assert_eq!(h.engine.calls(), vec!["add_torrent"]);
    }

    #[tokio::test]
    async fn finished_metadata_cannot_be_cancelled() {
        let h = Harness::new(16);
        let mut metadata = record("gid1", "[METADATA]abc");
        metadata.status = DownloadStatus::Complete;
        metadata.followed_by = vec!["gid2".to_string()];
        h.engine.set_status(metadata);

        let message = h.orchestrator.cancel_mirror("gid1").await;

        assert_eq!(message.as_deref(), Some(METADATA_ABORT));
        assert!(!h.registry.lock().await.is_cancelled("gid1"));
    }

    #[tokio::test]
    async fn active_download_is_stopped_then_marked() {
        let h = Harness::new(16);
        h.engine.set_status(record("gid1", "a.iso"));

        assert_eq!(h.orchestrator.cancel_mirror("gid1").await, None);

        assert_eq!(h.engine.calls(), vec!["force_pause", "force_remove"]);
        assert!(h.registry.lock().await.is_cancelled("gid1"));
    }

    #[tokio::test]
    async fn unknown_gid_is_quoted() {
        let h = Harness::new(16);

        let message = h.orchestrator.cancel_mirror("deadbeef").await;

        assert_eq!(message.as_deref(), Some("__GID 'deadbeef' is not found__"));
    }
}
