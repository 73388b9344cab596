//! aria2 JSON-RPC adapter.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DownloadEngine, EngineEvent};
use crate::error::EngineError;
use crate::record::{DownloadRecord, DownloadStatus, StatusDoc};

const LIST_KEYS: [&str; 2] = ["gid", "status"];
const STOPPED_WINDOW: u64 = 1000;

#[derive(Clone)]
pub struct Aria2Client {
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct GidStatus {
    gid: String,
    status: DownloadStatus,
}

impl Aria2Client {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            secret,
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, EngineError> {
        let mut all = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all.push(Value::String(format!("token:{secret}")));
        }
        all.extend(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": method,
            "params": all,
        });
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(EngineError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| EngineError::Decode(format!("{method} returned no result")))
    }

    async fn call_str(&self, method: &str, params: Vec<Value>) -> Result<String, EngineError> {
        match self.call(method, params).await? {
            Value::String(s) => Ok(s),
            other => Err(EngineError::Decode(format!("{method} returned {other}"))),
        }
    }

    async fn list(&self, method: &str, mut params: Vec<Value>) -> Result<Vec<GidStatus>, EngineError> {
        params.push(json!(LIST_KEYS));
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| EngineError::Decode(e.to_string()))
    }

    /// Every gid the engine currently knows about, with its status.
    pub async fn snapshot(&self) -> Result<HashMap<String, DownloadStatus>, EngineError> {
        let mut statuses = HashMap::new();
        let window = vec![json!(0), json!(STOPPED_WINDOW)];
        for entry in self
            .list("aria2.tellActive", Vec::new())
            .await?
            .into_iter()
            .chain(self.list("aria2.tellWaiting", window.clone()).await?)
            .chain(self.list("aria2.tellStopped", window).await?)
        {
            statuses.insert(entry.gid, entry.status);
        }
        Ok(statuses)
    }
}

#[async_trait]
impl DownloadEngine for Aria2Client {
    async fn add_uri(
        &self,
        uris: Vec<String>,
        options: Option<Value>,
    ) -> Result<String, EngineError> {
        self.call_str(
            "aria2.addUri",
            vec![json!(uris), options.unwrap_or_else(|| json!({}))],
        )
        .await
    }

    async fn add_torrent(
        &self,
        torrent: &[u8],
        options: Option<Value>,
    ) -> Result<String, EngineError> {
        let encoded = general_purpose::STANDARD.encode(torrent);
        self.call_str(
            "aria2.addTorrent",
            vec![json!(encoded), json!([]), options.unwrap_or_else(|| json!({}))],
        )
        .await
    }

    async fn tell_status(&self, gid: &str) -> Result<DownloadRecord, EngineError> {
        let value = self.call("aria2.tellStatus", vec![json!(gid)]).await?;
        let doc: StatusDoc =
            serde_json::from_value(value).map_err(|e| EngineError::Decode(e.to_string()))?;
        Ok(doc.into())
    }

    async fn pause(&self, gid: &str) -> Result<String, EngineError> {
        self.call_str("aria2.pause", vec![json!(gid)]).await
    }

    async fn force_pause(&self, gid: &str) -> Result<String, EngineError> {
        self.call_str("aria2.forcePause", vec![json!(gid)]).await
    }

    async fn remove(&self, gid: &str) -> Result<String, EngineError> {
        self.call_str("aria2.remove", vec![json!(gid)]).await
    }

    async fn force_remove(&self, gid: &str) -> Result<String, EngineError> {
        self.call_str("aria2.forceRemove", vec![json!(gid)]).await
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.call("aria2.shutdown", Vec::new()).await.map(|_| ())
    }
}

/// Events implied by moving from one status snapshot to the next.
pub fn diff_statuses(
    previous: &HashMap<String, DownloadStatus>,
    current: &HashMap<String, DownloadStatus>,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    for (gid, status) in current {
        let before = previous.get(gid).copied();
        if before == Some(*status) {
            continue;
        }
        let started = before.is_some_and(|s| !matches!(s, DownloadStatus::Waiting));
        match status {
            DownloadStatus::Active if !started => events.push(EngineEvent::Start(gid.clone())),
            DownloadStatus::Complete | DownloadStatus::Error => {
                // A download that finished between two polls never showed up as active.
                if before.is_none() {
                    events.push(EngineEvent::Start(gid.clone()));
                }
                if *status == DownloadStatus::Complete {
                    events.push(EngineEvent::Complete(gid.clone()));
                } else {
                    events.push(EngineEvent::Error(gid.clone()));
                }
            }
            _ => {}
        }
    }
    events
}

/// Polls the engine and forwards lifecycle notifications until the receiver
/// goes away. Downloads already stopped at startup are not re-announced.
pub async fn watch_events(
    client: Aria2Client,
    interval: Duration,
    events: mpsc::Sender<EngineEvent>,
) {
    let mut previous = loop {
        match client.snapshot().await {
            Ok(snapshot) => break snapshot,
            Err(e) => {
                warn!("Waiting for download engine: {e}");
                tokio::time::sleep(interval).await;
            }
        }
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let current = match client.snapshot().await {
            Ok(current) => current,
            Err(e) => {
                debug!("Engine poll failed: {e}");
                continue;
            }
        };
        for event in diff_statuses(&previous, &current) {
            if events.send(event).await.is_err() {
                return;
            }
        }
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, DownloadStatus)]) -> HashMap<String, DownloadStatus> {
        entries
            .iter()
            .map(|(gid, status)| (gid.to_string(), *status))
            .collect()
    }

    #[test]
    fn new_active_download_starts() {
        let events = diff_statuses(
            &HashMap::new(),
            &snapshot(&[("a", DownloadStatus::Active)]),
        );
        assert_eq!(events, vec![EngineEvent::Start("a".into())]);
    }

    #[test]
    fn waiting_then_active_starts_once() {
        let waiting = snapshot(&[("a", DownloadStatus::Waiting)]);
        let active = snapshot(&[("a", DownloadStatus::Active)]);
        assert!(diff_statuses(&HashMap::new(), &waiting).is_empty());
        assert_eq!(
            diff_statuses(&waiting, &active),
            vec![EngineEvent::Start("a".into())]
        );
        assert!(diff_statuses(&active, &active).is_empty());
    }

    #[test]
    fn resumed_download_does_not_restart() {
        let paused = snapshot(&[("a", DownloadStatus::Paused)]);
        let active = snapshot(&[("a", DownloadStatus::Active)]);
        assert!(diff_statuses(&paused, &active).is_empty());
    }

    #[test]
    fn completion_and_error_are_reported() {
        let before = snapshot(&[("a", DownloadStatus::Active), ("b", DownloadStatus::Active)]);
        let after = snapshot(&[("a", DownloadStatus::Complete), ("b", DownloadStatus::Error)]);
        let mut events = diff_statuses(&before, &after);
        events.sort_by(|x, y| x.gid().cmp(y.gid()));
        assert_eq!(
            events,
            vec![
                EngineEvent::Complete("a".into()),
                EngineEvent::Error("b".into())
            ]
        );
    }

    #[test]
    fn unseen_completion_is_started_first() {
        let events = diff_statuses(
            &HashMap::new(),
            &snapshot(&[("a", DownloadStatus::Complete)]),
        );
        assert_eq!(
            events,
            vec![
                EngineEvent::Start("a".into()),
                EngineEvent::Complete("a".into())
            ]
        );
    }

    #[test]
    fn removal_is_silent() {
        let before = snapshot(&[("a", DownloadStatus::Active)]);
        let after = snapshot(&[("a", DownloadStatus::Removed)]);
        assert!(diff_statuses(&before, &after).is_empty());
    }
}
