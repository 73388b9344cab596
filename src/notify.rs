//! Outbound user-facing messages.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::error::NotifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MessageId(pub u64);

/// Chat-like channel the relay reports through.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str, reply_to: Option<MessageId>) -> Result<MessageId, NotifyError>;

    async fn edit(&self, id: MessageId, text: &str) -> Result<(), NotifyError>;

    async fn delete(&self, id: MessageId) -> Result<(), NotifyError>;
}

/// Publishes messages as JSON events for `/events` subscribers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
    next_id: AtomicU64,
    texts: Mutex<HashMap<MessageId, String>>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            next_id: AtomicU64::new(1),
            texts: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn publish(&self, value: serde_json::Value) {
        // No subscribers is fine; messages are fire-and-forget.
        let _ = self.tx.send(value.to_string());
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn send(&self, text: &str, reply_to: Option<MessageId>) -> Result<MessageId, NotifyError> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.texts
            .lock()
            .map_err(|_| NotifyError::Closed)?
            .insert(id, text.to_string());
        self.publish(serde_json::json!({
            "type": "message",
            "action": "send",
            "id": id,
            "reply_to": reply_to,
            "text": text,
        }));
        Ok(id)
    }

    async fn edit(&self, id: MessageId, text: &str) -> Result<(), NotifyError> {
        {
            let mut texts = self.texts.lock().map_err(|_| NotifyError::Closed)?;
            match texts.get_mut(&id) {
                Some(current) if current == text => return Err(NotifyError::NotModified),
                Some(current) => *current = text.to_string(),
                None => return Err(NotifyError::Closed),
            }
        }
        self.publish(serde_json::json!({
            "type": "message",
            "action": "edit",
            "id": id,
            "text": text,
        }));
        Ok(())
    }

    async fn delete(&self, id: MessageId) -> Result<(), NotifyError> {
        self.texts
            .lock()
            .map_err(|_| NotifyError::Closed)?
            .remove(&id);
        self.publish(serde_json::json!({
            "type": "message",
            "action": "delete",
            "id": id,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn edit_with_same_text_is_not_modified() {
        let notifier = BroadcastNotifier::new(8);
        let id = notifier.send("hello", None).await.unwrap();

        assert!(matches!(
            notifier.edit(id, "hello").await,
            Err(NotifyError::NotModified)
        ));
        notifier.edit(id, "hello again").await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        let id = notifier.send("queued", None).await.unwrap();
        notifier.delete(id).await.unwrap();

        let sent: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["action"], "send");
        assert_eq!(sent["text"], "queued");
        let deleted: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(deleted["action"], "delete");
        assert_eq!(deleted["id"], id.0);
    }
}
