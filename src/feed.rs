//! The shared message feed.
//!
//! Messages live in the append-only remote list `messages`. The feed mirrors
//! that list locally and appends to it when sending.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::database::RealtimeDatabase;
use crate::models::ChatMessage;
use crate::types::{Result, MESSAGES_PATH};

const UPDATE_CAPACITY: usize = 256;

/// Local mirror of the remote message list.
pub struct MessageFeed {
    db: Arc<dyn RealtimeDatabase>,
    messages: Arc<RwLock<Vec<ChatMessage>>>,
    updates: broadcast::Sender<ChatMessage>,
    listener: Option<JoinHandle<()>>,
}

impl MessageFeed {
    pub fn new(db: Arc<dyn RealtimeDatabase>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            db,
            messages: Arc::new(RwLock::new(Vec::new())),
            updates,
            listener: None,
        }
    }

    /// Starts mirroring the remote list. Calling it again is a no-op.
    pub async fn subscribe(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }

        let mut rx = self.db.on_child_added(MESSAGES_PATH).await?;
        let messages = self.messages.clone();
        let updates = self.updates.clone();

        self.listener = Some(tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                match ChatMessage::from_value(snapshot.value) {
                    Ok(message) => {
                        messages.write().await.push(message.clone());
                        let _ = updates.send(message);
                    }
                    Err(e) => warn!(key = %snapshot.key, error = %e, "skipping message"),
                }
            }
            debug!("message feed closed");
        }));
        Ok(())
    }

    /// Receives every message mirrored from now on.
    pub fn watch(&self) -> broadcast::Receiver<ChatMessage> {
        self.updates.subscribe()
    }

    /// Appends `text` to the remote list as `sender`.
    ///
    /// Blank text or a missing sender is a no-op and returns `None`;
    /// otherwise returns the push id of the new message.
    pub async fn send(&self, sender: Option<&str>, text: &str) -> Result<Option<String>> {
        let Some(sender) = sender else {
            return Ok(None);
        };
        if text.trim().is_empty() {
            return Ok(None);
        }

        let message = ChatMessage::new(sender, text);
        let key = self
            .db
            .push(MESSAGES_PATH, serde_json::to_value(&message)?)
            .await?;
        debug!(key = %key, sender, "message sent");
        Ok(Some(key))
    }

    /// Messages mirrored so far, in arrival order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    pub fn is_subscribed(&self) -> bool {
        self.listener.is_some()
    }
}

impl Drop for MessageFeed {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryDatabase;
    use serde_json::json;

    const ALICE: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    #[tokio::test]
    async fn test_empty_message_is_noop() {
        let db = InMemoryDatabase::new();
        let feed = MessageFeed::new(Arc::new(db.clone()));

        assert_eq!(feed.send(Some(ALICE), "").await.unwrap(), None);
        assert_eq!(feed.send(Some(ALICE), "   \n\t").await.unwrap(), None);
        assert_eq!(db.get(MESSAGES_PATH).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_without_sender_is_noop() {
        let db = InMemoryDatabase::new();
        let feed = MessageFeed::new(Arc::new(db.clone()));

        assert_eq!(feed.send(None, "hello").await.unwrap(), None);
        assert_eq!(db.get(MESSAGES_PATH).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_appends_and_mirrors() {
        let db = InMemoryDatabase::new();
        let mut feed = MessageFeed::new(Arc::new(db.clone()));
        feed.subscribe().await.unwrap();
        let mut updates = feed.watch();

        let key = feed.send(Some(ALICE), " gm ").await.unwrap().unwrap();

        let arrived = updates.recv().await.unwrap();
        assert_eq!(arrived.sender, ALICE);
        assert_eq!(arrived.message, " gm ");

        let stored = db.get(&format!("{MESSAGES_PATH}/{key}")).await.unwrap().unwrap();
        assert_eq!(stored["message"], " gm ");
        assert_eq!(feed.messages().await, vec![arrived]);
    }

    #[tokio::test]
    async fn test_subscribe_replays_history_in_order() {
        let db = InMemoryDatabase::new();
        let writer = MessageFeed::new(Arc::new(db.clone()));
        writer.send(Some(ALICE), "one").await.unwrap();
        writer.send(Some(ALICE), "two").await.unwrap();

        let mut feed = MessageFeed::new(Arc::new(db.clone()));
        let mut updates = feed.watch();
        feed.subscribe().await.unwrap();

        assert_eq!(updates.recv().await.unwrap().message, "one");
        assert_eq!(updates.recv().await.unwrap().message, "two");
        assert_eq!(feed.len().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let db = InMemoryDatabase::new();
        db.push(MESSAGES_PATH, json!({"unexpected": true})).await.unwrap();
        db.push(
            MESSAGES_PATH,
            json!({"sender": ALICE, "message": "ok", "timestamp": 1}),
        )
        .await
        .unwrap();

        let mut feed = MessageFeed::new(Arc::new(db));
        let mut updates = feed.watch();
        feed.subscribe().await.unwrap();

        assert_eq!(updates.recv().await.unwrap().message, "ok");
        assert_eq!(feed.len().await, 1);
    }
}
