//! Realtime database interface and the in-memory implementation.
//!
//! The database is a JSON tree addressed by slash-separated paths. Lists are
//! objects keyed by push ids, so child order is key order.

use rand::Rng;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::types::{ChatError, Result};

/// A child of a watched path, delivered by [`RealtimeDatabase::on_child_added`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSnapshot {
    /// Key of the child under the watched path.
    pub key: String,
    /// Value of the child when it was observed.
    pub value: Value,
}

/// Receiving end of a child-added subscription. Dropping it unsubscribes.
pub type ChildStream = mpsc::UnboundedReceiver<ChildSnapshot>;

/// Trait for a hosted realtime database.
#[async_trait::async_trait]
pub trait RealtimeDatabase: Send + Sync {
    /// Append `value` under a new push id at `path`. Returns the id.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Replace the value at `path`. `null` deletes it.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Merge top-level `fields` into the object at `path`.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()>;

    /// Read the value at `path`.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Watch `path` for children. Every existing child is delivered first,
    /// in key order, followed by each child added afterwards.
    async fn on_child_added(&self, path: &str) -> Result<ChildStream>;
}

pub(crate) fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Push Ids
// ============================================================================

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Generates 20-character ids that sort in creation order.
///
/// The first 8 characters encode the timestamp; the last 12 are random and
/// are incremented instead of re-rolled when two ids share a millisecond.
#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last_time: i64,
    last_rand: [u8; 12],
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id for a clock reading of `now` milliseconds.
    pub fn next_id(&mut self, now: i64) -> String {
        let same_ms = now == self.last_time;
        self.last_time = now;

        let mut id = Vec::with_capacity(20);
        let mut time = now;
        for _ in 0..8 {
            id.push(PUSH_CHARS[(time % 64) as usize]);
            time /= 64;
        }
        id.reverse();

        if same_ms {
            for digit in self.last_rand.iter_mut().rev() {
                if *digit == 63 {
                    *digit = 0;
                } else {
                    *digit += 1;
                    break;
                }
            }
        } else {
            let mut rng = rand::thread_rng();
            for digit in self.last_rand.iter_mut() {
                *digit = rng.gen_range(0..64);
            }
        }

        id.extend(self.last_rand.iter().map(|&d| PUSH_CHARS[d as usize]));
        String::from_utf8_lossy(&id).into_owned()
    }
}

// ============================================================================
// In-Memory Database
// ============================================================================

struct Subscriber {
    path: Vec<String>,
    tx: mpsc::UnboundedSender<ChildSnapshot>,
}

#[derive(Default)]
struct Tree {
    root: Value,
    subscribers: Vec<Subscriber>,
    ids: PushIdGenerator,
}

fn node<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, key| node.get(key))
}

fn node_mut<'a>(root: &'a mut Value, path: &[String]) -> &'a mut Value {
    path.iter().fold(root, |node, key| {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        &mut node[key.as_str()]
    })
}

fn children(root: &Value, path: &[String]) -> Vec<(String, Value)> {
    let mut entries: Vec<(String, Value)> = match node(root, path) {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Vec::new(),
    };
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn child_keys(root: &Value, path: &[String]) -> BTreeSet<String> {
    children(root, path).into_iter().map(|(k, _)| k).collect()
}

impl Tree {
    fn remove(&mut self, path: &[String]) {
        let Some((last, parent)) = path.split_last() else {
            self.root = Value::Null;
            return;
        };
        let parent = parent
            .iter()
            .try_fold(&mut self.root, |node, key| node.get_mut(key.as_str()));
        if let Some(Value::Object(map)) = parent {
            map.remove(last);
        }
    }

    fn mutate<F>(&mut self, apply: F)
    where
        F: FnOnce(&mut Tree),
    {
        let before: Vec<BTreeSet<String>> = self
            .subscribers
            .iter()
            .map(|s| child_keys(&self.root, &s.path))
            .collect();

        apply(self);

        for (subscriber, known) in self.subscribers.iter().zip(before) {
            for (key, value) in children(&self.root, &subscriber.path) {
                if !known.contains(&key) {
                    let _ = subscriber.tx.send(ChildSnapshot { key, value });
                }
            }
        }
        self.subscribers.retain(|s| !s.tx.is_closed());
    }

    fn set(&mut self, path: &[String], value: Value) {
        if value.is_null() {
            self.remove(path);
        } else {
            *node_mut(&mut self.root, path) = value;
        }
    }
}

/// In-memory implementation of RealtimeDatabase.
#[derive(Default, Clone)]
pub struct InMemoryDatabase {
    tree: Arc<RwLock<Tree>>,
}

impl InMemoryDatabase {
    /// Creates an empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live child-added subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        let mut tree = self.tree.write().await;
        tree.subscribers.retain(|s| !s.tx.is_closed());
        tree.subscribers.len()
    }
}

#[async_trait::async_trait]
impl RealtimeDatabase for InMemoryDatabase {
    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let mut tree = self.tree.write().await;
        let key = tree.ids.next_id(crate::models::now_millis());
        let mut child = segments(path);
        child.push(key.clone());
        tree.mutate(|t| t.set(&child, value));
        debug!(path, key = %key, "pushed child");
        Ok(key)
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let mut tree = self.tree.write().await;
        let path = segments(path);
        tree.mutate(|t| t.set(&path, value));
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let mut tree = self.tree.write().await;
        let path = segments(path);
        tree.mutate(|t| {
            for (key, value) in fields {
                let mut field = path.clone();
                field.push(key);
                t.set(&field, value);
            }
        });
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let tree = self.tree.read().await;
        Ok(node(&tree.root, &segments(path))
            .filter(|v| !v.is_null())
            .cloned())
    }

    async fn on_child_added(&self, path: &str) -> Result<ChildStream> {
        let path = segments(path);
        if path.is_empty() {
            return Err(ChatError::Database("cannot watch the root".to_string()));
        }

        let mut tree = self.tree.write().await;
        let (tx, rx) = mpsc::unbounded_channel();
        for (key, value) in children(&tree.root, &path) {
            let _ = tx.send(ChildSnapshot { key, value });
        }
        tree.subscribers.push(Subscriber { path, tx });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_ids_sort_in_creation_order() {
        let mut ids = PushIdGenerator::new();
        let a = ids.next_id(1_700_000_000_000);
        let b = ids.next_id(1_700_000_000_000);
        let c = ids.next_id(1_700_000_000_001);

        assert_eq!(a.len(), 20);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a[..8], b[..8]);
    }

    #[test]
    fn test_push_id_time_prefix_is_ordered() {
        let mut ids = PushIdGenerator::new();
        let early = ids.next_id(63);
        let late = ids.next_id(64);
        assert_eq!(&early[..8], "-------z");
        assert_eq!(&late[..8], "------0-");
        assert!(early < late);
    }

    #[tokio::test]
    async fn test_set_get_update() {
        let db = InMemoryDatabase::new();

        db.set("users/0xabc", json!({"address": "0xabc", "isOnline": true}))
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("isOnline".to_string(), json!(false));
        fields.insert("lastSeen".to_string(), json!(42));
        db.update("users/0xabc", fields).await.unwrap();

        let user = db.get("users/0xabc").await.unwrap().unwrap();
        assert_eq!(
            user,
            json!({"address": "0xabc", "isOnline": false, "lastSeen": 42})
        );
        assert_eq!(db.get("users/0xdef").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_null_deletes() {
        let db = InMemoryDatabase::new();
        db.set("users/a", json!({"x": 1})).await.unwrap();
        db.set("users/a", Value::Null).await.unwrap();
        assert_eq!(db.get("users/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_child_added_replays_then_streams() {
        let db = InMemoryDatabase::new();
        let first = db.push("messages", json!({"n": 1})).await.unwrap();

        let mut rx = db.on_child_added("messages").await.unwrap();
        let replayed = rx.recv().await.unwrap();
        assert_eq!(replayed.key, first);
        assert_eq!(replayed.value, json!({"n": 1}));

        let second = db.push("messages", json!({"n": 2})).await.unwrap();
        let added = rx.recv().await.unwrap();
        assert_eq!(added.key, second);
        assert_eq!(added.value, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_child_added_ignores_changes_to_existing_children() {
        let db = InMemoryDatabase::new();
        db.set("users/a", json!({"isOnline": true})).await.unwrap();
        let mut rx = db.on_child_added("users").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().key, "a");

        let mut fields = Map::new();
        fields.insert("isOnline".to_string(), json!(false));
        db.update("users/a", fields).await.unwrap();
        db.set("users/b", json!({"isOnline": true})).await.unwrap();

        let next = rx.recv().await.unwrap();
        assert_eq!(next.key, "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_stream_unsubscribes() {
        let db = InMemoryDatabase::new();
        let rx = db.on_child_added("messages").await.unwrap();
        assert_eq!(db.subscriber_count().await, 1);

        drop(rx);
        db.push("messages", json!("x")).await.unwrap();
        assert_eq!(db.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_watch_root_rejected() {
        let db = InMemoryDatabase::new();
        assert!(matches!(
            db.on_child_added("/").await,
            Err(ChatError::Database(_))
        ));
    }
}
