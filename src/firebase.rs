//! Hosted realtime database over its REST and event-stream surface.
//!
//! Reads and writes map to `GET`/`PUT`/`PATCH`/`POST` on `{path}.json`.
//! Child-added subscriptions hold an open `text/event-stream` request and
//! translate its `put`/`patch` events into [`ChildSnapshot`]s.

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::database::{segments, ChildSnapshot, ChildStream, RealtimeDatabase};
use crate::types::{ChatError, Result};

/// Realtime database reached over HTTPS.
#[derive(Clone)]
pub struct FirebaseDatabase {
    client: Client,
    base_url: String,
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

impl FirebaseDatabase {
    /// Creates a client for the database at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: None,
        }
    }

    /// Sends `token` as the `auth` query parameter on every request.
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    /// Returns the REST URL of `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, segments(path).join("/"))
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ChatError::Database(format!("{status}: {body}")))
    }
}

#[async_trait::async_trait]
impl RealtimeDatabase for FirebaseDatabase {
    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let response = self
            .request(self.client.post(self.url(path)).json(&value))
            .send()
            .await?;
        let pushed: PushResponse = Self::check(response).await?.json().await?;
        debug!(path, key = %pushed.name, "pushed child");
        Ok(pushed.name)
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let response = self
            .request(self.client.put(self.url(path)).json(&value))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let response = self
            .request(self.client.patch(self.url(path)).json(&fields))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let response = self
            .request(self.client.get(self.url(path)))
            .send()
            .await?;
        let value: Value = Self::check(response).await?.json().await?;
        Ok(Some(value).filter(|v| !v.is_null()))
    }

    async fn on_child_added(&self, path: &str) -> Result<ChildStream> {
        let url = self.url(path);
        let response = self
            .request(self.client.get(&url).header(ACCEPT, "text/event-stream"))
            .send()
            .await?;
        let response = Self::check(response).await?;
        info!(url = %url, "child-added stream opened");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut tracker = ChildTracker::default();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(url = %url, error = %e, "child-added stream failed");
                        return;
                    }
                };

                for event in decoder.feed(&bytes) {
                    match tracker.apply(&event) {
                        StreamStep::Children(children) => {
                            for child in children {
                                if tx.send(child).is_err() {
                                    debug!(url = %url, "child-added subscriber dropped");
                                    return;
                                }
                            }
                        }
                        StreamStep::Idle => {}
                        StreamStep::Closed(reason) => {
                            warn!(url = %url, event = %event.event, reason = %reason, "child-added stream closed by server");
                            return;
                        }
                    }
                }
            }
            info!(url = %url, "child-added stream ended");
        });

        Ok(rx)
    }
}

// ============================================================================
// Event Stream Decoding
// ============================================================================

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for a `text/event-stream` body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feeds a chunk of the body and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() || !self.event.is_empty() {
                    events.push(SseEvent {
                        event: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    path: String,
    #[serde(default)]
    data: Value,
}

/// What a stream event means for a child-added subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    /// New children to deliver, in key order.
    Children(Vec<ChildSnapshot>),
    /// Nothing to deliver.
    Idle,
    /// The server ended the subscription.
    Closed(String),
}

/// Remembers which children were already delivered on a stream.
#[derive(Debug, Default)]
pub struct ChildTracker {
    seen: HashSet<String>,
}

impl ChildTracker {
    /// Interprets one event.
    pub fn apply(&mut self, event: &SseEvent) -> StreamStep {
        match event.event.as_str() {
            "put" | "patch" => {}
            "keep-alive" => return StreamStep::Idle,
            "cancel" | "auth_revoked" => return StreamStep::Closed(event.data.clone()),
            other => {
                debug!(event = other, "ignoring stream event");
                return StreamStep::Idle;
            }
        }

        let payload: EventPayload = match serde_json::from_str(&event.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed stream event");
                return StreamStep::Idle;
            }
        };

        let replaces_list = event.event == "put";
        let mut candidates: Vec<(String, Value)> = match segments(&payload.path).as_slice() {
            [] => {
                let entries: Vec<(String, Value)> = match payload.data {
                    Value::Object(map) => map.into_iter().collect(),
                    _ => Vec::new(),
                };
                if replaces_list {
                    self.seen
                        .retain(|key| entries.iter().any(|(k, v)| k == key && !v.is_null()));
                }
                entries
            }
            [key] => vec![(key.clone(), payload.data)],
            _ => Vec::new(),
        };
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        // A deleted child is delivered again if it comes back.
        candidates.retain(|(key, value)| {
            if value.is_null() {
                self.seen.remove(key);
            }
            !value.is_null()
        });

        let children: Vec<ChildSnapshot> = candidates
            .into_iter()
            .filter(|(key, _)| self.seen.insert(key.clone()))
            .map(|(key, value)| ChildSnapshot { key, value })
            .collect();

        if children.is_empty() {
            StreamStep::Idle
        } else {
            StreamStep::Children(children)
        }
    }
}
