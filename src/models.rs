//! Data models for BlockChat.
//!
//! This module defines the records exchanged with the realtime database and
//! the local view-state shared by the chat components.

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::{ChatError, Result};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

/// Shortens an address to `0x1234...abcd`.
pub fn short_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    let head: String = chars.iter().take(6).collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("{head}...{tail}")
}

/// Formats an epoch-millis timestamp as local `HH:MM`.
pub fn format_time(timestamp: i64) -> String {
    match Local.timestamp_millis_opt(timestamp).single() {
        Some(time) => time.format("%H:%M").to_string(),
        None => String::new(),
    }
}

/// A chat message in the shared feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender's wallet address.
    pub sender: String,
    /// Message text as typed.
    pub message: String,
    /// Send time in epoch milliseconds.
    pub timestamp: i64,
}

impl ChatMessage {
    /// Creates a message stamped with the current time.
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// Whether the message was sent by `address`.
    pub fn is_from(&self, address: &str) -> bool {
        self.sender.eq_ignore_ascii_case(address)
    }

    /// Decodes a message from a database snapshot.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| ChatError::Malformed(format!("message: {e}")))
    }
}

/// The record stored under `users/{address}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Owning wallet address.
    pub address: String,
    /// Last connect or disconnect time in epoch milliseconds.
    pub last_seen: i64,
    /// Whether the user is currently connected.
    pub is_online: bool,
    /// Chosen display name.
    #[serde(default)]
    pub username: Option<String>,
    /// Hosted avatar URL.
    #[serde(default)]
    pub profile_pic: Option<String>,
}

impl UserRecord {
    /// Creates the record written when `address` connects.
    pub fn online(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            username: Some(short_address(&address)),
            address,
            last_seen: now_millis(),
            is_online: true,
            profile_pic: None,
        }
    }

    /// Returns the username, falling back to the short address.
    pub fn display_name(&self) -> String {
        match self.username.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => short_address(&self.address),
        }
    }

    /// Decodes a user record from a database snapshot.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| ChatError::Malformed(format!("user: {e}")))
    }
}

/// A partial write to a user record. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
}

impl UserUpdate {
    /// Update written when a user disconnects.
    pub fn offline() -> Self {
        Self {
            last_seen: Some(now_millis()),
            is_online: Some(false),
            ..Self::default()
        }
    }

    /// Update that renames a user.
    pub fn username(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    /// Update that sets the avatar URL.
    pub fn profile_pic(url: impl Into<String>) -> Self {
        Self {
            profile_pic: Some(url.into()),
            ..Self::default()
        }
    }

    /// Returns the update as a map of top-level fields.
    pub fn into_fields(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        }
    }
}

/// Local state of the settings dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsState {
    pub dark_mode: bool,
    pub notifications: bool,
    pub message_preview: bool,
    pub auto_connect: bool,
    pub language: String,
    pub username: String,
    pub profile_pic: Option<String>,
}

impl SettingsState {
    /// Default settings for `address`, named after its short form.
    pub fn for_address(address: &str) -> Self {
        Self {
            username: short_address(address),
            ..Self::default()
        }
    }
}

impl Default for SettingsState {
    fn default() -> Self {
        Self {
            dark_mode: true,
            notifications: true,
            message_preview: true,
            auto_connect: false,
            language: "en".to_string(),
            username: String::new(),
            profile_pic: None,
        }
    }
}
