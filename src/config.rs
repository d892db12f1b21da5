//! Runtime configuration loaded from environment variables.

use std::env;

use crate::types::{ChatError, Result};

pub const DATABASE_URL_VAR: &str = "BLOCKCHAT_DATABASE_URL";
pub const DATABASE_AUTH_VAR: &str = "BLOCKCHAT_DATABASE_AUTH";
pub const MIRROR_URL_VAR: &str = "BLOCKCHAT_MIRROR_URL";
pub const WALLET_RPC_URL_VAR: &str = "BLOCKCHAT_WALLET_RPC_URL";
pub const IMGBB_KEY_VAR: &str = "BLOCKCHAT_IMGBB_KEY";

/// Default address of the realtime database emulator.
pub const EMULATOR_DATABASE_URL: &str = "http://127.0.0.1:9000";

/// Default JSON-RPC address of a local development node.
pub const LOCAL_WALLET_RPC_URL: &str = "http://127.0.0.1:8545";

/// Endpoints and credentials for the external services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Realtime database base URL.
    pub database_url: String,
    /// Database auth token, sent as the `auth` query parameter.
    pub database_auth: Option<String>,
    /// Second database that receives a copy of every user-record write.
    pub mirror_url: Option<String>,
    /// Wallet JSON-RPC endpoint. `None` means no wallet is available.
    pub wallet_rpc_url: Option<String>,
    /// Image host API key. `None` disables avatar uploads.
    pub imgbb_key: Option<String>,
}

impl ChatConfig {
    /// Creates a configuration for the database at `database_url`.
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            database_auth: None,
            mirror_url: None,
            wallet_rpc_url: None,
            imgbb_key: None,
        }
    }

    /// Creates configuration for the local database emulator and a local
    /// development node as the wallet.
    pub fn emulator() -> Self {
        Self::new(EMULATOR_DATABASE_URL).with_wallet(LOCAL_WALLET_RPC_URL)
    }

    /// Sets the wallet endpoint.
    pub fn with_wallet(mut self, rpc_url: &str) -> Self {
        self.wallet_rpc_url = Some(rpc_url.to_string());
        self
    }

    /// Sets the image host key.
    pub fn with_imgbb_key(mut self, key: &str) -> Self {
        self.imgbb_key = Some(key.to_string());
        self
    }

    /// Loads configuration from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|v| sanitize(&v))
                .filter(|v| !v.is_empty())
        };

        let database_url = read(DATABASE_URL_VAR)
            .ok_or_else(|| ChatError::Config(format!("missing {DATABASE_URL_VAR}")))?;
        if !database_url.starts_with("http://") && !database_url.starts_with("https://") {
            return Err(ChatError::Config(format!(
                "{DATABASE_URL_VAR} must be an http(s) URL, got {database_url}"
            )));
        }

        Ok(Self {
            database_url,
            database_auth: read(DATABASE_AUTH_VAR),
            mirror_url: read(MIRROR_URL_VAR),
            wallet_rpc_url: read(WALLET_RPC_URL_VAR),
            imgbb_key: read(IMGBB_KEY_VAR),
        })
    }
}

/// Trims whitespace and one pair of surrounding quotes.
fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    unquoted.to_string()
}
