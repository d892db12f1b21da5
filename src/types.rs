//! Type definitions and shared constants for BlockChat.

use thiserror::Error;

/// Remote list holding the append-only message feed.
pub const MESSAGES_PATH: &str = "messages";

/// Remote list holding one record per wallet address.
pub const USERS_PATH: &str = "users";

/// Alert shown when no wallet provider is available.
pub const WALLET_NOT_FOUND_ALERT: &str = "Wallet provider not found!";

/// Returns the remote path of the record owned by `address`.
pub fn user_path(address: &str) -> String {
    format!("{USERS_PATH}/{address}")
}

/// Errors that can occur during BlockChat operations.
#[derive(Error, Debug)]
pub enum ChatError {
    // Wallet Errors
    /// No wallet provider is configured.
    #[error("Wallet provider not found")]
    WalletNotFound,

    /// The wallet returned no accounts.
    #[error("Wallet returned no accounts")]
    NoAccounts,

    /// The wallet RPC call failed.
    #[error("Wallet RPC error {code}: {message}")]
    WalletRpc { code: i64, message: String },

    /// A wallet address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Remote Service Errors
    /// The realtime database rejected a request.
    #[error("Database error: {0}")]
    Database(String),

    /// The image host rejected an upload.
    #[error("Upload failed: {0}")]
    Upload(String),

    /// A remote payload did not have the expected shape.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    // Local Errors
    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
