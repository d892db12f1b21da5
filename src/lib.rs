//! BlockChat - wallet-authenticated chat
//!
//! Rust client for a chat where identity is a wallet address and messages
//! and presence live in a hosted realtime database.

mod types;
mod models;
mod wallet;
mod database;
mod firebase;
mod upload;
mod notify;
mod feed;
mod presence;
mod profile;
mod config;
mod app;

pub use types::*;
pub use models::*;
pub use wallet::*;
pub use database::*;
pub use firebase::*;
pub use upload::*;
pub use notify::*;
pub use feed::*;
pub use presence::*;
pub use profile::*;
pub use config::*;
pub use app::*;
