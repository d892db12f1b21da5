//! Wallet provider interface and the in-memory wallet session.
//!
//! The provider is any EIP-1193 style endpoint answering JSON-RPC account
//! requests. [`WalletSession`] wraps it with the connect/disconnect state the
//! chat client needs; nothing here is persisted.

use alloy_primitives::utils::format_ether;
use alloy_primitives::{Address, U256};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::types::{ChatError, Result};

/// Trait for talking to a wallet provider.
#[async_trait::async_trait]
pub trait WalletProvider: Send + Sync {
    /// Ask the wallet to expose its accounts, prompting the user if needed.
    async fn request_accounts(&self) -> Result<Vec<Address>>;

    /// Accounts already exposed to this client, without prompting.
    async fn accounts(&self) -> Result<Vec<Address>>;

    /// Id of the network the wallet is on.
    async fn chain_id(&self) -> Result<u64>;

    /// Balance of `address` in wei at the latest block.
    async fn balance(&self, address: Address) -> Result<U256>;
}

/// Parses a hex address as returned by a wallet.
pub fn parse_address(raw: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| ChatError::InvalidAddress(raw.to_string()))
}

/// Renders a wei amount in ether without trailing zeros.
pub fn format_balance(wei: U256) -> String {
    let ether = format_ether(wei);
    match ether.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                format!("{whole}.0")
            } else {
                format!("{whole}.{fraction}")
            }
        }
        None => ether,
    }
}

// ============================================================================
// JSON-RPC Wallet
// ============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Wallet provider reached over JSON-RPC 2.0.
pub struct JsonRpcWallet {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcWallet {
    /// Creates a wallet client for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "wallet rpc request");
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ChatError::WalletRpc {
                code: error.code,
                message: error.message,
            });
        }

        let result = response
            .result
            .ok_or_else(|| ChatError::Malformed(format!("{method}: missing result")))?;
        Ok(serde_json::from_value(result)?)
    }

    fn parse_accounts(raw: Vec<String>) -> Result<Vec<Address>> {
        raw.iter().map(|a| parse_address(a)).collect()
    }
}

#[async_trait::async_trait]
impl WalletProvider for JsonRpcWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>> {
        let raw: Vec<String> = self.call("eth_requestAccounts", json!([])).await?;
        Self::parse_accounts(raw)
    }

    async fn accounts(&self) -> Result<Vec<Address>> {
        let raw: Vec<String> = self.call("eth_accounts", json!([])).await?;
        Self::parse_accounts(raw)
    }

    async fn chain_id(&self) -> Result<u64> {
        let raw: String = self.call("eth_chainId", json!([])).await?;
        u64::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|_| ChatError::Malformed(format!("eth_chainId: {raw}")))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        let raw: String = self
            .call(
                "eth_getBalance",
                json!([address.to_checksum(None), "latest"]),
            )
            .await?;
        U256::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|_| ChatError::Malformed(format!("eth_getBalance: {raw}")))
    }
}

// ============================================================================
// Static Wallet
// ============================================================================

/// In-memory wallet provider with a fixed account list.
///
/// Accounts stay hidden from [`WalletProvider::accounts`] until
/// [`WalletProvider::request_accounts`] has been called once, the way a
/// browser wallet behaves before the user approves the site.
pub struct StaticWallet {
    accounts: Vec<Address>,
    chain_id: u64,
    balances: HashMap<Address, U256>,
    authorized: AtomicBool,
    reject: bool,
}

impl StaticWallet {
    /// Creates a wallet exposing `accounts` on chain `chain_id`.
    pub fn new(accounts: Vec<Address>, chain_id: u64) -> Self {
        Self {
            accounts,
            chain_id,
            balances: HashMap::new(),
            authorized: AtomicBool::new(false),
            reject: false,
        }
    }

    /// Sets the balance reported for `address`.
    pub fn with_balance(mut self, address: Address, wei: U256) -> Self {
        self.balances.insert(address, wei);
        self
    }

    /// Treats the site as already approved.
    pub fn authorized(self) -> Self {
        self.authorized.store(true, Ordering::Relaxed);
        self
    }

    /// Makes every account request fail as if the user declined.
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }
}

#[async_trait::async_trait]
impl WalletProvider for StaticWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>> {
        if self.reject {
            return Err(ChatError::WalletRpc {
                code: 4001,
                message: "User rejected the request.".to_string(),
            });
        }
        self.authorized.store(true, Ordering::Relaxed);
        Ok(self.accounts.clone())
    }

    async fn accounts(&self) -> Result<Vec<Address>> {
        if self.authorized.load(Ordering::Relaxed) {
            Ok(self.accounts.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self.balances.get(&address).copied().unwrap_or(U256::ZERO))
    }
}

// ============================================================================
// Wallet Session
// ============================================================================

/// The connected account bound to the provider that exposed it.
#[derive(Clone)]
pub struct Signer {
    address: Address,
    provider: Arc<dyn WalletProvider>,
}

impl Signer {
    /// Returns the signer's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Reads the signer's current balance.
    pub async fn balance(&self) -> Result<U256> {
        self.provider.balance(self.address).await
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Connection state of the wallet, held in memory only.
#[derive(Clone, Default)]
pub struct WalletSessionState {
    pub is_connected: bool,
    pub address: Option<Address>,
    pub provider: Option<Arc<dyn WalletProvider>>,
    pub signer: Option<Signer>,
    pub balance: Option<U256>,
    pub chain_id: Option<u64>,
}

impl fmt::Debug for WalletSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSessionState")
            .field("is_connected", &self.is_connected)
            .field("address", &self.address)
            .field("provider", &self.provider.is_some())
            .field("signer", &self.signer)
            .field("balance", &self.balance)
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

/// Tracks whether a wallet is connected and which account it exposed.
pub struct WalletSession {
    provider: Option<Arc<dyn WalletProvider>>,
    state: WalletSessionState,
}

impl WalletSession {
    /// Creates a session. `None` means no wallet provider is available.
    pub fn new(provider: Option<Arc<dyn WalletProvider>>) -> Self {
        Self {
            provider,
            state: WalletSessionState::default(),
        }
    }

    /// Returns the current session state.
    pub fn state(&self) -> &WalletSessionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected
    }

    pub fn address(&self) -> Option<Address> {
        self.state.address
    }

    pub fn signer(&self) -> Option<&Signer> {
        self.state.signer.as_ref()
    }

    /// Whether a wallet provider is available at all.
    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn provider(&self) -> Option<&Arc<dyn WalletProvider>> {
        self.provider.as_ref()
    }

    /// Requests accounts from the wallet and adopts the first one.
    ///
    /// Fails with [`ChatError::WalletNotFound`] when no provider exists; the
    /// session is left untouched on every error.
    pub async fn connect(&mut self) -> Result<Address> {
        let provider = self.provider.clone().ok_or(ChatError::WalletNotFound)?;
        let accounts = provider.request_accounts().await?;
        let address = *accounts.first().ok_or(ChatError::NoAccounts)?;
        self.establish(provider, address).await;
        Ok(address)
    }

    /// Adopts an account the wallet already exposes, or falls back to
    /// [`connect`](Self::connect). Without a provider this does nothing.
    pub async fn restore(&mut self) -> Result<Option<Address>> {
        let Some(provider) = self.provider.clone() else {
            return Ok(None);
        };

        let accounts = provider.accounts().await?;
        match accounts.first() {
            Some(&address) => {
                self.establish(provider, address).await;
                Ok(Some(address))
            }
            None => self.connect().await.map(Some),
        }
    }

    /// Clears all session state.
    pub fn disconnect(&mut self) {
        if let Some(address) = self.state.address {
            info!(address = %address, "wallet session cleared");
        }
        self.state = WalletSessionState::default();
    }

    /// Re-reads the balance of the connected account.
    pub async fn refresh_balance(&mut self) -> Result<Option<U256>> {
        let Some(signer) = self.state.signer.clone() else {
            return Ok(None);
        };
        let balance = signer.balance().await?;
        self.state.balance = Some(balance);
        Ok(Some(balance))
    }

    /// The last known balance in ether, `0` when unknown.
    pub fn balance_display(&self) -> String {
        self.state
            .balance
            .map(format_balance)
            .unwrap_or_else(|| "0".to_string())
    }

    async fn establish(&mut self, provider: Arc<dyn WalletProvider>, address: Address) {
        let chain_id = match provider.chain_id().await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to read chain id");
                None
            }
        };
        let balance = match provider.balance(address).await {
            Ok(wei) => Some(wei),
            Err(e) => {
                warn!(error = %e, address = %address, "failed to read balance");
                None
            }
        };

        self.state = WalletSessionState {
            is_connected: true,
            address: Some(address),
            provider: Some(provider.clone()),
            signer: Some(Signer { address, provider }),
            balance,
            chain_id,
        };
        info!(address = %address, chain_id = ?chain_id, "wallet connected");
    }
}
