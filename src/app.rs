//! Main BlockChat client and page routing.
//!
//! [`ChatApp`] composes the wallet session, message feed, presence directory
//! and profile settings. Remote failures are logged at the call site and
//! never retried; a missing wallet is surfaced through the [`Notifier`].

use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ChatConfig;
use crate::database::RealtimeDatabase;
use crate::feed::MessageFeed;
use crate::firebase::FirebaseDatabase;
use crate::models::UserRecord;
use crate::notify::Notifier;
use crate::presence::{PresenceDirectory, UserStore};
use crate::profile::ProfileSettings;
use crate::types::{ChatError, Result, WALLET_NOT_FOUND_ALERT};
use crate::upload::{ImageHost, ImgbbClient};
use crate::wallet::{JsonRpcWallet, WalletProvider, WalletSession};

/// A page of the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Route {
    /// Introduction page with the connect button.
    #[default]
    Landing,
    /// Contacts, feed and composer.
    Chat,
}

impl Route {
    /// Matches a known path. Unknown paths have no page of their own.
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim().trim_end_matches('/') {
            "" => Some(Route::Landing),
            "/chat" => Some(Route::Chat),
            _ => None,
        }
    }

    /// Resolves a path, falling back to the landing page.
    pub fn resolve(path: &str) -> Self {
        Self::from_path(path).unwrap_or_default()
    }

    pub fn path(&self) -> &'static str {
        match self {
            Route::Landing => "/",
            Route::Chat => "/chat",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Tracks the current page.
#[derive(Debug, Clone, Default)]
pub struct Router {
    current: Route,
}

impl Router {
    pub fn new(start: Route) -> Self {
        Self { current: start }
    }

    pub fn current(&self) -> Route {
        self.current
    }

    /// Moves to `path`. Unknown paths land on [`Route::Landing`].
    pub fn navigate(&mut self, path: &str) -> Route {
        self.current = Route::resolve(path);
        self.current
    }
}

/// External services the client talks to.
pub struct ChatServices {
    pub wallet: Option<Arc<dyn WalletProvider>>,
    pub database: Arc<dyn RealtimeDatabase>,
    pub mirror: Option<Arc<dyn RealtimeDatabase>>,
    pub images: Option<Arc<dyn ImageHost>>,
    pub notifier: Arc<dyn Notifier>,
}

impl ChatServices {
    /// Builds the hosted service clients described by `config`.
    pub fn from_config(config: &ChatConfig, notifier: Arc<dyn Notifier>) -> Self {
        let database = match &config.database_auth {
            Some(token) => FirebaseDatabase::new(&config.database_url).with_auth(token),
            None => FirebaseDatabase::new(&config.database_url),
        };
        let mirror = config.mirror_url.as_deref().map(|url| {
            let mirror = match &config.database_auth {
                Some(token) => FirebaseDatabase::new(url).with_auth(token),
                None => FirebaseDatabase::new(url),
            };
            Arc::new(mirror) as Arc<dyn RealtimeDatabase>
        });
        let wallet = config
            .wallet_rpc_url
            .as_deref()
            .map(|url| Arc::new(JsonRpcWallet::new(url)) as Arc<dyn WalletProvider>);
        let images = config
            .imgbb_key
            .as_deref()
            .map(|key| Arc::new(ImgbbClient::new(key)) as Arc<dyn ImageHost>);

        Self {
            wallet,
            database: Arc::new(database),
            mirror,
            images,
            notifier,
        }
    }
}

/// The chat client.
pub struct ChatApp {
    session: WalletSession,
    feed: MessageFeed,
    presence: PresenceDirectory,
    profile: ProfileSettings,
    notifier: Arc<dyn Notifier>,
    router: Router,
    active_contact: Option<String>,
}

impl ChatApp {
    pub fn new(services: ChatServices) -> Self {
        let mut store = UserStore::new(services.database.clone());
        if let Some(mirror) = services.mirror {
            store = store.with_mirror(mirror);
        }

        Self {
            session: WalletSession::new(services.wallet),
            feed: MessageFeed::new(services.database),
            presence: PresenceDirectory::new(store.clone()),
            profile: ProfileSettings::new(store, services.images),
            notifier: services.notifier,
            router: Router::default(),
            active_contact: None,
        }
    }

    /// Restores an already-authorised wallet and starts the feeds.
    pub async fn start(&mut self) -> Result<()> {
        match self.session.restore().await {
            Ok(Some(address)) => {
                let address = address.to_checksum(None);
                self.on_connected(&address).await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not restore wallet session"),
        }

        self.feed.subscribe().await?;
        self.presence.subscribe().await?;
        Ok(())
    }

    /// Checksummed address of the connected wallet.
    pub fn address(&self) -> Option<String> {
        self.session.address().map(|a| a.to_checksum(None))
    }

    /// Connects the wallet and marks the user online.
    ///
    /// Without a wallet provider the user is alerted and nothing changes.
    pub async fn connect(&mut self) -> Option<String> {
        match self.session.connect().await {
            Ok(address) => {
                let address = address.to_checksum(None);
                self.on_connected(&address).await;
                Some(address)
            }
            Err(ChatError::WalletNotFound) => {
                self.notifier.alert(WALLET_NOT_FOUND_ALERT);
                None
            }
            Err(e) => {
                error!(error = %e, "error connecting wallet");
                None
            }
        }
    }

    async fn on_connected(&mut self, address: &str) {
        self.profile.reset_for(address);
        if let Err(e) = self.presence.mark_online(address).await {
            error!(address, error = %e, "error saving user record");
        }
    }

    /// Marks the user offline and clears all local session state.
    ///
    /// Returns `false` when no wallet was connected.
    pub async fn disconnect(&mut self) -> bool {
        let Some(address) = self.address() else {
            return false;
        };

        if let Err(e) = self.presence.mark_offline(&address).await {
            error!(address = %address, error = %e, "error updating user record");
        }

        self.session.disconnect();
        self.active_contact = None;
        self.profile.close();
        info!(address = %address, "wallet disconnected");
        true
    }

    /// Sends `text` from the connected address. Blank text is ignored.
    pub async fn send(&self, text: &str) -> Option<String> {
        let address = self.address();
        match self.feed.send(address.as_deref(), text).await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "error sending message");
                None
            }
        }
    }

    /// Known users other than the connected one, with fresh online flags.
    pub async fn contacts(&self) -> Vec<UserRecord> {
        self.refresh_presence().await;
        self.presence.contacts(self.address().as_deref()).await
    }

    pub async fn search_contacts(&self, query: &str) -> Vec<UserRecord> {
        self.refresh_presence().await;
        self.presence.search(self.address().as_deref(), query).await
    }

    async fn refresh_presence(&self) {
        if let Err(e) = self.presence.refresh().await {
            warn!(error = %e, "could not refresh contacts, showing cached list");
        }
    }

    pub fn select_contact(&mut self, address: impl Into<String>) {
        self.active_contact = Some(address.into());
    }

    pub fn active_contact(&self) -> Option<&str> {
        self.active_contact.as_deref()
    }

    pub fn open_settings(&mut self) {
        self.profile.open();
    }

    pub fn close_settings(&mut self) {
        self.profile.close();
    }

    /// Changes the local username. Blank names are ignored and return `false`.
    pub fn set_username(&mut self, username: &str) -> bool {
        let username = username.trim();
        if username.is_empty() {
            return false;
        }
        self.profile.set_username(username);
        true
    }

    /// Saves the username. Returns whether the write succeeded.
    pub async fn save_settings(&mut self) -> bool {
        let Some(address) = self.address() else {
            return false;
        };
        match self.profile.save(&address).await {
            Ok(()) => true,
            Err(e) => {
                error!(address = %address, error = %e, "error saving settings");
                false
            }
        }
    }

    /// Uploads a profile picture for the connected user.
    pub async fn upload_avatar(&mut self, file_name: &str, bytes: Vec<u8>) -> Option<String> {
        let address = self.address()?;
        match self.profile.upload_avatar(&address, file_name, bytes).await {
            Ok(url) => Some(url),
            Err(e) => {
                error!(address = %address, error = %e, "error uploading image");
                None
            }
        }
    }

    /// Re-reads the wallet balance, in ether.
    pub async fn refresh_balance(&mut self) -> Option<String> {
        match self.session.refresh_balance().await {
            Ok(Some(_)) => Some(self.session.balance_display()),
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "error fetching balance");
                None
            }
        }
    }

    pub fn navigate(&mut self, path: &str) -> Route {
        self.router.navigate(path)
    }

    pub fn route(&self) -> Route {
        self.router.current()
    }

    pub fn session(&self) -> &WalletSession {
        &self.session
    }

    pub fn feed(&self) -> &MessageFeed {
        &self.feed
    }

    pub fn presence(&self) -> &PresenceDirectory {
        &self.presence
    }

    pub fn profile(&self) -> &ProfileSettings {
        &self.profile
    }
}
