//! Profile settings: username and avatar.

use std::sync::Arc;
use tracing::info;

use crate::models::{SettingsState, UserUpdate};
use crate::presence::UserStore;
use crate::types::{ChatError, Result};
use crate::upload::ImageHost;

/// Settings dialog state and the writes it performs.
pub struct ProfileSettings {
    store: UserStore,
    images: Option<Arc<dyn ImageHost>>,
    settings: SettingsState,
    open: bool,
}

impl ProfileSettings {
    /// Creates settings backed by `store`. Without an image host avatar
    /// uploads fail with a configuration error.
    pub fn new(store: UserStore, images: Option<Arc<dyn ImageHost>>) -> Self {
        Self {
            store,
            images,
            settings: SettingsState::default(),
            open: false,
        }
    }

    pub fn settings(&self) -> &SettingsState {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SettingsState {
        &mut self.settings
    }

    /// Resets the local username to the short form of `address`.
    pub fn reset_for(&mut self, address: &str) {
        self.settings.username = SettingsState::for_address(address).username;
        self.settings.profile_pic = None;
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.settings.username = username.into();
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open(&mut self) {
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    /// Writes the local username to the record of `address` and closes the
    /// dialog. The dialog stays open when the write fails.
    pub async fn save(&mut self, address: &str) -> Result<()> {
        self.store
            .update(address, UserUpdate::username(self.settings.username.clone()))
            .await?;
        info!(address, username = %self.settings.username, "settings saved");
        self.open = false;
        Ok(())
    }

    /// Uploads an avatar and stores its URL on the record of `address`.
    pub async fn upload_avatar(
        &mut self,
        address: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let images = self
            .images
            .as_ref()
            .ok_or_else(|| ChatError::Config("no image host configured".to_string()))?;

        let url = images.upload(file_name, bytes).await?;
        self.store
            .update(address, UserUpdate::profile_pic(url.clone()))
            .await?;
        self.settings.profile_pic = Some(url.clone());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryDatabase;
    use crate::presence::PresenceDirectory;
    use crate::upload::InMemoryImageHost;

    const ALICE: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    fn setup(images: Option<Arc<dyn ImageHost>>) -> (PresenceDirectory, ProfileSettings) {
        let store = UserStore::new(Arc::new(InMemoryDatabase::new()));
        (
            PresenceDirectory::new(store.clone()),
            ProfileSettings::new(store, images),
        )
    }

    #[tokio::test]
    async fn test_save_username() {
        let (presence, mut profile) = setup(None);
        presence.mark_online(ALICE).await.unwrap();

        profile.reset_for(ALICE);
        assert_eq!(profile.settings().username, "0x5290...9EE7");

        profile.open();
        profile.set_username("alice");
        profile.save(ALICE).await.unwrap();

        assert!(!profile.is_open());
        let record = presence.store().get(ALICE).await.unwrap().unwrap();
        assert_eq!(record.username.as_deref(), Some("alice"));
        assert!(record.is_online);
    }

    #[tokio::test]
    async fn test_upload_avatar() {
        let host = Arc::new(InMemoryImageHost::new());
        let images: Arc<dyn ImageHost> = host.clone();
        let (presence, mut profile) = setup(Some(images));
        presence.mark_online(ALICE).await.unwrap();

        let url = profile
            .upload_avatar(ALICE, "me.png", vec![0x89, 0x50, 0x4e, 0x47])
            .await
            .unwrap();

        assert_eq!(host.upload_count(), 1);
        assert_eq!(profile.settings().profile_pic.as_deref(), Some(url.as_str()));
        let record = presence.store().get(ALICE).await.unwrap().unwrap();
        assert_eq!(record.profile_pic, Some(url));
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_record() {
        let images: Arc<dyn ImageHost> = Arc::new(InMemoryImageHost::failing());
        let (presence, mut profile) = setup(Some(images));
        presence.mark_online(ALICE).await.unwrap();

        assert!(profile.upload_avatar(ALICE, "me.png", vec![1]).await.is_err());
        assert_eq!(profile.settings().profile_pic, None);
        let record = presence.store().get(ALICE).await.unwrap().unwrap();
        assert_eq!(record.profile_pic, None);
    }

    #[tokio::test]
    async fn test_upload_without_host() {
        let (_, mut profile) = setup(None);
        let err = profile.upload_avatar(ALICE, "me.png", vec![1]).await.unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }
}
