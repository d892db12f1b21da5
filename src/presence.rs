//! User records and the online-contacts directory.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::database::RealtimeDatabase;
use crate::models::{UserRecord, UserUpdate};
use crate::types::{user_path, Result, USERS_PATH};

const UPDATE_CAPACITY: usize = 64;

/// Reads and writes `users/{address}` records.
///
/// Every write is repeated on the optional mirror store. Mirror failures are
/// logged and never fail the primary write.
#[derive(Clone)]
pub struct UserStore {
    primary: Arc<dyn RealtimeDatabase>,
    mirror: Option<Arc<dyn RealtimeDatabase>>,
}

impl UserStore {
    pub fn new(primary: Arc<dyn RealtimeDatabase>) -> Self {
        Self {
            primary,
            mirror: None,
        }
    }

    /// Repeats every write on `mirror`.
    pub fn with_mirror(mut self, mirror: Arc<dyn RealtimeDatabase>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn database(&self) -> &Arc<dyn RealtimeDatabase> {
        &self.primary
    }

    /// Replaces the whole record of `record.address`.
    pub async fn put(&self, record: &UserRecord) -> Result<()> {
        let path = user_path(&record.address);
        let value = serde_json::to_value(record)?;
        self.primary.set(&path, value.clone()).await?;

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.set(&path, value).await {
                warn!(address = %record.address, error = %e, "mirror write failed");
            }
        }
        Ok(())
    }

    /// Merges `update` into the record of `address`.
    pub async fn update(&self, address: &str, update: UserUpdate) -> Result<()> {
        let path = user_path(address);
        let fields = update.into_fields();
        self.primary.update(&path, fields.clone()).await?;

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.update(&path, fields).await {
                warn!(address, error = %e, "mirror update failed");
            }
        }
        Ok(())
    }

    /// Reads the record of `address`.
    pub async fn get(&self, address: &str) -> Result<Option<UserRecord>> {
        match self.primary.get(&user_path(address)).await? {
            Some(value) => UserRecord::from_value(value).map(Some),
            None => Ok(None),
        }
    }

    /// Reads every record, ordered by key.
    pub async fn all(&self) -> Result<Vec<UserRecord>> {
        let Some(Value::Object(map)) = self.primary.get(USERS_PATH).await? else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, Value)> = map.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match UserRecord::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping user record");
                    None
                }
            })
            .collect())
    }
}

/// Local list of known users, fed by the remote `users` list.
pub struct PresenceDirectory {
    store: UserStore,
    users: Arc<RwLock<Vec<UserRecord>>>,
    updates: broadcast::Sender<UserRecord>,
    listener: Option<JoinHandle<()>>,
}

impl PresenceDirectory {
    pub fn new(store: UserStore) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            store,
            users: Arc::new(RwLock::new(Vec::new())),
            updates,
            listener: None,
        }
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    /// Starts mirroring the remote user list. Calling it again is a no-op.
    pub async fn subscribe(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }

        let mut rx = self.store.database().on_child_added(USERS_PATH).await?;
        let users = self.users.clone();
        let updates = self.updates.clone();

        self.listener = Some(tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                match UserRecord::from_value(snapshot.value) {
                    Ok(record) => {
                        merge(&mut *users.write().await, record.clone());
                        let _ = updates.send(record);
                    }
                    Err(e) => warn!(key = %snapshot.key, error = %e, "skipping user record"),
                }
            }
            debug!("presence feed closed");
        }));
        Ok(())
    }

    /// Receives every user record mirrored from now on.
    pub fn watch(&self) -> broadcast::Receiver<UserRecord> {
        self.updates.subscribe()
    }

    /// Re-reads all records so online flags reflect the remote state.
    ///
    /// Returns the number of records read.
    pub async fn refresh(&self) -> Result<usize> {
        let records = self.store.all().await?;
        let count = records.len();
        let mut users = self.users.write().await;
        for record in records {
            replace(&mut users, record);
        }
        Ok(count)
    }

    /// Writes a fresh online record for `address`.
    pub async fn mark_online(&self, address: &str) -> Result<UserRecord> {
        let record = UserRecord::online(address);
        self.store.put(&record).await?;
        info!(address, "user online");
        Ok(record)
    }

    /// Flags `address` as offline and stamps its last-seen time.
    pub async fn mark_offline(&self, address: &str) -> Result<()> {
        self.store.update(address, UserUpdate::offline()).await?;
        info!(address, "user offline");
        Ok(())
    }

    /// Every known user.
    pub async fn users(&self) -> Vec<UserRecord> {
        self.users.read().await.clone()
    }

    /// Every known user except `self_address`.
    pub async fn contacts(&self, self_address: Option<&str>) -> Vec<UserRecord> {
        self.users
            .read()
            .await
            .iter()
            .filter(|u| !is_same(&u.address, self_address))
            .cloned()
            .collect()
    }

    /// Contacts whose username or address contains `query`, ignoring case.
    pub async fn search(&self, self_address: Option<&str>, query: &str) -> Vec<UserRecord> {
        let query = query.trim().to_lowercase();
        let mut contacts = self.contacts(self_address).await;
        if !query.is_empty() {
            contacts.retain(|u| {
                u.address.to_lowercase().contains(&query)
                    || u.username
                        .as_deref()
                        .is_some_and(|name| name.to_lowercase().contains(&query))
            });
        }
        contacts
    }

    /// The known record for `address`.
    pub async fn find(&self, address: &str) -> Option<UserRecord> {
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.address.eq_ignore_ascii_case(address))
            .cloned()
    }

    /// Username of `address`, or its short form when unknown.
    pub async fn display_name(&self, address: &str) -> String {
        match self.find(address).await {
            Some(record) => record.display_name(),
            None => crate::models::short_address(address),
        }
    }
}

impl Drop for PresenceDirectory {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Stores `record` in place of the entry with the same address.
fn replace(users: &mut Vec<UserRecord>, record: UserRecord) {
    match users
        .iter_mut()
        .find(|u| u.address.eq_ignore_ascii_case(&record.address))
    {
        Some(existing) => *existing = record,
        None => users.push(record),
    }
}

/// Like [`replace`], but keeps an entry that is newer than `record`.
fn merge(users: &mut Vec<UserRecord>, record: UserRecord) {
    let newer_known = users
        .iter()
        .any(|u| u.address.eq_ignore_ascii_case(&record.address) && u.last_seen > record.last_seen);
    if !newer_known {
        replace(users, record);
    }
}

fn is_same(address: &str, other: Option<&str>) -> bool {
    other.is_some_and(|o| o.eq_ignore_ascii_case(address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryDatabase;
    use serde_json::json;

    const ALICE: &str = "0x52908400098527886E0F7030069857D2E4169EE7";
    const BOB: &str = "0x8617E340B3D01FA5F11F306F4090FD50E238070D";

    fn directory(db: &InMemoryDatabase) -> PresenceDirectory {
        PresenceDirectory::new(UserStore::new(Arc::new(db.clone())))
    }

    #[tokio::test]
    async fn test_online_flag_toggles() {
        let db = InMemoryDatabase::new();
        let presence = directory(&db);

        presence.mark_online(ALICE).await.unwrap();
        let record = presence.store().get(ALICE).await.unwrap().unwrap();
        assert!(record.is_online);
        assert_eq!(record.username.as_deref(), Some("0x5290...9EE7"));
        let first_seen = record.last_seen;

        presence.mark_offline(ALICE).await.unwrap();
        let record = presence.store().get(ALICE).await.unwrap().unwrap();
        assert!(!record.is_online);
        assert!(record.last_seen >= first_seen);
        assert_eq!(record.username.as_deref(), Some("0x5290...9EE7"));

        presence.mark_online(ALICE).await.unwrap();
        assert!(presence.store().get(ALICE).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_reconnect_resets_username() {
        let db = InMemoryDatabase::new();
        let presence = directory(&db);
        presence.mark_online(ALICE).await.unwrap();
        presence
            .store()
            .update(ALICE, UserUpdate::username("alice"))
            .await
            .unwrap();

        presence.mark_online(ALICE).await.unwrap();
        let record = presence.store().get(ALICE).await.unwrap().unwrap();
        assert_eq!(record.username.as_deref(), Some("0x5290...9EE7"));
    }

    #[tokio::test]
    async fn test_contacts_exclude_self() {
        let db = InMemoryDatabase::new();
        let mut presence = directory(&db);
        let mut updates = presence.watch();
        presence.subscribe().await.unwrap();

        presence.mark_online(ALICE).await.unwrap();
        presence.mark_online(BOB).await.unwrap();
        updates.recv().await.unwrap();
        updates.recv().await.unwrap();

        let contacts = presence.contacts(Some(&ALICE.to_lowercase())).await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].address, BOB);
        assert_eq!(presence.contacts(None).await.len(), 2);
    }

    #[tokio::test]
    async fn test_search_and_display_name() {
        let db = InMemoryDatabase::new();
        db.set(
            &user_path(BOB),
            json!({"address": BOB, "lastSeen": 1, "isOnline": true, "username": "Bobby"}),
        )
        .await
        .unwrap();
        let presence = directory(&db);
        presence.refresh().await.unwrap();

        assert_eq!(presence.search(Some(ALICE), "bob").await.len(), 1);
        assert_eq!(presence.search(Some(ALICE), "8617e3").await.len(), 1);
        assert!(presence.search(Some(ALICE), "carol").await.is_empty());
        assert_eq!(presence.search(Some(ALICE), "  ").await.len(), 1);

        assert_eq!(presence.display_name(BOB).await, "Bobby");
        assert_eq!(presence.display_name(ALICE).await, "0x5290...9EE7");
    }

    #[tokio::test]
    async fn test_refresh_picks_up_offline_flag() {
        let db = InMemoryDatabase::new();
        let presence = directory(&db);
        presence.mark_online(BOB).await.unwrap();
        presence.refresh().await.unwrap();
        assert!(presence.find(BOB).await.unwrap().is_online);

        presence.mark_offline(BOB).await.unwrap();
        assert_eq!(presence.refresh().await.unwrap(), 1);
        assert!(!presence.find(BOB).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_refresh_after_subscribe_keeps_one_entry_per_address() {
        let db = InMemoryDatabase::new();
        db.set(
            &user_path(BOB),
            json!({"address": BOB, "lastSeen": 1, "isOnline": true}),
        )
        .await
        .unwrap();
        let mut presence = directory(&db);
        let mut updates = presence.watch();

        presence.subscribe().await.unwrap();
        presence.refresh().await.unwrap();
        updates.recv().await.unwrap();

        assert_eq!(presence.contacts(Some(ALICE)).await.len(), 1);
        assert_eq!(presence.users().await.len(), 1);
    }

    #[test]
    fn test_merge_keeps_newer_entry() {
        let mut users = Vec::new();
        let fresh = UserRecord {
            address: BOB.to_string(),
            last_seen: 20,
            is_online: false,
            username: None,
            profile_pic: None,
        };
        let stale = UserRecord {
            last_seen: 10,
            is_online: true,
            ..fresh.clone()
        };

        replace(&mut users, fresh.clone());
        merge(&mut users, stale);
        assert_eq!(users, vec![fresh.clone()]);

        let newer = UserRecord {
            last_seen: 30,
            is_online: true,
            ..fresh
        };
        merge(&mut users, newer.clone());
        assert_eq!(users, vec![newer]);
    }

    #[tokio::test]
    async fn test_mirror_receives_writes() {
        let primary = InMemoryDatabase::new();
        let mirror = InMemoryDatabase::new();
        let store = UserStore::new(Arc::new(primary.clone())).with_mirror(Arc::new(mirror.clone()));
        let presence = PresenceDirectory::new(store);

        presence.mark_online(ALICE).await.unwrap();
        presence.mark_offline(ALICE).await.unwrap();

        let mirrored = mirror.get(&user_path(ALICE)).await.unwrap().unwrap();
        assert_eq!(mirrored["isOnline"], false);
        assert_eq!(mirrored, primary.get(&user_path(ALICE)).await.unwrap().unwrap());
    }
}
