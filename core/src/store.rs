//! Persistent stored-user store with an authed-session cache
//!
//! Records live in a redb key/value database keyed by lowercased username,
//! serialized as self-describing JSON. Reads go through a bounded LRU
//! cache. Successful authentications are remembered per `(network, host)`
//! until logout, network disconnect, or the record is modified.

use std::path::Path;

use dashmap::DashMap;
use redb::{Database, ReadableDatabase, TableDefinition};
use tracing::debug;

use crate::cache::LruCache;
use crate::stored_user::StoredUser;
use crate::{Error, Result};

/// Main table: lowercased username -> StoredUser (serde_json).
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("stored_users");

/// Reserved for framework metadata.
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("__meta");

/// Default bound on the read cache.
const MAX_CACHE: usize = 1000;

fn session_key(network: &str, host: &str) -> String {
    format!("{}\0{}", network, host)
}

/// Persistent user store.
pub struct Store {
    db: Database,
    cache: LruCache<String, StoredUser>,
    authed: DashMap<String, StoredUser>,
}

impl Store {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_database(Database::create(path)?)
    }

    /// A memory-only store, used by tests and `no_store`-adjacent tooling.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::with_database(db)
    }

    fn with_database(db: Database) -> Result<Self> {
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(USERS)?;
            let _ = txn.open_table(META)?;
        }
        txn.commit()?;

        Ok(Self {
            db,
            cache: LruCache::new(MAX_CACHE),
            authed: DashMap::new(),
        })
    }

    /// Add or replace a user record. Any cached sessions for the same
    /// username are dropped so the next authentication revalidates fully.
    pub fn add_user(&self, user: &StoredUser) -> Result<()> {
        let serialized = serde_json::to_vec(user)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(USERS)?;
            table.insert(user.username(), serialized.as_slice())?;
        }
        txn.commit()?;

        self.invalidate_sessions(user.username());
        self.cache.insert(user.username().to_string(), user.clone());
        Ok(())
    }

    /// Remove a user record. Returns whether it existed.
    pub fn remove_user(&self, username: &str) -> Result<bool> {
        let username = username.to_lowercase();

        let txn = self.db.begin_write()?;
        let existed;
        {
            let mut table = txn.open_table(USERS)?;
            existed = table.remove(username.as_str())?.is_some();
        }
        txn.commit()?;

        self.invalidate_sessions(&username);
        self.cache.remove(&username);
        Ok(existed)
    }

    /// Look up a user by username, through the cache.
    pub fn find_user(&self, username: &str) -> Result<Option<StoredUser>> {
        let username = username.to_lowercase();
        if let Some(user) = self.cache.get(&username) {
            return Ok(Some(user));
        }

        let user = self.fetch_user(&username)?;
        if let Some(ref user) = user {
            self.cache.insert(username, user.clone());
        }
        Ok(user)
    }

    fn fetch_user(&self, username: &str) -> Result<Option<StoredUser>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(USERS)?;
        match table.get(username)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Authenticate a user for `(network, host)`.
    ///
    /// An existing session for the same username short-circuits; a session
    /// under a different username is treated as a miss. Otherwise the
    /// record is fetched, the host checked against the mask allowlist when
    /// one is set, and the password verified with bcrypt.
    pub fn auth_user(
        &self,
        network: &str,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<StoredUser> {
        let key = session_key(network, host);
        let username_lower = username.to_lowercase();

        if let Some(user) = self.authed.get(&key) {
            if user.username() == username_lower {
                return Ok(user.clone());
            }
        }

        let user = self
            .find_user(&username_lower)?
            .ok_or_else(|| Error::UserNotFound(username.to_string()))?;

        if !user.masks().is_empty() && !user.mask_matches(host) {
            return Err(Error::UserBadHost);
        }
        if !user.verify_password(password) {
            return Err(Error::UserBadPassword);
        }

        debug!(network, host, username = user.username(), "authenticated");
        self.authed.insert(key, user.clone());
        Ok(user)
    }

    /// The stored user currently authenticated for `(network, host)`.
    pub fn authed_user(&self, network: &str, host: &str) -> Option<StoredUser> {
        self.authed
            .get(&session_key(network, host))
            .map(|u| u.clone())
    }

    /// Drop one authenticated session.
    pub fn logout(&self, network: &str, host: &str) {
        self.authed.remove(&session_key(network, host));
    }

    /// Drop every session on a network, used when its connection is lost.
    pub fn logout_network(&self, network: &str) {
        let prefix = format!("{}\0", network);
        self.authed.retain(|key, _| !key.starts_with(&prefix));
    }

    fn invalidate_sessions(&self, username: &str) {
        self.authed.retain(|_, user| user.username() != username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COST: u32 = 4;

    fn store_with(users: &[StoredUser]) -> Store {
        let store = Store::in_memory().unwrap();
        for user in users {
            store.add_user(user).unwrap();
        }
        store
    }

    fn user(name: &str, password: &str) -> StoredUser {
        StoredUser::with_cost(name, password, COST).unwrap()
    }

    #[test]
    fn test_add_find_remove() {
        let store = store_with(&[user("alice", "pw")]);

        let found = store.find_user("ALICE").unwrap().unwrap();
        assert_eq!(found.username(), "alice");

        assert!(store.remove_user("alice").unwrap());
        assert!(!store.remove_user("alice").unwrap());
        assert!(store.find_user("alice").unwrap().is_none());
    }

    #[test]
    fn test_find_bypasses_cache_after_remove() {
        let store = store_with(&[user("alice", "pw")]);
        assert!(store.find_user("alice").unwrap().is_some());
        store.remove_user("alice").unwrap();
        assert!(store.find_user("alice").unwrap().is_none());
    }

    #[test]
    fn test_auth_user_success_and_session() {
        let store = store_with(&[user("alice", "pw")]);

        let authed = store.auth_user("net", "n!u@h", "alice", "pw").unwrap();
        assert_eq!(authed.username(), "alice");
        assert!(store.authed_user("net", "n!u@h").is_some());

        // Session short-circuits even with a wrong password.
        assert!(store.auth_user("net", "n!u@h", "alice", "bad").is_ok());

        store.logout("net", "n!u@h");
        assert!(store.authed_user("net", "n!u@h").is_none());
        assert!(matches!(
            store.auth_user("net", "n!u@h", "alice", "bad"),
            Err(Error::UserBadPassword)
        ));
    }

    #[test]
    fn test_auth_user_failures() {
        let mut restricted = user("bob", "pw");
        restricted.add_mask("*!*@trusted.org");
        let store = store_with(&[restricted]);

        assert!(matches!(
            store.auth_user("net", "x!y@z", "missing", "pw"),
            Err(Error::UserNotFound(_))
        ));
        assert!(matches!(
            store.auth_user("net", "bob!u@evil.org", "bob", "pw"),
            Err(Error::UserBadHost)
        ));
        assert!(store
            .auth_user("net", "bob!u@trusted.org", "bob", "pw")
            .is_ok());
    }

    #[test]
    fn test_session_under_other_username_is_miss() {
        let store = store_with(&[user("alice", "pw"), user("bob", "pw2")]);

        store.auth_user("net", "h!u@h", "alice", "pw").unwrap();
        let swapped = store.auth_user("net", "h!u@h", "bob", "pw2").unwrap();
        assert_eq!(swapped.username(), "bob");
    }

    #[test]
    fn test_modify_invalidates_sessions() {
        let store = store_with(&[user("alice", "pw")]);
        store.auth_user("net", "n!u@h", "alice", "pw").unwrap();

        let mut changed = user("alice", "newpw");
        changed.grant("net", "", 1, "o");
        store.add_user(&changed).unwrap();

        assert!(store.authed_user("net", "n!u@h").is_none());
        assert!(matches!(
            store.auth_user("net", "n!u@h", "alice", "pw"),
            Err(Error::UserBadPassword)
        ));
        assert!(store.auth_user("net", "n!u@h", "alice", "newpw").is_ok());
    }

    #[test]
    fn test_logout_network() {
        let store = store_with(&[user("alice", "pw")]);
        store.auth_user("net1", "a!u@h", "alice", "pw").unwrap();
        store.auth_user("net2", "a!u@h", "alice", "pw").unwrap();

        store.logout_network("net1");
        assert!(store.authed_user("net1", "a!u@h").is_none());
        assert!(store.authed_user("net2", "a!u@h").is_some());
    }

    #[test]
    fn test_persistence_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.redb");
        {
            let store = Store::open(&path).unwrap();
            store.add_user(&user("alice", "pw")).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let found = store.find_user("alice").unwrap().unwrap();
        assert!(found.verify_password("pw"));
    }
}
