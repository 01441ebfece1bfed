//! Credential storage.
//!
//! Tokens live in the store's settings table; the refresh flow itself is
//! driven by the HTTP layer, which writes the new access token back here.

use std::sync::{Arc, Mutex};

use crate::store::{DocumentStore, StoreError};

const ACCESS_TOKEN_KEY: &str = "auth.access_token";
const REFRESH_TOKEN_KEY: &str = "auth.refresh_token";
const USERNAME_KEY: &str = "auth.username";

/// Read/write access to the current user's tokens.
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn username(&self) -> Option<String>;
    fn set_access_token(&self, token: &str);
    fn set_refresh_token(&self, token: &str);
    fn clear(&self);
}

/// Settings-table-backed credential store.
pub struct SqliteCredentialStore {
    store: Arc<Mutex<DocumentStore>>,
}

impl SqliteCredentialStore {
    pub fn new(store: Arc<Mutex<DocumentStore>>) -> Self {
        Self { store }
    }

    pub fn save_login(&self, username: &str, access: &str, refresh: &str) -> Result<(), StoreError> {
        let store = self.store.lock().expect("store lock");
        store.settings_set(USERNAME_KEY, username)?;
        store.settings_set(ACCESS_TOKEN_KEY, access)?;
        store.settings_set(REFRESH_TOKEN_KEY, refresh)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        let store = self.store.lock().expect("store lock");
        store.settings_get(key).ok().flatten()
    }

    fn set(&self, key: &str, value: &str) {
        let store = self.store.lock().expect("store lock");
        if let Err(e) = store.settings_set(key, value) {
            tracing::warn!(error = %e, key, "failed to persist credential");
        }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.get(ACCESS_TOKEN_KEY)
    }

    fn refresh_token(&self) -> Option<String> {
        self.get(REFRESH_TOKEN_KEY)
    }

    fn username(&self) -> Option<String> {
        self.get(USERNAME_KEY)
    }

    fn set_access_token(&self, token: &str) {
        self.set(ACCESS_TOKEN_KEY, token);
    }

    fn set_refresh_token(&self, token: &str) {
        self.set(REFRESH_TOKEN_KEY, token);
    }

    fn clear(&self) {
        let store = self.store.lock().expect("store lock");
        for key in [USERNAME_KEY, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            let _ = store.settings_delete(key);
        }
    }
}

/// In-memory credential store for tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    access: Mutex<Option<String>>,
    refresh: Mutex<Option<String>>,
    username: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn with_tokens(username: &str, access: &str, refresh: &str) -> Self {
        Self {
            access: Mutex::new(Some(access.to_string())),
            refresh: Mutex::new(Some(refresh.to_string())),
            username: Mutex::new(Some(username.to_string())),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.access.lock().expect("lock").clone()
    }

    fn refresh_token(&self) -> Option<String> {
        self.refresh.lock().expect("lock").clone()
    }

    fn username(&self) -> Option<String> {
        self.username.lock().expect("lock").clone()
    }

    fn set_access_token(&self, token: &str) {
        *self.access.lock().expect("lock") = Some(token.to_string());
    }

    fn set_refresh_token(&self, token: &str) {
        *self.refresh.lock().expect("lock") = Some(token.to_string());
    }

    fn clear(&self) {
        *self.access.lock().expect("lock") = None;
        *self.refresh.lock().expect("lock") = None;
        *self.username.lock().expect("lock") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sqlite_store_round_trips_tokens() {
        let store = Arc::new(Mutex::new(DocumentStore::open_in_memory().unwrap()));
        let creds = SqliteCredentialStore::new(store);
        creds.save_login("ada", "acc", "ref").unwrap();
        assert_eq!(creds.username().as_deref(), Some("ada"));
        assert_eq!(creds.access_token().as_deref(), Some("acc"));
        creds.set_access_token("acc2");
        assert_eq!(creds.access_token().as_deref(), Some("acc2"));
        creds.clear();
        assert!(creds.access_token().is_none());
    }
}
