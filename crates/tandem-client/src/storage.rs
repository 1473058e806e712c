//! Secure key-value storage for credentials.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use tandem_shared::{PrivateKey, UserId};

pub const KEY_USER_TOKEN: &str = "userToken";
pub const KEY_USER_ID: &str = "userId";
pub const KEY_PRIVATE_KEY: &str = "privateKey";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Secure storage unavailable: {0}")]
    Unavailable(String),
}

/// Platform secure storage (keychain, keystore, ...).
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding a logged-in session.
    pub fn with_credentials(token: &str, user_id: &UserId, private_key: Option<&PrivateKey>) -> Self {
        let mut values = HashMap::new();
        values.insert(KEY_USER_TOKEN.to_string(), token.to_string());
        values.insert(KEY_USER_ID.to_string(), user_id.as_str().to_string());
        if let Some(key) = private_key {
            values.insert(KEY_PRIVATE_KEY.to_string(), key.as_str().to_string());
        }
        Self {
            values: RwLock::new(values),
        }
    }
}

#[async_trait]
impl SecureStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// What a logged-in client reads from secure storage.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
    /// Absent until the key pair has been provisioned on this device.
    pub private_key: Option<PrivateKey>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

impl Credentials {
    /// Returns `None` when no token or user id is stored.
    pub async fn load(store: &dyn SecureStore) -> Result<Option<Self>, StoreError> {
        let token = store.get(KEY_USER_TOKEN).await?.filter(|t| !t.is_empty());
        let user_id = store.get(KEY_USER_ID).await?.filter(|u| !u.is_empty());
        let (Some(token), Some(user_id)) = (token, user_id) else {
            return Ok(None);
        };
        let private_key = store
            .get(KEY_PRIVATE_KEY)
            .await?
            .filter(|k| !k.is_empty())
            .map(PrivateKey);

        Ok(Some(Self {
            token,
            user_id: UserId::new(user_id),
            private_key,
        }))
    }

    pub async fn clear(store: &dyn SecureStore) -> Result<(), StoreError> {
        for key in [KEY_USER_TOKEN, KEY_USER_ID, KEY_PRIVATE_KEY] {
            store.delete(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_credentials() {
        let key = PrivateKey("ab".repeat(32));
        let store = MemoryStore::with_credentials("tok", &UserId::from("alice"), Some(&key));
        let creds = Credentials::load(&store).await.unwrap().unwrap();
        assert_eq!(creds.token, "tok");
        assert_eq!(creds.user_id.as_str(), "alice");
        assert_eq!(creds.private_key, Some(key));
    }

    #[tokio::test]
    async fn test_missing_private_key_is_not_fatal() {
        let store = MemoryStore::with_credentials("tok", &UserId::from("alice"), None);
        let creds = Credentials::load(&store).await.unwrap().unwrap();
        assert!(creds.private_key.is_none());
    }

    #[tokio::test]
    async fn test_missing_token_means_logged_out() {
        let store = MemoryStore::new();
        store.set(KEY_USER_ID, "alice").await.unwrap();
        assert!(Credentials::load(&store).await.unwrap().is_none());

        store.set(KEY_USER_TOKEN, "").await.unwrap();
        assert!(Credentials::load(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_credentials() {
        let store = MemoryStore::with_credentials("tok", &UserId::from("alice"), None);
        Credentials::clear(&store).await.unwrap();
        assert!(Credentials::load(&store).await.unwrap().is_none());
    }
}
