use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use tandem_shared::crypto::{derive_secret, SharedSecret};
use tandem_shared::{CryptoError, PrivateKey, PublicKey, UserId};

/// Conversation secrets, derived on first use and kept for the lifetime
/// of the process. Never persisted.
#[derive(Debug, Default)]
pub struct SecretCache {
    secrets: RwLock<HashMap<UserId, SharedSecret>>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, partner: &UserId) -> Option<SharedSecret> {
        self.secrets.read().await.get(partner).cloned()
    }

    /// Cached secret for `partner`, deriving it if needed. An entry is
    /// written at most once; concurrent first uses agree on the first
    /// value stored.
    pub async fn get_or_derive(
        &self,
        partner: &UserId,
        local_private: Option<&PrivateKey>,
        remote_public: Option<&PublicKey>,
    ) -> Result<SharedSecret, CryptoError> {
        if let Some(secret) = self.get(partner).await {
            return Ok(secret);
        }

        let secret = derive_secret(local_private, remote_public)?;
        let mut secrets = self.secrets.write().await;
        let stored = secrets.entry(partner.clone()).or_insert_with(|| {
            debug!(partner = %partner.short(), "Derived conversation secret");
            secret
        });
        Ok(stored.clone())
    }

    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn clear(&self) {
        self.secrets.write().await.clear();
    }
}
