use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use tandem_shared::crypto::{self, SharedSecret};
use tandem_shared::{CryptoError, KeySide, PrivateKey, UserId};

use crate::api::{ChatApi, UserProfile};
use crate::error::ClientError;
use crate::secrets::SecretCache;

/// Shown in place of a body that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt]";

/// Local key material plus the partner profiles and secrets derived from
/// them. Shared by the client and the inbound bridge.
pub struct KeyRing {
    private_key: Option<PrivateKey>,
    token: String,
    api: Arc<dyn ChatApi>,
    profiles: RwLock<HashMap<UserId, UserProfile>>,
    secrets: SecretCache,
}

impl KeyRing {
    pub fn new(private_key: Option<PrivateKey>, token: String, api: Arc<dyn ChatApi>) -> Self {
        Self {
            private_key,
            token,
            api,
            profiles: RwLock::new(HashMap::new()),
            secrets: SecretCache::new(),
        }
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub async fn cached_profile(&self, user: &UserId) -> Option<UserProfile> {
        self.profiles.read().await.get(user).cloned()
    }

    /// Fetch a profile from the directory and cache it.
    pub async fn refresh_profile(&self, user: &UserId) -> Result<UserProfile, ClientError> {
        let profile = self.api.fetch_profile(&self.token, user).await?;
        self.profiles
            .write()
            .await
            .insert(user.clone(), profile.clone());
        Ok(profile)
    }

    pub async fn profile(&self, user: &UserId) -> Result<UserProfile, ClientError> {
        match self.cached_profile(user).await {
            Some(profile) => Ok(profile),
            None => self.refresh_profile(user).await,
        }
    }

    pub async fn set_profile_picture(&self, user: &UserId, picture: &str) {
        if let Some(profile) = self.profiles.write().await.get_mut(user) {
            profile.profile_picture = Some(picture.to_string());
        }
    }

    /// The conversation secret with `partner`, deriving it on first use.
    /// A cached profile without a key may be stale, so the directory is
    /// asked again before giving up.
    pub async fn secret_for(&self, partner: &UserId) -> Result<SharedSecret, ClientError> {
        self.resolve_secret(partner, true).await
    }

    /// Like [`KeyRing::secret_for`], but a cached profile is trusted even
    /// without a key. The directory is only asked when nothing is cached.
    pub async fn known_secret_for(&self, partner: &UserId) -> Result<SharedSecret, ClientError> {
        self.resolve_secret(partner, false).await
    }

    async fn resolve_secret(
        &self,
        partner: &UserId,
        refetch_keyless: bool,
    ) -> Result<SharedSecret, ClientError> {
        if let Some(secret) = self.secrets.get(partner).await {
            return Ok(secret);
        }
        if !self.has_private_key() {
            return Err(ClientError::crypto(
                partner,
                CryptoError::MissingKeyMaterial(KeySide::LocalPrivate),
            ));
        }
        let remote_public = match self.cached_profile(partner).await {
            Some(profile) if profile.public_key.is_some() || !refetch_keyless => profile.public_key,
            _ => self.refresh_profile(partner).await?.public_key,
        };
        self.secrets
            .get_or_derive(partner, self.private_key.as_ref(), remote_public.as_ref())
            .await
            .map_err(|e| ClientError::crypto(partner, e))
    }

    pub async fn encrypt_for(&self, partner: &UserId, plaintext: &str) -> Result<String, ClientError> {
        let secret = self.secret_for(partner).await?;
        crypto::encrypt(plaintext, &secret).map_err(|e| ClientError::crypto(partner, e))
    }

    /// Decrypt an inbound body. Never refetches a keyless profile.
    pub async fn decrypt_from(&self, partner: &UserId, ciphertext: &str) -> Result<String, ClientError> {
        let secret = self.known_secret_for(partner).await?;
        crypto::decrypt(ciphertext, &secret).map_err(|e| ClientError::crypto(partner, e))
    }

    pub async fn clear(&self) {
        self.secrets.clear().await;
        self.profiles.write().await.clear();
        debug!("Key ring cleared");
    }
}

/// Decrypt for display, falling back to the placeholder.
pub fn decrypt_or_placeholder(secret: Option<&SharedSecret>, ciphertext: &str) -> String {
    secret
        .and_then(|secret| crypto::decrypt(ciphertext, secret).ok())
        .unwrap_or_else(|| UNDECRYPTABLE_PLACEHOLDER.to_string())
}
