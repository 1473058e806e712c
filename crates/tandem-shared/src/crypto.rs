use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_SHARED_SECRET, NONCE_SIZE, PRIVATE_KEY_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, KeySide};
use crate::types::{PrivateKey, PublicKey};

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Symmetric key shared by the two members of a conversation.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(SymmetricKey);

impl SharedSecret {
    pub fn from_bytes(bytes: SymmetricKey) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &SymmetricKey {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// A long-lived key pair as provisioned at registration.
///
/// The public half is a one-way digest of the private half rather than a
/// curve point. This keeps key agreement reproducible across clients but
/// offers no forward secrecy; replacing it with a real ECDH exchange is a
/// separate, reviewed change.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let private_key = PrivateKey(hex::encode(bytes));
        let public_key = public_key_for(&private_key);
        Self {
            private_key,
            public_key,
        }
    }
}

pub fn public_key_for(private_key: &PrivateKey) -> PublicKey {
    PublicKey(blake3::hash(private_key.as_str().as_bytes()).to_hex().to_string())
}

/// Derive the conversation secret for `local_private` and `remote_public`.
///
/// Both sides hash the same canonical input: the two public key strings in
/// sorted order. The result does not depend on who calls it.
pub fn derive_secret(
    local_private: Option<&PrivateKey>,
    remote_public: Option<&PublicKey>,
) -> Result<SharedSecret, CryptoError> {
    let local_private = local_private
        .filter(|k| !k.is_empty())
        .ok_or(CryptoError::MissingKeyMaterial(KeySide::LocalPrivate))?;
    let remote_public = remote_public
        .filter(|k| !k.is_empty())
        .ok_or(CryptoError::MissingKeyMaterial(KeySide::RemotePublic))?;

    let local_public = public_key_for(local_private);
    let mut parts = [local_public.as_str(), remote_public.as_str().trim()];
    parts.sort_unstable();

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SHARED_SECRET);
    hasher.update(parts[0].as_bytes());
    hasher.update(parts[1].as_bytes());
    Ok(SharedSecret(*hasher.finalize().as_bytes()))
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns base64(nonce || ciphertext)
pub fn encrypt(plaintext: &str, secret: &SharedSecret) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(secret.as_bytes().into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(output))
}

pub fn decrypt(ciphertext: &str, secret: &SharedSecret) -> Result<String, CryptoError> {
    let data = BASE64
        .decode(ciphertext.trim())
        .map_err(|_| CryptoError::DecryptionMismatch)?;
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionMismatch);
    }

    let (nonce_bytes, body) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(secret.as_bytes().into());
    let nonce = XNonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, body)
        .map_err(|_| CryptoError::DecryptionMismatch)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionMismatch)
}
