use thiserror::Error;

/// Which half of a key agreement was unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySide {
    LocalPrivate,
    RemotePublic,
}

impl std::fmt::Display for KeySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySide::LocalPrivate => f.write_str("local private key"),
            KeySide::RemotePublic => f.write_str("remote public key"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Missing key material: {0} not available")]
    MissingKeyMaterial(KeySide),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: ciphertext does not match the shared secret")]
    DecryptionMismatch,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}
