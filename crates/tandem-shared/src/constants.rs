/// Application name
pub const APP_NAME: &str = "Tandem";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Private key size in bytes before hex encoding
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Maximum relayed or direct payload size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Default signaling / API port of the rendezvous server
pub const DEFAULT_HTTP_PORT: u16 = 5001;

/// Label of the data channel opened between two peers
pub const DATA_CHANNEL_LABEL: &str = "messageChannel";

/// Public STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Seconds a session may stay in Negotiating before falling back to relay
pub const NEGOTIATION_TIMEOUT_SECS: u64 = 15;

/// Signaling reconnect backoff bounds in milliseconds
pub const RECONNECT_BASE_MS: u64 = 500;
pub const RECONNECT_MAX_MS: u64 = 30_000;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SHARED_SECRET: &str = "tandem-shared-secret-v1";
