//! Types, wire protocol and cryptography shared by every Tandem crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, KeySide, ProtocolError};
pub use types::{ConnectionStatus, DeliveryPath, Identity, MessageId, PrivateKey, PublicKey, UserId};
