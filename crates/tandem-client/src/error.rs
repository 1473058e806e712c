use thiserror::Error;

use tandem_net::SignalingError;
use tandem_session::{SessionError, TransportError};
use tandem_shared::{CryptoError, KeySide, UserId};

use crate::api::ApiError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The conversation cannot be encrypted yet. Nothing was sent.
    #[error("No {side} for conversation with {partner}")]
    MissingKeyMaterial { partner: UserId, side: KeySide },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] SessionError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Secure storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Attach the conversation partner to a crypto failure.
    pub fn crypto(partner: &UserId, err: CryptoError) -> Self {
        match err {
            CryptoError::MissingKeyMaterial(side) => ClientError::MissingKeyMaterial {
                partner: partner.clone(),
                side,
            },
            other => ClientError::Crypto(other),
        }
    }

    /// True when the failed send may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Delivery(SessionError::DeliveryFailure { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_keeps_partner() {
        let err = ClientError::crypto(
            &UserId::from("bob"),
            CryptoError::MissingKeyMaterial(KeySide::RemotePublic),
        );
        match err {
            ClientError::MissingKeyMaterial { partner, side } => {
                assert_eq!(partner.as_str(), "bob");
                assert_eq!(side, KeySide::RemotePublic);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_only_delivery_failures_are_retryable() {
        let delivery = ClientError::Delivery(SessionError::DeliveryFailure {
            peer: UserId::from("bob"),
            reason: "offline".into(),
        });
        assert!(delivery.is_retryable());
        assert!(!ClientError::NotLoggedIn.is_retryable());
        assert!(!ClientError::Delivery(SessionError::ManagerClosed).is_retryable());
    }
}
