use thiserror::Error;

use tandem_shared::ProtocolError;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Bearer token is not a valid header value")]
    InvalidToken,

    #[error("Signaling connection unavailable")]
    Unavailable,

    #[error("Signaling task has shut down")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
