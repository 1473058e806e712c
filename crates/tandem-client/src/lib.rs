//! Client side of Tandem: conversation state, key handling, the HTTP
//! directory and the [`Client`] that ties them to the session layer.

pub mod api;
mod bridge;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod keys;
pub mod secrets;
pub mod storage;

pub use api::{ApiError, ChatApi, HttpApi, MessageRecord, UserProfile};
pub use client::Client;
pub use config::ClientConfig;
pub use conversation::{reconcile, ConversationState, ConversationStore, ConversationSummary, Message};
pub use error::ClientError;
pub use events::ClientEvent;
pub use keys::{KeyRing, UNDECRYPTABLE_PLACEHOLDER};
pub use storage::{Credentials, MemoryStore, SecureStore, StoreError};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tandem_client=debug,tandem_session=debug,tandem_net=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
