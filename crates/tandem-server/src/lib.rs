//! Rendezvous server for Tandem clients.
//!
//! A WebSocket signaling hub: clients join pair rooms, exchange offers,
//! answers and ICE candidates, relay encrypted envelopes when no direct
//! channel is up, and broadcast profile changes. Message bodies stay
//! ciphertext; the server only routes them.

pub mod api;
pub mod config;
pub mod error;
pub mod hub;

pub use api::{build_router, serve, serve_on, AppState};
pub use config::ServerConfig;
pub use error::ServerError;
pub use hub::Hub;
