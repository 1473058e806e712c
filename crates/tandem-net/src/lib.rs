// Signaling transport: the persistent control connection to the rendezvous server.

pub mod error;
pub mod signaling;

pub use error::SignalingError;
pub use signaling::{
    spawn_signaling, EmitAck, LoopbackSignaling, SignalingCommand, SignalingConfig, SignalingHandle,
    SignalingNotification,
};
