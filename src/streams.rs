//! Broadcast streams for state, publications, errors and async messages
//! (§5: "Streams ... are broadcast, multi-consumer, with lossy-latest
//! semantics only for state").
//!
//! New relative to the teacher (Ethereum JSON-RPC has no equivalent
//! multi-consumer event surface); grounded on `tokio::sync::broadcast`,
//! the idiomatic multi-consumer channel in the teacher's own dependency
//! stack (`tokio` is already a direct dependency throughout the pack).

use std::time::SystemTime;

use serde_json::value::RawValue;
use tokio::sync::broadcast;

use crate::error::EngineError;
use crate::state::ConnectionState;

/// A connection state transition, timestamped (§3: "Transitions emit an
/// event carrying a wall-clock timestamp").
#[derive(Clone, Debug)]
pub struct StateEvent {
    pub state: ConnectionState,
    pub at: SystemTime,
}

/// An item on the global publications stream (§4.4).
#[derive(Clone, Debug)]
pub struct PublicationEvent {
    pub channel: String,
    pub data: Box<RawValue>,
    pub offset: u64,
}

/// An item on the global async-message stream (§4.4: `Message` push).
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub data: Box<RawValue>,
}

/// An error surfaced to the `errors` stream (§7: "copied to the `errors`
/// stream with a terse stack").
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub message: String,
}

impl From<&EngineError> for ErrorEvent {
    fn from(err: &EngineError) -> Self {
        Self { message: err.to_string() }
    }
}

/// The bundle of broadcast senders owned by the client actor; cloned
/// (cheaply, `Sender` is an `Arc` handle) into every component that needs
/// to publish.
#[derive(Clone)]
pub struct Streams {
    pub states: broadcast::Sender<StateEvent>,
    pub publications: broadcast::Sender<PublicationEvent>,
    pub errors: broadcast::Sender<ErrorEvent>,
    pub messages: broadcast::Sender<MessageEvent>,
}

impl Streams {
    /// `state` uses depth 1 for lossy-latest semantics (§5); the others get
    /// headroom so a slow consumer sees backpressure (a `Lagged` error)
    /// rather than having events silently dropped before it can observe
    /// them.
    pub fn new() -> Self {
        Self {
            states: broadcast::channel(1).0,
            publications: broadcast::channel(1024).0,
            errors: broadcast::channel(256).0,
            messages: broadcast::channel(256).0,
        }
    }
}

impl Default for Streams {
    fn default() -> Self {
        Self::new()
    }
}
