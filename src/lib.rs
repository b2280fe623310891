//! A session engine for a Centrifugo-style real-time messaging server.
//!
//! The crate establishes a persistent bidirectional session over a
//! frame-oriented transport, keeps that session alive across network
//! interruptions, and exposes publish/subscribe, presence, history,
//! unicast-message and request/response (RPC) operations through
//! [`Client`].
//!
//! The transport itself (dialing, framing), the wire codec (mapping
//! [`Command`]/[`reply::InboundItem`] to bytes) and production Protobuf
//! schemas are external collaborators: the crate ships a default
//! `WebSocketTransport` (feature `ws`) and a reference [`codec::json::JsonCodec`],
//! but a caller is free to supply its own [`transport::Transport`]/
//! [`transport::Dialer`]/[`transport::Codec`] implementations.

pub mod codec;
pub mod command;
pub mod config;
pub mod correlator;
pub mod error;
pub mod metrics;
pub mod push;
pub mod queue;
pub mod reconnect;
pub mod refresh;
pub mod reply;
pub mod router;
pub mod state;
pub mod streams;
pub mod subscription;
pub mod transport;

mod client;

#[cfg(feature = "ws")]
pub mod backend;

pub mod mock;

pub use crate::client::{Client, ServerSubscriptionInfo, SubscriptionHandle};
pub use crate::command::{Command, CommandKind, Priority};
pub use crate::config::{ClientConfig, HistoryOptions, RetryInterval, SubscriptionConfig, TokenCallback};
pub use crate::error::EngineError;
pub use crate::metrics::MetricsSnapshot;
pub use crate::reply::{InboundItem, Push, Reply};
pub use crate::state::ConnectionState;
pub use crate::streams::{ErrorEvent, MessageEvent, PublicationEvent, StateEvent};
pub use crate::subscription::{SubKind, SubState, SubscriptionEvent};
pub use crate::transport::{BoxFuture, Codec, Dialer, Transport, TransportDone, TransportHandle};
