//! The error taxonomy surfaced to callers and to the `errors` stream.

use std::fmt;

/// A JSON-RPC-style error reported by the server in a reply payload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct ReplyErrorPayload {
    pub code: u32,
    pub message: String,
    #[serde(default)]
    pub temporary: bool,
}

impl fmt::Display for ReplyErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code={}, temporary={})", self.message, self.code, self.temporary)
    }
}

/// Errors that occur while dialing or completing the initial handshake.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to dial transport: {0}")]
    Dial(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("connect reply carried an error: {0}")]
    Rejected(ReplyErrorPayload),
    #[error("connect attempt timed out")]
    Timeout,
    #[error("connect() called while not in the Disconnected state")]
    AlreadyConnected,
    #[error("operation requires an active connection")]
    NotConnected,
}

/// Errors raised mid-session by the transport itself (not by the server).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to encode/decode a frame: {0}")]
    Codec(#[from] CodecError),
    #[error("transport closed unexpectedly")]
    Closed,
    #[error("server sent a second Connect push mid-session")]
    ProtocolError,
}

/// Errors raised by the injected [`crate::transport::Codec`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode command: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Raised when a command's deadline elapses, or `ready()` times out.
#[derive(Debug, thiserror::Error)]
#[error("operation timed out")]
pub struct TimeoutError;

/// A server-reported failure in a reply to a command.
#[derive(Debug, thiserror::Error)]
#[error("reply error: {payload}")]
pub struct ReplyError {
    pub payload: ReplyErrorPayload,
}

/// An error scoped to one channel subscription.
#[derive(Debug, thiserror::Error)]
#[error("subscription error on channel `{channel}`: {cause}")]
pub struct SubscriptionError {
    pub channel: String,
    #[source]
    pub cause: EngineError,
}

/// Raised by `publish`/`send`/`rpc`/`subscribe` when the command could not
/// be handed to the transport. A server-reported failure or a deadline
/// elapsing surface directly as [`EngineError::Reply`]/[`EngineError::Timeout`]
/// instead of being wrapped here.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("command queue is full")]
    Backpressure,
}

/// Raised by any Facade operation once the client has transitioned to `Closed`.
#[derive(Debug, thiserror::Error)]
#[error("client is closed")]
pub struct ClosedClientError;

/// Raised when a Facade subscription operation names a channel with no
/// registered record.
#[derive(Debug, thiserror::Error)]
#[error("no subscription registered for this channel")]
pub struct UnknownChannelError;

/// Raised when removing a subscription the registry only mirrors (§3: "the
/// registry cannot initiate (un)subscribe for it").
#[derive(Debug, thiserror::Error)]
#[error("channel is a server-maintained subscription and cannot be removed by the client")]
pub struct ServerManagedError;

/// The top-level error type unifying every error kind the engine can raise.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Reply(#[from] ReplyError),
    #[error(transparent)]
    Subscription(Box<SubscriptionError>),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Closed(#[from] ClosedClientError),
    #[error(transparent)]
    UnknownChannel(#[from] UnknownChannelError),
    #[error(transparent)]
    ServerManaged(#[from] ServerManagedError),
    #[error(transparent)]
    AlreadySubscribed(#[from] crate::subscription::AlreadyExists),
}

impl From<SubscriptionError> for EngineError {
    fn from(err: SubscriptionError) -> Self {
        Self::Subscription(Box::new(err))
    }
}
