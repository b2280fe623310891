//! The external transport & codec contracts (§6).
//!
//! Generalizes `ethers_connections::{Connection, DuplexConnection}` from a
//! request/response RPC shape to raw frame exchange: the engine owns
//! command/reply correlation and subscription bookkeeping itself (§4), so
//! the transport's job shrinks to "move bytes, tell me when you're done".

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::{mpsc, oneshot};

use crate::error::{CodecError, TransportError};
use crate::{command::Command, reply::InboundItem};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A framed, bidirectional byte transport (§6: "the engine consumes an
/// object offering `send(bytes)`, `disconnect(code?, reason?)`...").
///
/// The canonical implementation is [`crate::backend::ws::WebSocketTransport`]
/// speaking the `centrifuge-protobuf` subprotocol; tests typically use an
/// in-memory mock built the same way the teacher's
/// `rpc/transports/mock.rs` scripts canned responses.
pub trait Transport: Send + Sync {
    /// Sends one already-encoded frame (one or more length-delimited
    /// commands, per §6) over the wire.
    fn send(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Requests that the transport close the connection, optionally with a
    /// close code/reason to hand to the remote end.
    fn disconnect(&self, code: Option<u16>, reason: Option<String>) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// The terminal signal a [`Transport`] delivers once it stops delivering
/// frames, carrying the raw (un-normalized) close code if one was observed.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportDone {
    pub raw_close_code: Option<u16>,
}

/// The trio handed back by a [`Dialer`]: the write-side handle, the channel
/// of inbound frames (the "callback" of §6, expressed as a channel rather
/// than an actual callback closure), and a one-shot terminal signal.
///
/// Grounded on the `(BackendDriver, WsBackend)` split in
/// `ethers_providers::rpc::transports::ws::backend`: a driver handle the
/// caller holds, and an independently-spawned task pumping the socket.
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub done: oneshot::Receiver<TransportDone>,
}

/// Dials a fresh transport connection (§6). The canonical implementation is
/// [`crate::backend::ws::WebSocketDialer`]; a scriptable in-memory dialer is
/// used throughout the test suite.
pub trait Dialer: Send + Sync {
    fn dial(&self, url: &str) -> BoxFuture<'static, Result<TransportHandle, TransportError>>;
}

/// Maps mapping between engine-level [`Command`]/reply structures and a
/// concrete binary wire schema (§1: explicitly out of scope to *implement*
/// for production Protobuf — this trait is the seam a caller plugs a real
/// codec into).
pub trait Codec: Send + Sync {
    /// Encodes one command into its on-wire, length-delimited
    /// representation (§4.2: "prefixing it with its length as a varint").
    fn encode(&self, cmd: &Command) -> Result<Vec<u8>, CodecError>;

    /// Decodes one inbound frame, which may contain multiple
    /// length-delimited replies (§4.3), into zero or more inbound items.
    fn decode(&self, frame: &[u8]) -> Result<Vec<InboundItem>, CodecError>;
}

/// Close-code normalization table (§6).
///
/// Returns `(engine_code, reconnect)`.
pub fn normalize_close_code(transport_code: u16) -> (u32, bool) {
    match transport_code {
        1009 => (3, true),
        1..=2999 => (1, true),
        3000..=3499 => (transport_code as u32, true),
        3500..=3999 => (transport_code as u32, false),
        4000..=4499 => (transport_code as u32, true),
        4500..=4999 => (transport_code as u32, false),
        5000..=u16::MAX => (transport_code as u32, true),
        _ => (transport_code as u32, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_table() {
        assert_eq!(normalize_close_code(1009), (3, true));
        assert_eq!(normalize_close_code(1000), (1, true));
        assert_eq!(normalize_close_code(2999), (1, true));
        assert_eq!(normalize_close_code(3100), (3100, true));
        assert_eq!(normalize_close_code(3600), (3600, false));
        assert_eq!(normalize_close_code(4100), (4100, true));
        assert_eq!(normalize_close_code(4600), (4600, false));
        assert_eq!(normalize_close_code(5001), (5001, true));
    }
}
