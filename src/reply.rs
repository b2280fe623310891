//! Engine-level reply/push model (§3, §4.3-§4.4).
//!
//! Mirrors `ethers_providers::rpc::transports::ws::types::PubSubItem`: a
//! custom `Deserialize` impl distinguishes a correlated reply (`id > 0`)
//! from a push (`id == 0`), generalized to the richer Centrifugo push
//! variant set of §4.4.

use serde_json::value::RawValue;

use crate::error::ReplyErrorPayload;

/// A decoded reply to a previously-sent command, keyed by `id` (§3).
#[derive(Debug)]
pub struct Reply {
    pub id: u32,
    pub payload: Result<Box<RawValue>, ReplyErrorPayload>,
}

/// A server-initiated event, carried by a reply with `id == 0` (§3, §4.4).
#[derive(Debug)]
pub enum Push {
    Publication { channel: String, data: Box<RawValue>, offset: u64, epoch: String },
    Join { channel: String, info: Box<RawValue> },
    Leave { channel: String, info: Box<RawValue> },
    Subscribe { channel: String, recoverable: bool, epoch: String, offset: u64 },
    Unsubscribe { channel: String, code: u32 },
    Message { data: Box<RawValue> },
    Disconnect {
        code: u32,
        reason: String,
        reconnect: bool,
        /// Server-assigned next reconnect time, epoch milliseconds (§4.6:
        /// `nextReconnectAt` takes precedence over the computed backoff).
        next_reconnect_at: Option<u64>,
        /// Server-assigned URL override for the next attempt only (§4.6:
        /// `reconnectUrl`).
        reconnect_url: Option<String>,
    },
    Refresh { ttl: Option<u64>, expires: bool },
    SubRefresh { channel: String, ttl: Option<u64>, expires: bool },
    /// A second `Connect` push mid-session (Open Question #1 in spec.md §9
    /// — treated here as a protocol error per DESIGN.md).
    Connect { client_id: String, ttl: Option<u64>, expires: bool },
}

impl Push {
    pub fn channel(&self) -> Option<&str> {
        match self {
            Push::Publication { channel, .. }
            | Push::Join { channel, .. }
            | Push::Leave { channel, .. }
            | Push::Subscribe { channel, .. }
            | Push::Unsubscribe { channel, .. }
            | Push::SubRefresh { channel, .. } => Some(channel),
            Push::Message { .. } | Push::Disconnect { .. } | Push::Refresh { .. } | Push::Connect { .. } => {
                None
            }
        }
    }
}

/// One fully decoded unit coming off the wire: either a correlated reply or
/// a server push (§3: "An `id == 0` reply is a push").
#[derive(Debug)]
pub enum InboundItem {
    Reply(Reply),
    Push(Push),
}
