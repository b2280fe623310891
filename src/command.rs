//! Engine-level command model (§3, §4.1-§4.2).
//!
//! A `Command` is the unit the Correlator hands to the Command Queue and
//! the queue hands to the injected [`crate::transport::Codec`]. It mirrors
//! the shape of `ethers_connections::jsonrpc::Request`, generalized from a
//! single `method`/`params` pair to the richer Centrifugo command set.

use serde_json::value::RawValue;
use std::time::SystemTime;

/// The priority lane a command is queued on (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    Control,
}

/// The kind of operation a `Command` represents, and its request payload.
#[derive(Clone, Debug)]
pub enum CommandKind {
    Connect { token: Option<String>, name: Option<String>, version: Option<String> },
    Subscribe { channel: String, payload: Box<RawValue> },
    Unsubscribe { channel: String },
    Publish { channel: String, data: Box<RawValue> },
    Presence { channel: String },
    PresenceStats { channel: String },
    History { channel: String, limit: Option<u32>, since: Option<(String, u64)>, reverse: bool },
    Ping,
    /// Fire-and-forget: never assigned an id, never correlated.
    Send { data: Box<RawValue> },
    Rpc { method: String, data: Box<RawValue> },
    Refresh { token: String },
    SubRefresh { channel: String, token: String },
}

impl CommandKind {
    /// Whether this kind expects a reply to be correlated (§3: "Send is
    /// asynchronous (no reply expected, id omitted on the wire)").
    pub fn expects_reply(&self) -> bool {
        !matches!(self, CommandKind::Send { .. })
    }

    /// The priority lane this kind is queued on (§4.2).
    pub fn priority(&self) -> Priority {
        match self {
            CommandKind::Ping | CommandKind::Refresh { .. } | CommandKind::SubRefresh { .. } => {
                Priority::Control
            }
            _ => Priority::Normal,
        }
    }

    /// A stable, short tag for this kind, used to key the per-reply-kind
    /// counters on [`crate::metrics::Metrics`] (§3: "counters per reply
    /// kind").
    pub fn kind_name(&self) -> &'static str {
        match self {
            CommandKind::Connect { .. } => "connect",
            CommandKind::Subscribe { .. } => "subscribe",
            CommandKind::Unsubscribe { .. } => "unsubscribe",
            CommandKind::Publish { .. } => "publish",
            CommandKind::Presence { .. } => "presence",
            CommandKind::PresenceStats { .. } => "presence_stats",
            CommandKind::History { .. } => "history",
            CommandKind::Ping => "ping",
            CommandKind::Send { .. } => "send",
            CommandKind::Rpc { .. } => "rpc",
            CommandKind::Refresh { .. } => "refresh",
            CommandKind::SubRefresh { .. } => "sub_refresh",
        }
    }
}

/// A client-originated command awaiting transmission or correlation.
#[derive(Clone, Debug)]
pub struct Command {
    /// `0` for `Send` commands (§3), otherwise a strictly increasing id
    /// allocated by the [`crate::correlator::Correlator`] (I1).
    pub id: u32,
    pub timestamp: SystemTime,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(id: u32, kind: CommandKind) -> Self {
        Self { id, timestamp: SystemTime::now(), kind }
    }
}
