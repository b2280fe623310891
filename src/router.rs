//! L3 Reply Router (§4.3).
//!
//! Grounded on `ethers_providers::rpc::transports::ws::manager::RequestManager::handle`
//! (classifies a decoded `PubSubItem` into success/error-for-a-request vs.
//! notification) and `WsBackend::handle`'s close-frame handling, which this
//! module generalizes into the "synthetic disconnect push" of §4.3: the
//! sole site translating a transport-level close into a `Push::Disconnect`
//! so the Connection SM sees one code path for every termination.

use crate::client::Session;
use crate::push;
use crate::reply::{InboundItem, Push};
use crate::transport::{normalize_close_code, TransportDone};

impl Session {
    /// Routes one decoded inbound item: a correlated reply completes the
    /// matching [`crate::correlator::Correlator`] entry, a push is handed to
    /// L4 (§4.3).
    pub(crate) async fn route_inbound(&mut self, item: InboundItem) {
        match item {
            InboundItem::Reply(reply) => {
                if reply.id == 0 {
                    tracing::debug!("ignoring reply with id 0 routed as a reply, not a push");
                    return;
                }
                if let Some(kind) = self.inflight_kinds.remove(&reply.id) {
                    self.metrics.record_reply_kind(kind);
                }
                self.correlator.complete(reply.id, reply.payload);
            }
            InboundItem::Push(push) => push::handle_push(self, push).await,
        }
    }

    /// Translates a transport-level close into the synthetic `Disconnect`
    /// push (§4.3, §6 close-code table), then routes it exactly like a
    /// server-sent disconnect.
    pub(crate) async fn route_transport_done(&mut self, done: TransportDone) {
        let raw = done.raw_close_code.unwrap_or(0);
        let (code, reconnect) = normalize_close_code(raw);
        tracing::debug!(raw_code = raw, code, reconnect, "transport closed, synthesizing disconnect push");
        self.route_inbound(InboundItem::Push(Push::Disconnect {
            code,
            reason: "transport closed".to_string(),
            reconnect,
            next_reconnect_at: None,
            reconnect_url: None,
        }))
        .await;
    }
}
