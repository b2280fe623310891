//! L4 Push Router (§4.4).
//!
//! No single teacher file matches this switch — Ethereum JSON-RPC pushes are
//! limited to `eth_subscribe` notifications — so the dispatch shape is
//! grounded on the `match item { PubSubItem::Result, PubSubItem::Notification }`
//! arm in `ethers_providers::rpc::transports::ws::manager::RequestManager::handle`,
//! widened to the full Centrifugo push variant set, with each arm handed off
//! to the registry/streams/scheduler component that owns the corresponding
//! piece of state (§4.4).

use std::time::Duration;

use crate::client::Session;
use crate::error::{EngineError, TransportError};
use crate::refresh::RefreshTarget;
use crate::reply::Push;
use crate::streams::{MessageEvent, PublicationEvent};
use crate::subscription::SubState;

/// Dispatches one decoded push to the component that owns its effect.
pub(crate) async fn handle_push(session: &mut Session, push: Push) {
    match push {
        Push::Publication { channel, data, offset, epoch } => {
            handle_publication(session, channel, data, offset, epoch).await
        }
        Push::Join { channel, info } => {
            if let Some(sub) = session.registry.get(&channel) {
                sub.observe_presence(true, info);
            }
        }
        Push::Leave { channel, info } => {
            if let Some(sub) = session.registry.get(&channel) {
                sub.observe_presence(false, info);
            }
        }
        Push::Subscribe { channel, recoverable, epoch, offset } => {
            session.registry.upsert_server_subscription(&channel, recoverable, epoch, offset);
        }
        Push::Unsubscribe { channel, code } => handle_unsubscribe(session, channel, code).await,
        Push::Message { data } => {
            let _ = session.streams.messages.send(MessageEvent { data });
        }
        Push::Disconnect { code, reason, reconnect, next_reconnect_at, reconnect_url } => {
            session.handle_disconnect(code, reason, reconnect, next_reconnect_at, reconnect_url)
        }
        Push::Refresh { ttl, expires } => {
            if expires {
                match ttl {
                    Some(ttl) => session.refresh.schedule(RefreshTarget::Connection, Duration::from_secs(ttl)),
                    None => session.refresh.cancel(&RefreshTarget::Connection),
                }
            } else {
                session.refresh.cancel(&RefreshTarget::Connection);
            }
        }
        Push::SubRefresh { channel, ttl, expires } => {
            let target = RefreshTarget::Subscription { channel };
            if expires {
                match ttl {
                    Some(ttl) => session.refresh.schedule(target, Duration::from_secs(ttl)),
                    None => session.refresh.cancel(&target),
                }
            } else {
                session.refresh.cancel(&target);
            }
        }
        Push::Connect { client_id, .. } => {
            // spec.md §9 Open Question #1: a second Connect push mid-session
            // is a protocol error, treated as transient (DESIGN.md).
            tracing::warn!(client_id, "second Connect push mid-session, treating as protocol error");
            let err = EngineError::Transport(TransportError::ProtocolError);
            let _ = session.streams.errors.send((&err).into());
            session.handle_disconnect(1, "protocol error: duplicate connect push".to_string(), true, None, None);
        }
    }
}

async fn handle_publication(
    session: &mut Session,
    channel: String,
    data: Box<serde_json::value::RawValue>,
    offset: u64,
    epoch: String,
) {
    let Some(sub) = session.registry.get_mut(&channel) else {
        tracing::debug!(channel, "publication for unknown channel, dropping");
        return;
    };

    match sub.observe_publication(offset, &epoch, data.clone()) {
        Ok(()) => {
            let _ = session.streams.publications.send(PublicationEvent { channel, data, offset });
        }
        Err(()) => {
            // spec.md §9 Open Question #2: epoch mismatch forces a
            // resubscribe with recovery rather than silently skipping ahead.
            tracing::warn!(channel, "publication epoch mismatch, forcing resubscribe with recovery");
            session.force_resubscribe(&channel).await;
        }
    }
}

/// `code < 2500` is this crate's own threshold, not one taken from a wire
/// spec: no source in this pack defines a numeric cutoff for "unsubscribe
/// codes that warrant a retry" (DESIGN.md records this as an explicit
/// assumption, modeled on the 3000-vs-below split the Disconnect-code table
/// already draws between recoverable and terminal codes).
async fn handle_unsubscribe(session: &mut Session, channel: String, code: u32) {
    let is_client = match session.registry.get(&channel) {
        Some(sub) => sub.kind == crate::subscription::SubKind::Client,
        None => return,
    };

    if is_client {
        if let Some(sub) = session.registry.get_mut(&channel) {
            sub.state = SubState::Unsubscribed;
        }
        if code < 2500 {
            session.force_resubscribe(&channel).await;
        }
    } else {
        session.registry.remove(&channel);
    }
}
