//! L9 Metrics & Log Dispatch (§4.8, §6).
//!
//! Counters are plain `AtomicU64`s, grounded on
//! `ethers_connections::connection::ws::WebSocket::next_id` (an
//! `AtomicU64` request counter) and
//! `ethers_providers::transports::retry::RetryClient::requests_enqueued`.
//! Structured events use `tracing` throughout, matching the `tracing::{debug,
//! trace, warn, error}` instrumentation in `ws/backend.rs` and
//! `ws/manager.rs`; the REDESIGN FLAGS ask for a typed log-event
//! enumeration in place of a dynamic context map, which `tracing`'s typed
//! fields give us for free (§6: "Observable events").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A single point-in-time copy of the engine's counters (§3: "Metrics").
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub reconnect_url: Option<String>,
    pub next_reconnect_at_ms: Option<u64>,
    /// Replies received, keyed by the originating command's kind (§3:
    /// "counters per reply kind"), e.g. `"publish" -> 12`.
    pub reply_kind_counts: HashMap<&'static str, u64>,
}

/// Monotonic counters plus the two nullable reconnect-context fields (§3).
#[derive(Default)]
pub struct Metrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    reconnect_url: Mutex<Option<String>>,
    next_reconnect_at_ms: Mutex<Option<u64>>,
    reply_kind_counts: Mutex<HashMap<&'static str, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_reconnect_context(&self, url: Option<String>, next_at_ms: Option<u64>) {
        *self.reconnect_url.lock().unwrap() = url;
        *self.next_reconnect_at_ms.lock().unwrap() = next_at_ms;
    }

    pub fn clear_reconnect_context(&self) {
        self.set_reconnect_context(None, None);
    }

    /// Records that a correlated reply of `kind` (the originating command's
    /// [`crate::command::CommandKind::kind_name`]) was received.
    pub fn record_reply_kind(&self, kind: &'static str) {
        *self.reply_kind_counts.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnect_url: self.reconnect_url.lock().unwrap().clone(),
            next_reconnect_at_ms: *self.next_reconnect_at_ms.lock().unwrap(),
            reply_kind_counts: self.reply_kind_counts.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_sent_and_received() {
        let metrics = Metrics::new();
        for _ in 0..3 {
            metrics.record_sent(10);
        }
        for _ in 0..3 {
            metrics.record_received(20);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 3);
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.bytes_sent, 30);
        assert_eq!(snap.bytes_received, 60);
    }

    #[test]
    fn reconnect_context_round_trips() {
        let metrics = Metrics::new();
        metrics.set_reconnect_context(Some("wss://alt".into()), Some(1234));
        let snap = metrics.snapshot();
        assert_eq!(snap.reconnect_url.as_deref(), Some("wss://alt"));
        assert_eq!(snap.next_reconnect_at_ms, Some(1234));

        metrics.clear_reconnect_context();
        let snap = metrics.snapshot();
        assert!(snap.reconnect_url.is_none());
        assert!(snap.next_reconnect_at_ms.is_none());
    }

    #[test]
    fn counts_replies_per_kind() {
        let metrics = Metrics::new();
        metrics.record_reply_kind("publish");
        metrics.record_reply_kind("publish");
        metrics.record_reply_kind("subscribe");
        let snap = metrics.snapshot();
        assert_eq!(snap.reply_kind_counts.get("publish"), Some(&2));
        assert_eq!(snap.reply_kind_counts.get("subscribe"), Some(&1));
    }
}
