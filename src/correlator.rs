//! L1 Correlator (§4.1).
//!
//! Grounded on `ethers_connections::connection::common::Shared::pending`
//! (one `oneshot::Sender` per in-flight id) and
//! `ethers_providers::rpc::transports::ws::manager::RequestManager::reqs`
//! (a `BTreeMap<u64, InFlight>` drained on reconnect) — generalized here to
//! own deadline enforcement itself rather than delegating to the caller.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::value::RawValue;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::{EngineError, ReplyError, ReplyErrorPayload, TimeoutError};

type PendingSlot = oneshot::Sender<Result<Box<RawValue>, ReplyErrorPayload>>;

/// Maintains the map from command id to a single-consumer completion
/// handle (§4.1). Owned by the client actor; not `Sync` on its own, mutated
/// only from within the actor's single task.
#[derive(Default)]
pub struct Correlator {
    pending: HashMap<u32, PendingSlot>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight command id and returns the receiver half
    /// the caller awaits.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered (I1: ids are unique within a
    /// session; a collision is a bug in the id allocator, not a runtime
    /// condition callers should be asked to handle).
    pub fn register(&mut self, id: u32) -> oneshot::Receiver<Result<Box<RawValue>, ReplyErrorPayload>> {
        let (tx, rx) = oneshot::channel();
        let prev = self.pending.insert(id, tx);
        assert!(prev.is_none(), "correlator id collision (id={id})");
        rx
    }

    /// Completes the pending entry for `id`, if any (§4.3: reply routing).
    /// A missing entry means the id was already evicted (deadline/loss) or
    /// the reply is a stray late arrival — both are logged at debug and
    /// otherwise ignored (§4.1).
    pub fn complete(&mut self, id: u32, result: Result<Box<RawValue>, ReplyErrorPayload>) {
        match self.pending.remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(id, "late or unknown reply, dropping"),
        }
    }

    /// Evicts every pending entry, resolving each with `err` (§4.1:
    /// "On connection loss, all pending entries are evicted atomically").
    pub fn fail_all(&mut self, err: &ReplyErrorPayload) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops the pending entry without resolving it (cancellation: §5 "if a
    /// caller's future is dropped, its Correlator entry is evicted").
    pub fn evict(&mut self, id: u32) {
        self.pending.remove(&id);
    }
}

/// Awaits `rx` until the earliest of {matching reply, `deadline`} (§4.1).
/// Connection-loss resolution is handled by [`Correlator::fail_all`]
/// completing `rx` directly, so this function only needs to race the
/// timer.
pub async fn await_reply(
    rx: oneshot::Receiver<Result<Box<RawValue>, ReplyErrorPayload>>,
    deadline: Duration,
) -> Result<Box<RawValue>, EngineError> {
    match timeout(deadline, rx).await {
        Ok(Ok(Ok(payload))) => Ok(payload),
        Ok(Ok(Err(payload))) => Err(ReplyError { payload }.into()),
        Ok(Err(_canceled)) => Err(TimeoutError.into()),
        Err(_elapsed) => Err(TimeoutError.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_pending_entry_exactly_once() {
        let mut correlator = Correlator::new();
        let rx = correlator.register(1);
        assert_eq!(correlator.len(), 1);

        let raw = RawValue::from_string("42".into()).unwrap();
        correlator.complete(1, Ok(raw.clone()));
        assert!(correlator.is_empty());

        let got = await_reply(rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.get(), "42");
    }

    #[tokio::test]
    async fn late_reply_for_evicted_id_is_dropped() {
        let mut correlator = Correlator::new();
        let _rx = correlator.register(1);
        correlator.evict(1);
        // completing an evicted id must not panic
        correlator.complete(1, Ok(RawValue::from_string("1".into()).unwrap()));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn timeout_resolves_with_timeout_error() {
        let mut correlator = Correlator::new();
        let rx = correlator.register(1);
        let res = await_reply(rx, Duration::from_millis(10)).await;
        assert!(matches!(res, Err(EngineError::Timeout(_))));
        correlator.evict(1);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_entry() {
        let mut correlator = Correlator::new();
        let rx1 = correlator.register(1);
        let rx2 = correlator.register(2);

        correlator.fail_all(&ReplyErrorPayload { code: 0, message: "disconnected".into(), temporary: true });

        assert!(await_reply(rx1, Duration::from_secs(1)).await.is_err());
        assert!(await_reply(rx2, Duration::from_secs(1)).await.is_err());
    }
}
