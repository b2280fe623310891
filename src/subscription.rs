//! L5 Subscription Registry (§4.5).
//!
//! Grounded on `ethers_providers::rpc::transports::ws::manager::SubscriptionManager`
//! (`subs: BTreeMap<u64, ActiveSub>`, `to_reissue` replay-on-reconnect) and
//! the re-subscribe loop in `RequestManager::reconnect` — generalized from
//! an alias table over a single numeric subscription id to channel-keyed,
//! stateful client/server subscription records (§3).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde_json::value::RawValue;
use tokio::sync::broadcast;

use crate::config::{SubscriptionConfig, TokenCallback};
use crate::error::{ReplyErrorPayload, SubscriptionError};

/// A channel subscription's lifecycle state (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Whether a subscription is user-initiated (replayed across reconnects) or
/// server-maintained (mirrored only, §3/§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubKind {
    Client,
    Server,
}

/// An event published to a subscription's error sink, or the global
/// publication/presence streams.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    Publication { data: Box<RawValue>, offset: u64 },
    Presence { joined: bool, info: Box<RawValue> },
    Error(ReplyErrorPayload),
}

/// Per-channel subscription record (§3).
pub struct Subscription {
    pub channel: String,
    pub kind: SubKind,
    pub state: SubState,
    pub recoverable: bool,
    pub positioned: bool,
    pub join_leave: bool,
    pub epoch: String,
    pub offset: u64,
    pub token: Option<String>,
    pub token_callback: Option<TokenCallback>,
    pub data: Option<Box<RawValue>>,
    pub min_resubscribe_delay: Duration,
    pub max_resubscribe_delay: Duration,
    /// Consecutive failed-subscribe attempts since the last success,
    /// driving the backoff delay of the next scheduled retry (§4.5).
    pub resubscribe_attempts: u32,
    /// Desired end-state: `true` once the user has called `subscribe()`
    /// and hasn't since called `unsubscribe()`. Drives replay-on-reconnect
    /// (§4.5: "replays every client-side subscription whose desired state
    /// is `Subscribed`").
    pub desired_subscribed: bool,
    events_tx: broadcast::Sender<SubscriptionEvent>,
}

impl Subscription {
    fn new(channel: String, kind: SubKind, config: SubscriptionConfig) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let (epoch, offset) = config.since.clone().unwrap_or_default();
        Self {
            channel,
            kind,
            state: SubState::Unsubscribed,
            recoverable: config.recoverable,
            positioned: config.positioned,
            join_leave: config.join_leave,
            epoch,
            offset,
            token: config.token,
            token_callback: config.token_callback,
            data: config.data,
            min_resubscribe_delay: config.min_resubscribe_delay.unwrap_or(Duration::from_millis(500)),
            max_resubscribe_delay: config.max_resubscribe_delay.unwrap_or(Duration::from_secs(20)),
            resubscribe_attempts: 0,
            desired_subscribed: false,
            events_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events_tx.subscribe()
    }

    /// Advances `offset` for a recoverable subscription, rejecting
    /// out-of-order epochs (I5; §4.4 Publication handling).
    ///
    /// Returns `Err` if `epoch` doesn't match the current epoch, signalling
    /// the caller to force a resubscribe with recovery (spec.md §9 Open
    /// Question: epoch mismatch forces resubscribe-with-recovery).
    pub fn observe_publication(&mut self, offset: u64, epoch: &str, data: Box<RawValue>) -> Result<(), ()> {
        if self.recoverable {
            if !self.epoch.is_empty() && self.epoch != epoch {
                return Err(());
            }
            self.epoch = epoch.to_string();
            self.offset = self.offset.max(offset);
        }
        let _ = self.events_tx.send(SubscriptionEvent::Publication { data, offset });
        Ok(())
    }

    pub fn observe_presence(&self, joined: bool, info: Box<RawValue>) {
        let _ = self.events_tx.send(SubscriptionEvent::Presence { joined, info });
    }

    pub fn observe_error(&self, err: ReplyErrorPayload) {
        let _ = self.events_tx.send(SubscriptionEvent::Error(err));
    }
}

/// The registry of all client-side and server-side subscriptions (§4.5,
/// I3: "a subscription appears in the registry under its channel key at
/// most once").
#[derive(Default)]
pub struct Registry {
    subs: HashMap<String, Subscription>,
    /// Insertion order of client-side subscriptions, for replay-on-reconnect
    /// (§4.5: "replays ... in insertion order").
    client_order: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("subscription for channel `{0}` already exists")]
pub struct AlreadyExists(pub String);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh client-side record in `Unsubscribed` (§4.5).
    pub fn new_client_subscription(
        &mut self,
        channel: &str,
        config: SubscriptionConfig,
    ) -> Result<(), AlreadyExists> {
        if self.subs.contains_key(channel) {
            return Err(AlreadyExists(channel.to_string()));
        }
        self.subs.insert(channel.to_string(), Subscription::new(channel.to_string(), SubKind::Client, config));
        self.client_order.push(channel.to_string());
        Ok(())
    }

    pub fn get(&self, channel: &str) -> Option<&Subscription> {
        self.subs.get(channel)
    }

    pub fn get_mut(&mut self, channel: &str) -> Option<&mut Subscription> {
        self.subs.get_mut(channel)
    }

    pub fn remove(&mut self, channel: &str) -> Option<Subscription> {
        self.client_order.retain(|c| c != channel);
        self.subs.remove(channel)
    }

    /// Creates-or-updates a server-side subscription from a `Subscribe`
    /// push, moving it to `Subscribed` (§4.4).
    pub fn upsert_server_subscription(&mut self, channel: &str, recoverable: bool, epoch: String, offset: u64) {
        let sub = self
            .subs
            .entry(channel.to_string())
            .or_insert_with(|| Subscription::new(channel.to_string(), SubKind::Server, SubscriptionConfig::default()));
        sub.state = SubState::Subscribed;
        sub.recoverable = recoverable;
        sub.epoch = epoch;
        sub.offset = offset;
    }

    /// Drops every server-side subscription (§4.5: "Server-side
    /// subscriptions are discarded and repopulated solely from the connect
    /// reply's `subs` map").
    pub fn clear_server_subscriptions(&mut self) {
        self.subs.retain(|_, sub| sub.kind != SubKind::Server);
    }

    /// Every client-side subscription whose desired state is `Subscribed`,
    /// in insertion order (§4.5 replay-on-reconnect).
    pub fn to_replay(&self) -> Vec<&Subscription> {
        self.client_order
            .iter()
            .filter_map(|ch| self.subs.get(ch))
            .filter(|sub| sub.kind == SubKind::Client && sub.desired_subscribed)
            .collect()
    }

    /// Connection-loss teardown (§4.8): every client-side subscription goes
    /// `Subscribing` -> `Unsubscribed` pending reconnect, desired state
    /// preserved so replay can re-establish it.
    pub fn teardown_for_disconnect(&mut self) {
        for sub in self.subs.values_mut() {
            if sub.kind == SubKind::Client {
                sub.state = SubState::Unsubscribed;
            }
        }
    }

    /// Full teardown on `close()` (§4.8): clears the registry outright.
    pub fn clear(&mut self) {
        self.subs.clear();
        self.client_order.clear();
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.subs.keys().map(String::as_str)
    }

    pub fn server_subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subs.values().filter(|sub| sub.kind == SubKind::Server)
    }

    pub fn to_subscription_error(channel: &str, payload: ReplyErrorPayload) -> SubscriptionError {
        SubscriptionError { channel: channel.to_string(), cause: crate::error::ReplyError { payload }.into() }
    }
}

/// One scheduled retry for a channel whose `Subscribe` command came back
/// with a temporary failure (§4.5: "a per-subscription backoff schedules
/// retry"). Shaped the same way as [`crate::refresh::RefreshScheduler`],
/// keyed by channel instead of by refresh target.
#[derive(Clone, Debug)]
struct ScheduledResubscribe {
    channel: String,
    at: SystemTime,
}

#[derive(Default)]
pub struct ResubscribeScheduler {
    scheduled: Vec<ScheduledResubscribe>,
}

impl ResubscribeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, channel: String, at: SystemTime) {
        self.cancel(&channel);
        self.scheduled.push(ScheduledResubscribe { channel, at });
    }

    pub fn cancel(&mut self, channel: &str) {
        self.scheduled.retain(|s| s.channel != channel);
    }

    /// Pops every channel whose retry deadline has elapsed as of `now`.
    pub fn due(&mut self, now: SystemTime) -> Vec<String> {
        let (due, pending): (Vec<_>, Vec<_>) = self.scheduled.drain(..).partition(|s| s.at <= now);
        self.scheduled = pending;
        due.into_iter().map(|s| s.channel).collect()
    }

    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.scheduled.iter().map(|s| s.at).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SubscriptionConfig {
        SubscriptionConfig { recoverable: true, ..Default::default() }
    }

    #[test]
    fn rejects_duplicate_channel() {
        let mut reg = Registry::new();
        reg.new_client_subscription("a", cfg()).unwrap();
        assert!(reg.new_client_subscription("a", cfg()).is_err());
    }

    #[test]
    fn replay_only_includes_desired_subscribed_client_subs() {
        let mut reg = Registry::new();
        reg.new_client_subscription("a", cfg()).unwrap();
        reg.new_client_subscription("b", cfg()).unwrap();
        reg.get_mut("a").unwrap().desired_subscribed = true;

        let replay: Vec<_> = reg.to_replay().iter().map(|s| s.channel.clone()).collect();
        assert_eq!(replay, vec!["a".to_string()]);
    }

    #[test]
    fn offset_non_regression_and_epoch_mismatch() {
        let mut sub = Subscription::new("a".into(), SubKind::Client, cfg());
        sub.observe_publication(5, "e1", RawValue::from_string("1".into()).unwrap()).unwrap();
        assert_eq!(sub.offset, 5);
        sub.observe_publication(7, "e1", RawValue::from_string("2".into()).unwrap()).unwrap();
        assert_eq!(sub.offset, 7);
        assert!(sub.observe_publication(8, "e2", RawValue::from_string("3".into()).unwrap()).is_err());
    }

    #[test]
    fn since_seeds_initial_epoch_and_offset() {
        let config = SubscriptionConfig { since: Some(("ep9".to_string(), 42)), ..cfg() };
        let sub = Subscription::new("a".into(), SubKind::Client, config);
        assert_eq!(sub.epoch, "ep9");
        assert_eq!(sub.offset, 42);
    }

    #[test]
    fn resubscribe_scheduler_reports_only_due_channels() {
        let mut sched = ResubscribeScheduler::new();
        let now = SystemTime::now();
        sched.schedule("a".to_string(), now);
        sched.schedule("b".to_string(), now + Duration::from_secs(3600));
        let due = sched.due(now + Duration::from_secs(1));
        assert_eq!(due, vec!["a".to_string()]);
        assert!(sched.next_deadline().is_some());
    }

    #[test]
    fn server_subscriptions_cleared_on_reconnect_but_client_kept() {
        let mut reg = Registry::new();
        reg.new_client_subscription("a", cfg()).unwrap();
        reg.upsert_server_subscription("sys", false, "e".into(), 0);
        reg.clear_server_subscriptions();
        assert!(reg.get("a").is_some());
        assert!(reg.get("sys").is_none());
    }
}
