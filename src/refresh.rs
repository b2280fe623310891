//! L7 Token Refresh Scheduler (§4.7).
//!
//! No direct teacher analogue exists (Ethereum JSON-RPC connections carry
//! no session TTL), so the scheduling shape is grounded on the teacher's
//! general use of `tokio::time` for periodic background work —
//! `ethers_connections::pending::PendingTransaction::poll_receipt`'s
//! `tokio::time::Interval` loop and the keepalive-ping `tokio::time::sleep`
//! in `ws/backend.rs::WsBackend::spawn`.

use std::time::{Duration, SystemTime};

/// The default fraction of a TTL reserved as refresh skew, and the cap on
/// that skew in absolute terms (§4.7: "skew default 10% of ttl, capped").
const DEFAULT_SKEW_FRACTION: f64 = 0.10;
const MAX_SKEW: Duration = Duration::from_secs(30);

/// Computes when a connection-token or per-subscription-token refresh
/// should fire: `now + ttl - skew` (§4.7).
pub fn refresh_at(now: SystemTime, ttl: Duration) -> SystemTime {
    let skew = Duration::from_secs_f64(ttl.as_secs_f64() * DEFAULT_SKEW_FRACTION).min(MAX_SKEW);
    let lead = ttl.checked_sub(skew).unwrap_or(Duration::ZERO);
    now + lead
}

/// One scheduled refresh deadline, either for the connection token or for a
/// specific subscription's token (§4.7).
#[derive(Clone, Debug)]
pub enum RefreshTarget {
    Connection,
    Subscription { channel: String },
}

#[derive(Clone, Debug)]
pub struct ScheduledRefresh {
    pub target: RefreshTarget,
    pub at: SystemTime,
}

/// Holds the single pending connection-token refresh and any number of
/// pending per-subscription refreshes, and reports which are due.
#[derive(Default)]
pub struct RefreshScheduler {
    scheduled: Vec<ScheduledRefresh>,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, target: RefreshTarget, ttl: Duration) {
        let at = refresh_at(SystemTime::now(), ttl);
        self.cancel(&target);
        self.scheduled.push(ScheduledRefresh { target, at });
    }

    pub fn cancel(&mut self, target: &RefreshTarget) {
        self.scheduled.retain(|s| !matches_target(&s.target, target));
    }

    pub fn clear(&mut self) {
        self.scheduled.clear();
    }

    /// Pops every refresh whose deadline has elapsed as of `now` (§4.7: "A
    /// missed refresh (deadline exceeded) triggers a disconnect").
    pub fn due(&mut self, now: SystemTime) -> Vec<ScheduledRefresh> {
        let (due, pending): (Vec<_>, Vec<_>) = self.scheduled.drain(..).partition(|s| s.at <= now);
        self.scheduled = pending;
        due
    }

    /// The earliest pending deadline, if any — used by the actor loop to
    /// size its next `tokio::time::sleep` (§5: cooperative scheduling).
    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.scheduled.iter().map(|s| s.at).min()
    }
}

fn matches_target(a: &RefreshTarget, b: &RefreshTarget) -> bool {
    match (a, b) {
        (RefreshTarget::Connection, RefreshTarget::Connection) => true,
        (RefreshTarget::Subscription { channel: x }, RefreshTarget::Subscription { channel: y }) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_fires_before_ttl_elapses() {
        let now = SystemTime::now();
        let ttl = Duration::from_secs(100);
        let at = refresh_at(now, ttl);
        assert!(at < now + ttl);
        assert!(at >= now + Duration::from_secs(69)); // 100 - min(10, 30) = 90s lead, leave slack
    }

    #[test]
    fn skew_is_capped_for_long_ttls() {
        let now = SystemTime::now();
        let ttl = Duration::from_secs(10_000);
        let at = refresh_at(now, ttl);
        // skew capped at 30s, so lead is ttl - 30s
        assert_eq!(at, now + Duration::from_secs(9_970));
    }

    #[test]
    fn due_returns_only_elapsed_entries() {
        let mut sched = RefreshScheduler::new();
        let now = SystemTime::now();
        sched.schedule(RefreshTarget::Connection, Duration::from_secs(0));
        sched.schedule(RefreshTarget::Subscription { channel: "a".into() }, Duration::from_secs(3600));

        let due = sched.due(now + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert!(matches!(due[0].target, RefreshTarget::Connection));
        assert!(sched.next_deadline().is_some());
    }

    #[test]
    fn rescheduling_replaces_prior_entry_for_same_target() {
        let mut sched = RefreshScheduler::new();
        sched.schedule(RefreshTarget::Connection, Duration::from_secs(10));
        sched.schedule(RefreshTarget::Connection, Duration::from_secs(20));
        assert_eq!(sched.scheduled.len(), 1);
    }
}
