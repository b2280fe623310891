//! L6 Reconnection Controller (§4.6).
//!
//! The swap-backend-and-reissue mechanics are grounded on
//! `ethers_providers::rpc::transports::ws::manager::RequestManager::reconnect`;
//! jittered exponential backoff itself has no direct teacher analogue
//! (`reconnects: usize` there is a plain attempt counter with no delay
//! curve) and is grounded instead on the `RetryPolicy`/backoff shape of
//! `ethers_providers::transports::retry::RetryClient`, generalized with
//! `rand` jitter per §4.6's `U[0.5, 1.5]` multiplier.

use std::time::{Duration, SystemTime};

use rand::Rng;

use crate::config::RetryInterval;

/// Tracks reconnect attempts and any server-provided override for the next
/// attempt (§3: "Reconnect context").
#[derive(Clone, Debug, Default)]
pub struct ReconnectContext {
    pub attempts: u32,
    pub next_at: Option<SystemTime>,
    pub url_override: Option<String>,
}

impl ReconnectContext {
    /// Clears all reconnect state (§3: "Cleared on successful connect or
    /// permanent close").
    pub fn clear(&mut self) {
        self.attempts = 0;
        self.next_at = None;
        self.url_override = None;
    }
}

/// Computes the next backoff delay: `clamp(base * 2^attempts *
/// U[0.5, 1.5], min, max)` (§4.6).
pub fn backoff_delay(attempts: u32, interval: RetryInterval) -> Duration {
    backoff_delay_with_rng(attempts, interval, &mut rand::thread_rng())
}

fn backoff_delay_with_rng(attempts: u32, interval: RetryInterval, rng: &mut impl Rng) -> Duration {
    let base = interval.min.as_secs_f64().max(0.001);
    let exp = base * 2f64.powi(attempts as i32);
    let jitter = rng.gen_range(0.5..=1.5);
    let secs = (exp * jitter).clamp(interval.min.as_secs_f64(), interval.max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// The outcome of handling a disconnect push (§4.6, §4.8).
#[derive(Debug)]
pub enum ReconnectDecision {
    /// Schedule a retry at the given wall-clock time, optionally against an
    /// overridden URL (§4.6: `nextReconnectAt` / `reconnectUrl`).
    Retry { at: SystemTime, url_override: Option<String> },
    /// `reconnect = false`: terminal, only an explicit user call can revive
    /// the session (§4.6).
    Permanent,
}

/// Decides the next reconnect action from a disconnect push's fields
/// (§4.6).
pub fn decide(
    ctx: &mut ReconnectContext,
    reconnect: bool,
    interval: RetryInterval,
    server_next_at: Option<SystemTime>,
    server_reconnect_url: Option<String>,
) -> ReconnectDecision {
    if !reconnect {
        ctx.clear();
        return ReconnectDecision::Permanent;
    }

    let at = server_next_at.unwrap_or_else(|| {
        let delay = backoff_delay(ctx.attempts, interval);
        SystemTime::now() + delay
    });
    ctx.attempts += 1;
    ctx.next_at = Some(at);
    ctx.url_override = server_reconnect_url.clone();

    ReconnectDecision::Retry { at, url_override: server_reconnect_url }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_bounds_and_has_jitter() {
        let interval = RetryInterval { min: Duration::from_millis(100), max: Duration::from_secs(5) };
        let mut samples = Vec::new();
        for attempt in 0..100 {
            let d = backoff_delay(attempt % 10, interval);
            assert!(d >= interval.min && d <= interval.max);
            samples.push(d);
        }
        assert!(samples.windows(2).any(|w| w[0] != w[1]), "expected jitter across samples");
    }

    #[test]
    fn permanent_disconnect_clears_context() {
        let mut ctx = ReconnectContext { attempts: 3, next_at: Some(SystemTime::now()), url_override: Some("x".into()) };
        let decision = decide(&mut ctx, false, RetryInterval::default(), None, None);
        assert!(matches!(decision, ReconnectDecision::Permanent));
        assert_eq!(ctx.attempts, 0);
        assert!(ctx.next_at.is_none());
    }

    #[test]
    fn server_next_reconnect_at_takes_precedence() {
        let mut ctx = ReconnectContext::default();
        let server_at = SystemTime::now() + Duration::from_secs(60);
        let decision = decide(&mut ctx, true, RetryInterval::default(), Some(server_at), Some("wss://alt".into()));
        match decision {
            ReconnectDecision::Retry { at, url_override } => {
                assert_eq!(at, server_at);
                assert_eq!(url_override.as_deref(), Some("wss://alt"));
            }
            _ => panic!("expected retry"),
        }
        assert_eq!(ctx.attempts, 1);
    }

    #[test]
    fn attempts_reset_on_clear() {
        let mut ctx = ReconnectContext::default();
        let _ = decide(&mut ctx, true, RetryInterval::default(), None, None);
        let _ = decide(&mut ctx, true, RetryInterval::default(), None, None);
        assert_eq!(ctx.attempts, 2);
        ctx.clear();
        assert_eq!(ctx.attempts, 0);
    }
}
