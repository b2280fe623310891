//! Client & subscription configuration (§6).
//!
//! Grounded on `ethers_providers::rpc::transports::ws::types::ConnectionDetails`:
//! a plain, `serde`-deserializable struct the caller builds (or loads
//! however it likes — config *loading* stays out of scope per spec.md §1).

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::value::RawValue;

/// A callback invoked to fetch a fresh token on demand (connect or
/// per-subscription refresh, §4.7).
pub type TokenCallback = Arc<dyn Fn() -> crate::transport::BoxFuture<'static, String> + Send + Sync>;

/// Backoff bounds for the [`crate::reconnect`] controller (§4.6) or for a
/// subscription's own retry schedule (§4.5).
#[derive(Clone, Copy, Debug)]
pub struct RetryInterval {
    pub min: Duration,
    pub max: Duration,
}

impl Default for RetryInterval {
    fn default() -> Self {
        Self { min: Duration::from_millis(200), max: Duration::from_secs(20) }
    }
}

/// Options recognized by [`crate::client::Client::connect`] (§6).
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub connection_retry_interval: RetryInterval,
    pub timeout: Option<Duration>,
    pub headers: HashMap<String, String>,
    pub token: Option<String>,
    pub token_callback: Option<TokenCallback>,
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Options recognized by [`crate::client::Client::new_subscription`] (§6).
#[derive(Clone, Default)]
pub struct SubscriptionConfig {
    pub token: Option<String>,
    pub token_callback: Option<TokenCallback>,
    pub data: Option<Box<RawValue>>,
    pub since: Option<(String, u64)>,
    pub recoverable: bool,
    pub positioned: bool,
    pub join_leave: bool,
    pub min_resubscribe_delay: Option<Duration>,
    pub max_resubscribe_delay: Option<Duration>,
}

/// Wire-level `limit`/`since`/`reverse` options for [`crate::client::Client::history`] (§4.9 Facade).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryOptions {
    pub limit: Option<u32>,
    pub since: Option<(String, u64)>,
    #[serde(default)]
    pub reverse: bool,
}
