//! L10 Public Client Facade, plus the actor that owns every other component
//! (§4.8, §4.9, §5).
//!
//! The actor loop is grounded on
//! `ethers_providers::rpc::transports::ws::manager::RequestManager::spawn`'s
//! `select_biased!` loop: instructions are serviced before reconnection,
//! reconnection before new frames, mirroring the same "drain what matters
//! most first" ordering, generalized with two extra timer-driven branches
//! (refresh deadlines, reconnect backoff) that the teacher has no analogue
//! for. `Session` plays the role of `RequestManager` itself: the one struct
//! every other L-component hangs off of, reached only through the
//! `instructions` channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::value::RawValue;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant as TokioInstant;
use tokio_stream::wrappers::BroadcastStream;

use crate::command::{Command, CommandKind};
use crate::config::{ClientConfig, HistoryOptions, SubscriptionConfig, TokenCallback};
use crate::correlator::{await_reply, Correlator};
use crate::error::{
    ClosedClientError, ConnectionError, EngineError, ReplyErrorPayload, SendError, ServerManagedError,
    UnknownChannelError,
};
use crate::metrics::Metrics;
use crate::queue::{self, QueueHandle};
use crate::reconnect::{self, ReconnectContext, ReconnectDecision};
use crate::refresh::{RefreshScheduler, RefreshTarget};
use crate::state::{self, ConnectionState, Transition};
use crate::streams::{StateEvent, Streams};
use crate::subscription::{Registry, ResubscribeScheduler, SubKind, SubState, Subscription, SubscriptionEvent};
use crate::transport::{Codec, Dialer, Transport, TransportDone};

const COMMAND_QUEUE_HIGH_WATER_MARK: usize = 256;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the actor owns: connection state, correlator, subscription
/// registry, reconnect context, refresh schedule, metrics and streams (§5:
/// "a single logical mutex... guards the connection state, the subscription
/// registry, the correlator table, and the reconnect context" — here that
/// mutex is simply single-task ownership, not a lock).
pub(crate) struct Session {
    pub(crate) state: ConnectionState,
    pub(crate) correlator: Correlator,
    pub(crate) registry: Registry,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) streams: Streams,
    pub(crate) refresh: RefreshScheduler,
    pub(crate) resubscribe: ResubscribeScheduler,
    pub(crate) reconnect_ctx: ReconnectContext,
    pub(crate) config: ClientConfig,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) url: String,
    pub(crate) next_id: u32,
    pub(crate) queue: Option<QueueHandle>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) state_watch: watch::Sender<ConnectionState>,
    /// Completion handles for subscribe commands issued on behalf of a
    /// `SubscriptionHandle::subscribe()` caller, resolved once the actor
    /// itself observes the correlated reply (see [`Instruction::SubscribeSettled`]).
    pub(crate) pending_subscribe_acks: HashMap<u32, oneshot::Sender<Result<(), EngineError>>>,
    /// The originating command kind for every in-flight correlated id, so
    /// the reply router can attribute a per-kind metric when the reply
    /// arrives (§3: "counters per reply kind").
    pub(crate) inflight_kinds: HashMap<u32, &'static str>,
    /// A clone of the actor's own instruction sender, handed to spawned
    /// watcher tasks so they can report back onto the same channel the
    /// actor already services (keeps "only the actor mutates state" true
    /// even for work that must await something, e.g. a correlated reply).
    pub(crate) self_tx: mpsc::Sender<Instruction>,
}

impl Session {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn emit_state(&self) {
        let event = StateEvent { state: self.state.clone(), at: SystemTime::now() };
        let _ = self.state_watch.send(self.state.clone());
        let _ = self.streams.states.send(event);
    }

    /// Connection-loss teardown shared by user-initiated disconnect and
    /// server-pushed disconnect (§4.8 (c)).
    fn teardown(&mut self, reason: &str) {
        let was_live = !matches!(self.state, ConnectionState::Disconnected | ConnectionState::Closed);
        if was_live {
            self.metrics.record_disconnect();
        }
        let _ = state::apply(&mut self.state, Transition::Disconnect);
        self.emit_state();
        self.correlator.fail_all(&ReplyErrorPayload { code: 0, message: reason.to_string(), temporary: true });
        self.registry.teardown_for_disconnect();
        self.refresh.clear();
        // Replay-on-reconnect (`finish_connect_ok`) re-issues every
        // desired-subscribed channel from scratch once reconnected, so a
        // same-session backoff retry scheduled before the disconnect would
        // now just race it.
        self.resubscribe = ResubscribeScheduler::new();
        self.inflight_kinds.clear();
        self.queue = None;
        self.transport = None;
    }

    /// Server-pushed disconnect (§4.3 synthetic path, §4.6): teardown, then
    /// let the Reconnection Controller decide the next step. A server-given
    /// `next_reconnect_at`/`reconnect_url` takes precedence over the
    /// computed backoff (§4.6).
    pub(crate) fn handle_disconnect(
        &mut self,
        _code: u32,
        reason: String,
        reconnect: bool,
        next_reconnect_at: Option<u64>,
        reconnect_url: Option<String>,
    ) {
        if self.state.is_closed() {
            return;
        }
        self.teardown(&reason);
        let server_next_at = next_reconnect_at.map(millis_to_system_time);
        let decision = reconnect::decide(
            &mut self.reconnect_ctx,
            reconnect,
            self.config.connection_retry_interval,
            server_next_at,
            reconnect_url,
        );
        match decision {
            ReconnectDecision::Retry { at, url_override } => {
                self.metrics.set_reconnect_context(url_override, Some(epoch_millis(at)));
            }
            ReconnectDecision::Permanent => {
                self.metrics.clear_reconnect_context();
            }
        }
    }

    /// Forces a subscription back through `Subscribing`, carrying its
    /// current epoch/offset/token so the next `Subscribe` command asks the
    /// server for recovery (spec.md §9 Open Question #2, §4.4 Unsubscribe
    /// handling). No-ops for an unknown channel or a server-managed one.
    pub(crate) async fn force_resubscribe(&mut self, channel: &str) {
        issue_subscribe(self, channel, None).await;
    }
}

/// Resolves the token to send on a `Connect`/`Subscribe`/`Refresh` command:
/// a configured callback always wins (minting a fresh token on every call,
/// §4.7), falling back to the static token otherwise.
async fn resolve_token(static_token: &Option<String>, callback: &Option<TokenCallback>) -> Option<String> {
    match callback {
        Some(cb) => Some(cb().await),
        None => static_token.clone(),
    }
}

/// Issues (or re-issues) a `Subscribe` command for `channel` and arranges
/// for the actor to observe its own reply: a watcher task awaits the
/// correlator's oneshot and reports back via [`Instruction::SubscribeSettled`]
/// on `session.self_tx`, so state transitions and backoff scheduling happen
/// on the actor's own task (§5) even though the reply itself is only
/// available later. `ack`, if given, is resolved once that reply settles —
/// unless enqueueing itself fails synchronously, in which case it is
/// resolved immediately.
async fn issue_subscribe(session: &mut Session, channel: &str, ack: Option<oneshot::Sender<Result<(), EngineError>>>) {
    let (token_static, token_cb) = match session.registry.get(channel) {
        Some(sub) if sub.kind == SubKind::Client => (sub.token.clone(), sub.token_callback.clone()),
        Some(_) => {
            if let Some(ack) = ack {
                let _ = ack.send(Err(ServerManagedError.into()));
            }
            return;
        }
        None => {
            if let Some(ack) = ack {
                let _ = ack.send(Err(UnknownChannelError.into()));
            }
            return;
        }
    };
    let token = resolve_token(&token_static, &token_cb).await;

    let Some(sub) = session.registry.get_mut(channel) else {
        if let Some(ack) = ack {
            let _ = ack.send(Err(UnknownChannelError.into()));
        }
        return;
    };
    sub.state = SubState::Subscribing;
    let payload = subscribe_payload(sub, token);

    let Some(queue) = session.queue.clone() else {
        if let Some(ack) = ack {
            let _ = ack.send(Err(ConnectionError::NotConnected.into()));
        }
        return;
    };

    let id = session.alloc_id();
    let rx = session.correlator.register(id);
    session.inflight_kinds.insert(id, "subscribe");
    let cmd = Command::new(id, CommandKind::Subscribe { channel: channel.to_string(), payload });
    if queue.enqueue(cmd).is_err() {
        session.correlator.evict(id);
        session.inflight_kinds.remove(&id);
        if let Some(ack) = ack {
            let _ = ack.send(Err(SendError::Backpressure.into()));
        }
        return;
    }

    if let Some(ack) = ack {
        session.pending_subscribe_acks.insert(id, ack);
    }

    let self_tx = session.self_tx.clone();
    let channel_owned = channel.to_string();
    tokio::spawn(async move {
        let settled = match rx.await {
            Ok(result) => result,
            Err(_canceled) => Err(ReplyErrorPayload { code: 0, message: "disconnected".to_string(), temporary: true }),
        };
        let _ = self_tx.send(Instruction::SubscribeSettled { id, channel: channel_owned, result: settled }).await;
    });
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn millis_to_system_time(ms: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(ms)
}

/// Builds a `Subscribe` command payload for `sub`, carrying whatever token
/// was resolved for this attempt (a fresh one from a callback, or the
/// static configured token) rather than reading `sub.token` directly.
fn subscribe_payload(sub: &Subscription, token: Option<String>) -> Box<RawValue> {
    let value = serde_json::json!({
        "channel": sub.channel,
        "token": token,
        "data": sub.data,
        "recover": sub.recoverable,
        "epoch": sub.epoch,
        "offset": sub.offset,
        "positioned": sub.positioned,
        "join_leave": sub.join_leave,
    });
    RawValue::from_string(value.to_string()).expect("serde_json::json! always produces valid JSON")
}

#[derive(serde::Deserialize)]
struct ConnectResultWire {
    client: String,
    #[serde(default)]
    ttl: Option<u64>,
    #[serde(default)]
    expires: bool,
    #[serde(default)]
    subs: HashMap<String, ServerSubWire>,
}

#[derive(serde::Deserialize, Default)]
struct ServerSubWire {
    #[serde(default)]
    recoverable: bool,
    #[serde(default)]
    epoch: String,
    #[serde(default)]
    offset: u64,
}

/// The subset of a `Subscribe` reply payload worth recording locally — a
/// server may confirm/advance recovery position on subscribe, not only on
/// `Publication` pushes (§4.4, §4.5).
#[derive(serde::Deserialize, Default)]
struct SubscribeResultWire {
    #[serde(default)]
    recoverable: bool,
    #[serde(default)]
    epoch: String,
    #[serde(default)]
    offset: u64,
}

type ReplyRx = oneshot::Receiver<Result<Box<RawValue>, ReplyErrorPayload>>;

/// A snapshot of one server-maintained subscription, for the Facade's
/// `server_subscriptions()` accessor (§4.9).
#[derive(Clone, Debug)]
pub struct ServerSubscriptionInfo {
    pub channel: String,
    pub recoverable: bool,
    pub epoch: String,
    pub offset: u64,
}

/// Messages the Facade sends to the actor. Mirrors
/// `ethers_providers::rpc::transports::ws::types::Instruction`, widened from
/// the teacher's two-variant `{Request, Unsubscribe}` set to the full
/// operation surface of §4.9.
pub(crate) enum Instruction {
    Connect { url: String, respond: oneshot::Sender<Result<(), EngineError>> },
    Disconnect { respond: oneshot::Sender<Result<(), EngineError>> },
    Close { respond: oneshot::Sender<Result<(), EngineError>> },
    Submit { kind: CommandKind, ack: oneshot::Sender<Result<Option<ReplyRx>, EngineError>> },
    NewSubscription {
        channel: String,
        config: SubscriptionConfig,
        ack: oneshot::Sender<Result<broadcast::Receiver<SubscriptionEvent>, EngineError>>,
    },
    GetSubscription { channel: String, ack: oneshot::Sender<Option<broadcast::Receiver<SubscriptionEvent>>> },
    SubscriptionSubscribe { channel: String, ack: oneshot::Sender<Result<(), EngineError>> },
    SubscriptionUnsubscribe { channel: String, respond: oneshot::Sender<Result<(), EngineError>> },
    RemoveSubscription { channel: String, respond: oneshot::Sender<Result<(), EngineError>> },
    ServerSubscriptions { respond: oneshot::Sender<HashMap<String, ServerSubscriptionInfo>> },
    /// Self-addressed: a watcher task spawned by [`issue_subscribe`] reports
    /// a `Subscribe` command's correlated reply back to the actor so it can
    /// update `SubState`, schedule a backoff retry, and resolve whichever
    /// caller is waiting (§4.5).
    SubscribeSettled { id: u32, channel: String, result: Result<Box<RawValue>, ReplyErrorPayload> },
}

struct ConnectWaiter {
    rx: ReplyRx,
    respond: Option<oneshot::Sender<Result<(), EngineError>>>,
    deadline: TokioInstant,
}

/// Spawns one command-writer task per connection episode: drains the
/// [`crate::queue::QueueDrain`] in priority order, encodes through the
/// injected [`Codec`], and hands bytes to the transport (§4.2, §5: "the
/// engine runs two dedicated tasks per session — the transport reader and
/// writer"). Grounded on `WsBackend::spawn`'s dispatcher-draining loop.
fn spawn_writer(
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    metrics: Arc<Metrics>,
    mut drain: queue::QueueDrain,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(cmd) = drain.recv().await {
            let frame = match codec.encode(&cmd) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode command, dropping");
                    continue;
                }
            };
            metrics.record_sent(frame.len());
            if let Err(err) = transport.send(frame).await {
                tracing::debug!(error = %err, "transport send failed, writer task exiting");
                break;
            }
        }
    })
}

/// Dials, registers the connect command, and submits it — shared by
/// explicit `connect()` calls and automatic reconnection (§4.6, §4.8).
async fn start_connect(
    session: &mut Session,
    url: String,
    respond: Option<oneshot::Sender<Result<(), EngineError>>>,
) -> Option<(ConnectWaiter, mpsc::Receiver<Vec<u8>>, oneshot::Receiver<TransportDone>, tokio::task::JoinHandle<()>)> {
    if state::apply(&mut session.state, Transition::StartConnecting).is_err() {
        if let Some(respond) = respond {
            let _ = respond.send(Err(ConnectionError::AlreadyConnected.into()));
        }
        return None;
    }
    session.url = url.clone();
    session.emit_state();

    let handle = match session.dialer.dial(&url).await {
        Ok(handle) => handle,
        Err(err) => {
            let _ = state::apply(&mut session.state, Transition::Disconnect);
            session.emit_state();
            if let Some(respond) = respond {
                let _ = respond.send(Err(ConnectionError::Dial(Box::new(err)).into()));
            }
            return None;
        }
    };

    let (queue, drain) = queue::channel(COMMAND_QUEUE_HIGH_WATER_MARK);
    let writer = spawn_writer(handle.transport.clone(), session.codec.clone(), session.metrics.clone(), drain);
    session.transport = Some(handle.transport);

    let token = resolve_token(&session.config.token, &session.config.token_callback).await;

    let id = session.alloc_id();
    let rx = session.correlator.register(id);
    session.inflight_kinds.insert(id, "connect");
    let cmd = Command::new(
        id,
        CommandKind::Connect { token, name: session.config.name.clone(), version: session.config.version.clone() },
    );
    if queue.enqueue(cmd).is_err() {
        session.correlator.evict(id);
        session.inflight_kinds.remove(&id);
        let _ = state::apply(&mut session.state, Transition::Disconnect);
        session.emit_state();
        writer.abort();
        if let Some(respond) = respond {
            let _ = respond.send(Err(SendError::Backpressure.into()));
        }
        return None;
    }
    session.queue = Some(queue);

    let deadline = TokioInstant::now() + session.config.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    Some((ConnectWaiter { rx, respond, deadline }, handle.frames, handle.done, writer))
}

async fn finish_connect_ok(
    session: &mut Session,
    payload: Box<RawValue>,
    respond: Option<oneshot::Sender<Result<(), EngineError>>>,
) {
    let parsed: ConnectResultWire = match serde_json::from_str(payload.get()) {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = state::apply(&mut session.state, Transition::Disconnect);
            session.emit_state();
            if let Some(respond) = respond {
                let _ = respond.send(Err(ConnectionError::Dial(Box::new(err)).into()));
            }
            return;
        }
    };

    let _ = state::apply(
        &mut session.state,
        Transition::ConnectSucceeded { client_id: parsed.client, ttl: parsed.ttl },
    );
    session.emit_state();
    session.metrics.record_connect();
    session.reconnect_ctx.clear();
    session.metrics.clear_reconnect_context();

    session.registry.clear_server_subscriptions();
    for (channel, info) in parsed.subs {
        session.registry.upsert_server_subscription(&channel, info.recoverable, info.epoch, info.offset);
    }

    if parsed.expires {
        if let Some(ttl) = parsed.ttl {
            session.refresh.schedule(RefreshTarget::Connection, Duration::from_secs(ttl));
        }
    }

    let replay: Vec<String> = session.registry.to_replay().iter().map(|sub| sub.channel.clone()).collect();
    for channel in replay {
        session.force_resubscribe(&channel).await;
    }

    if let Some(respond) = respond {
        let _ = respond.send(Ok(()));
    }
}

fn abort_episode(frames_rx: &mut Option<mpsc::Receiver<Vec<u8>>>, done_rx: &mut Option<oneshot::Receiver<TransportDone>>, writer_task: &mut Option<tokio::task::JoinHandle<()>>) {
    *frames_rx = None;
    *done_rx = None;
    if let Some(task) = writer_task.take() {
        task.abort();
    }
}

async fn service_instruction(
    session: &mut Session,
    instr: Instruction,
    connecting: &mut Option<ConnectWaiter>,
    frames_rx: &mut Option<mpsc::Receiver<Vec<u8>>>,
    done_rx: &mut Option<oneshot::Receiver<TransportDone>>,
    writer_task: &mut Option<tokio::task::JoinHandle<()>>,
) {
    match instr {
        Instruction::Connect { url, respond } => {
            if session.state.is_closed() {
                let _ = respond.send(Err(ClosedClientError.into()));
                return;
            }
            if let Some((waiter, frames, done, writer)) = start_connect(session, url, Some(respond)).await {
                *connecting = Some(waiter);
                *frames_rx = Some(frames);
                *done_rx = Some(done);
                *writer_task = Some(writer);
            }
        }
        Instruction::Disconnect { respond } => {
            if session.state.is_closed() {
                let _ = respond.send(Err(ClosedClientError.into()));
                return;
            }
            session.teardown("user requested disconnect");
            session.reconnect_ctx.clear();
            session.metrics.clear_reconnect_context();
            abort_episode(frames_rx, done_rx, writer_task);
            *connecting = None;
            let _ = respond.send(Ok(()));
        }
        Instruction::Close { respond } => {
            session.teardown("client closed");
            let _ = state::apply(&mut session.state, Transition::Close);
            session.emit_state();
            session.registry.clear();
            session.reconnect_ctx.clear();
            abort_episode(frames_rx, done_rx, writer_task);
            *connecting = None;
            let _ = respond.send(Ok(()));
        }
        Instruction::Submit { kind, ack } => {
            let _ = ack.send(submit(session, kind));
        }
        Instruction::NewSubscription { channel, config, ack } => {
            let result = match session.registry.new_client_subscription(&channel, config) {
                Ok(()) => session
                    .registry
                    .get(&channel)
                    .map(Subscription::subscribe_events)
                    .ok_or_else(|| EngineError::from(UnknownChannelError)),
                Err(err) => Err(EngineError::from(err)),
            };
            let _ = ack.send(result);
        }
        Instruction::GetSubscription { channel, ack } => {
            let rx = session.registry.get(&channel).map(Subscription::subscribe_events);
            let _ = ack.send(rx);
        }
        Instruction::SubscriptionSubscribe { channel, ack } => {
            if let Some(sub) = session.registry.get_mut(&channel) {
                sub.desired_subscribed = true;
                sub.resubscribe_attempts = 0;
            }
            session.resubscribe.cancel(&channel);
            issue_subscribe(session, &channel, Some(ack)).await;
        }
        Instruction::SubscriptionUnsubscribe { channel, respond } => {
            let Some(sub) = session.registry.get_mut(&channel) else {
                let _ = respond.send(Err(UnknownChannelError.into()));
                return;
            };
            sub.desired_subscribed = false;
            sub.state = SubState::Unsubscribed;
            session.resubscribe.cancel(&channel);
            if let Some(queue) = session.queue.clone() {
                let id = session.alloc_id();
                let cmd = Command::new(id, CommandKind::Unsubscribe { channel });
                let _ = queue.enqueue(cmd);
            }
            let _ = respond.send(Ok(()));
        }
        Instruction::RemoveSubscription { channel, respond } => {
            match session.registry.get(&channel) {
                Some(sub) if sub.kind == SubKind::Server => {
                    let _ = respond.send(Err(ServerManagedError.into()));
                }
                Some(_) => {
                    session.resubscribe.cancel(&channel);
                    session.registry.remove(&channel);
                    let _ = respond.send(Ok(()));
                }
                None => {
                    let _ = respond.send(Ok(()));
                }
            }
        }
        Instruction::ServerSubscriptions { respond } => {
            let map = session
                .registry
                .server_subscriptions()
                .map(|sub| {
                    (
                        sub.channel.clone(),
                        ServerSubscriptionInfo {
                            channel: sub.channel.clone(),
                            recoverable: sub.recoverable,
                            epoch: sub.epoch.clone(),
                            offset: sub.offset,
                        },
                    )
                })
                .collect();
            let _ = respond.send(map);
        }
        Instruction::SubscribeSettled { id, channel, result } => {
            let ack = session.pending_subscribe_acks.remove(&id);
            match result {
                Ok(payload) => {
                    if let Some(sub) = session.registry.get_mut(&channel) {
                        if sub.kind == SubKind::Client {
                            sub.state = SubState::Subscribed;
                            sub.resubscribe_attempts = 0;
                            session.resubscribe.cancel(&channel);
                            if let Ok(wire) = serde_json::from_str::<SubscribeResultWire>(payload.get()) {
                                sub.recoverable = sub.recoverable || wire.recoverable;
                                if !wire.epoch.is_empty() {
                                    sub.epoch = wire.epoch;
                                }
                                sub.offset = sub.offset.max(wire.offset);
                            }
                        }
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(payload) => {
                    let temporary = payload.temporary;
                    let sub_err = Registry::to_subscription_error(&channel, payload.clone());
                    let engine_err: EngineError = sub_err.into();
                    let _ = session.streams.errors.send((&engine_err).into());

                    if let Some(sub) = session.registry.get_mut(&channel) {
                        if sub.kind == SubKind::Client {
                            sub.state = SubState::Unsubscribed;
                            sub.observe_error(payload);
                            if temporary && sub.desired_subscribed {
                                sub.resubscribe_attempts += 1;
                                let interval = crate::config::RetryInterval {
                                    min: sub.min_resubscribe_delay,
                                    max: sub.max_resubscribe_delay,
                                };
                                let delay = reconnect::backoff_delay(sub.resubscribe_attempts - 1, interval);
                                session.resubscribe.schedule(channel.clone(), SystemTime::now() + delay);
                            }
                        }
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(engine_err));
                    }
                }
            }
        }
    }
}

/// Registers and enqueues one correlated (or fire-and-forget) command
/// (§4.1, §4.2). Returns the caller's completion handle; `None` for `Send`,
/// which carries no reply (§3).
fn submit(session: &mut Session, kind: CommandKind) -> Result<Option<ReplyRx>, EngineError> {
    let Some(queue) = session.queue.clone() else { return Err(ConnectionError::NotConnected.into()) };
    let expects_reply = kind.expects_reply();
    let kind_name = kind.kind_name();
    let id = if expects_reply { session.alloc_id() } else { 0 };
    let rx = if expects_reply { Some(session.correlator.register(id)) } else { None };
    if expects_reply {
        session.inflight_kinds.insert(id, kind_name);
    }
    let cmd = Command::new(id, kind);
    if let Err(err) = queue.enqueue(cmd) {
        if expects_reply {
            session.correlator.evict(id);
            session.inflight_kinds.remove(&id);
        }
        return Err(EngineError::Send(err));
    }
    Ok(rx)
}

/// Runs the actor until every [`Client`]/[`SubscriptionHandle`] handle to
/// its instruction channel is dropped or `close()` is called (§4.8, §5).
pub(crate) async fn run(mut session: Session, mut instructions: mpsc::Receiver<Instruction>) {
    let mut frames_rx: Option<mpsc::Receiver<Vec<u8>>> = None;
    let mut done_rx: Option<oneshot::Receiver<TransportDone>> = None;
    let mut writer_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut connecting: Option<ConnectWaiter> = None;

    loop {
        if session.state.is_closed() {
            break;
        }

        let refresh_dur = session
            .refresh
            .next_deadline()
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::from_secs(86_400));
        let has_refresh = session.refresh.next_deadline().is_some();

        let resubscribe_dur = session
            .resubscribe
            .next_deadline()
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::from_secs(86_400));
        let has_resubscribe = session.resubscribe.next_deadline().is_some();

        let reconnect_dur = session
            .reconnect_ctx
            .next_at
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::from_secs(86_400));
        let has_reconnect = session.reconnect_ctx.next_at.is_some() && connecting.is_none();

        let has_connecting = connecting.is_some();
        let connect_deadline = connecting.as_ref().map(|w| w.deadline).unwrap_or_else(TokioInstant::now);

        tokio::select! {
            biased;

            maybe_instr = instructions.recv() => {
                match maybe_instr {
                    Some(instr) => service_instruction(&mut session, instr, &mut connecting, &mut frames_rx, &mut done_rx, &mut writer_task).await,
                    None => break,
                }
            }

            reply = &mut connecting.as_mut().unwrap().rx, if has_connecting => {
                let waiter = connecting.take().unwrap();
                match reply {
                    Ok(Ok(payload)) => finish_connect_ok(&mut session, payload, waiter.respond).await,
                    Ok(Err(payload)) => {
                        let _ = state::apply(&mut session.state, Transition::Disconnect);
                        session.emit_state();
                        abort_episode(&mut frames_rx, &mut done_rx, &mut writer_task);
                        if let Some(respond) = waiter.respond {
                            let _ = respond.send(Err(ConnectionError::Rejected(payload).into()));
                        }
                    }
                    Err(_canceled) => {
                        let _ = state::apply(&mut session.state, Transition::Disconnect);
                        session.emit_state();
                        abort_episode(&mut frames_rx, &mut done_rx, &mut writer_task);
                        if let Some(respond) = waiter.respond {
                            let _ = respond.send(Err(ConnectionError::Timeout.into()));
                        }
                    }
                }
            }

            _ = tokio::time::sleep_until(connect_deadline), if has_connecting => {
                let waiter = connecting.take().unwrap();
                let _ = state::apply(&mut session.state, Transition::Disconnect);
                session.emit_state();
                abort_episode(&mut frames_rx, &mut done_rx, &mut writer_task);
                if let Some(respond) = waiter.respond {
                    let _ = respond.send(Err(ConnectionError::Timeout.into()));
                }
            }

            Some(frame) = frames_rx.as_mut().unwrap().recv(), if frames_rx.is_some() => {
                session.metrics.record_received(frame.len());
                match session.codec.decode(&frame) {
                    Ok(items) => for item in items { session.route_inbound(item).await; },
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to decode inbound frame, synthesizing disconnect");
                        abort_episode(&mut frames_rx, &mut done_rx, &mut writer_task);
                        session.route_transport_done(TransportDone { raw_close_code: None }).await;
                    }
                }
                // A push-level Disconnect (handled inline above) already tore
                // the episode down; the transport's own `done` signal for it
                // is now stale and must not be allowed to re-decide the
                // reconnect outcome (it would normalize a missing close code
                // to non-reconnecting and clobber a just-scheduled retry).
                if session.transport.is_none() && frames_rx.is_some() {
                    abort_episode(&mut frames_rx, &mut done_rx, &mut writer_task);
                }
            }

            done = done_rx.as_mut().unwrap(), if done_rx.is_some() => {
                abort_episode(&mut frames_rx, &mut done_rx, &mut writer_task);
                session.route_transport_done(done.unwrap_or_default()).await;
            }

            _ = tokio::time::sleep(reconnect_dur), if has_reconnect => {
                let url = session.reconnect_ctx.url_override.clone().unwrap_or_else(|| session.url.clone());
                session.reconnect_ctx.next_at = None;
                if let Some((waiter, frames, done, writer)) = start_connect(&mut session, url, None).await {
                    connecting = Some(waiter);
                    frames_rx = Some(frames);
                    done_rx = Some(done);
                    writer_task = Some(writer);
                }
            }

            _ = tokio::time::sleep(refresh_dur), if has_refresh => {
                let due = session.refresh.due(SystemTime::now());
                for item in due {
                    fire_refresh(&mut session, item.target).await;
                }
            }

            _ = tokio::time::sleep(resubscribe_dur), if has_resubscribe => {
                let due = session.resubscribe.due(SystemTime::now());
                for channel in due {
                    session.force_resubscribe(&channel).await;
                }
            }
        }
    }

    abort_episode(&mut frames_rx, &mut done_rx, &mut writer_task);
    if let Some(transport) = session.transport.take() {
        let _ = transport.disconnect(None, None).await;
    }
}

/// Issues the `Refresh`/`SubRefresh` command for one due deadline (§4.7). A
/// missed deadline (this function not managing to enqueue, e.g. because the
/// session already dropped its queue while disconnected) is itself a missed
/// refresh and triggers the disconnect §4.7 prescribes.
async fn fire_refresh(session: &mut Session, target: RefreshTarget) {
    let Some(queue) = session.queue.clone() else {
        session.handle_disconnect(4, "missed token refresh".to_string(), true, None, None);
        return;
    };

    let kind = match &target {
        RefreshTarget::Connection => {
            let token = resolve_token(&session.config.token, &session.config.token_callback).await;
            let Some(token) = token else { return };
            CommandKind::Refresh { token }
        }
        RefreshTarget::Subscription { channel } => {
            let Some((static_token, callback)) =
                session.registry.get(channel).map(|sub| (sub.token.clone(), sub.token_callback.clone()))
            else {
                return;
            };
            let Some(token) = resolve_token(&static_token, &callback).await else { return };
            CommandKind::SubRefresh { channel: channel.clone(), token }
        }
    };

    let kind_name = kind.kind_name();
    let id = session.alloc_id();
    let _rx = session.correlator.register(id);
    session.inflight_kinds.insert(id, kind_name);
    let cmd = Command::new(id, kind);
    if queue.enqueue(cmd).is_err() {
        session.correlator.evict(id);
        session.inflight_kinds.remove(&id);
        session.handle_disconnect(4, "missed token refresh".to_string(), true, None, None);
    }
}

// ---------------------------------------------------------------------
// Public facade
// ---------------------------------------------------------------------

/// A handle to one channel subscription (§3, §4.5). Cloning shares the same
/// underlying registry entry; each clone gets its own broadcast cursor via
/// [`Client::get_subscription`].
pub struct SubscriptionHandle {
    channel: String,
    instructions: mpsc::Sender<Instruction>,
    events: broadcast::Receiver<SubscriptionEvent>,
    call_timeout: Duration,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Requests the server subscribe this channel, carrying recovery
    /// parameters if previously subscribed (§4.5).
    pub async fn subscribe(&self) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        send_instruction(
            &self.instructions,
            Instruction::SubscriptionSubscribe { channel: self.channel.clone(), ack: ack_tx },
        )
        .await?;
        ack_rx.await.map_err(|_| ClosedClientError.into())?
    }

    /// Requests the server unsubscribe this channel (§4.5: "`unsubscribe`
    /// transitions immediately to `Unsubscribed` regardless of outcome").
    pub async fn unsubscribe(&self) -> Result<(), EngineError> {
        let (respond_tx, respond_rx) = oneshot::channel();
        send_instruction(
            &self.instructions,
            Instruction::SubscriptionUnsubscribe { channel: self.channel.clone(), respond: respond_tx },
        )
        .await?;
        respond_rx.await.map_err(|_| ClosedClientError.into())?
    }

    /// The subscription's combined publication/presence/error stream.
    pub async fn recv(&mut self) -> Result<SubscriptionEvent, broadcast::error::RecvError> {
        self.events.recv().await
    }
}

/// The session engine's public entry point (§4.9). Cheaply `Clone`: every
/// clone shares the same actor via its instruction channel, the same
/// `Streams` broadcast senders, and the same `Metrics`.
#[derive(Clone)]
pub struct Client {
    instructions: mpsc::Sender<Instruction>,
    state_watch: watch::Receiver<ConnectionState>,
    streams: Streams,
    metrics: Arc<Metrics>,
    call_timeout: Duration,
}

async fn send_instruction(instructions: &mpsc::Sender<Instruction>, instr: Instruction) -> Result<(), EngineError> {
    instructions.send(instr).await.map_err(|_| ClosedClientError.into())
}

impl Client {
    /// Constructs a client bound to the given config, codec and dialer, and
    /// spawns its actor task. No connection attempt is made until
    /// [`Client::connect`] is called (§4.9).
    pub fn new(config: ClientConfig, codec: Arc<dyn Codec>, dialer: Arc<dyn Dialer>) -> Self {
        let call_timeout = config.timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        let streams = Streams::new();
        let metrics = Arc::new(Metrics::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (instructions_tx, instructions_rx) = mpsc::channel(64);

        let session = Session {
            state: ConnectionState::Disconnected,
            correlator: Correlator::new(),
            registry: Registry::new(),
            metrics: metrics.clone(),
            streams: streams.clone(),
            refresh: RefreshScheduler::new(),
            resubscribe: ResubscribeScheduler::new(),
            reconnect_ctx: ReconnectContext::default(),
            config,
            codec,
            dialer,
            url: String::new(),
            next_id: 0,
            queue: None,
            transport: None,
            state_watch: state_tx,
            pending_subscribe_acks: HashMap::new(),
            inflight_kinds: HashMap::new(),
            self_tx: instructions_tx.clone(),
        };

        tokio::spawn(run(session, instructions_rx));

        Self { instructions: instructions_tx, state_watch: state_rx, streams, metrics, call_timeout }
    }

    pub async fn connect(&self, url: impl Into<String>) -> Result<(), EngineError> {
        let (respond_tx, respond_rx) = oneshot::channel();
        send_instruction(&self.instructions, Instruction::Connect { url: url.into(), respond: respond_tx }).await?;
        respond_rx.await.map_err(|_| ClosedClientError.into())?
    }

    /// Awaits `Connected`, per §4.9: fails immediately from `Disconnected`
    /// or `Closed`, otherwise waits up to the configured connect timeout.
    pub async fn ready(&self) -> Result<(), EngineError> {
        let mut watch = self.state_watch.clone();
        match &*watch.borrow_and_update() {
            ConnectionState::Connected { .. } => return Ok(()),
            ConnectionState::Closed => return Err(ClosedClientError.into()),
            ConnectionState::Disconnected => return Err(ConnectionError::NotConnected.into()),
            ConnectionState::Connecting => {}
        }

        let wait = async {
            loop {
                watch.changed().await.map_err(|_| EngineError::from(ClosedClientError))?;
                match &*watch.borrow() {
                    ConnectionState::Connected { .. } => return Ok(()),
                    ConnectionState::Closed => return Err(EngineError::from(ClosedClientError)),
                    ConnectionState::Disconnected => return Err(EngineError::from(ConnectionError::NotConnected)),
                    ConnectionState::Connecting => continue,
                }
            }
        };
        tokio::time::timeout(self.call_timeout, wait).await.map_err(|_| ConnectionError::Timeout)?
    }

    pub async fn disconnect(&self) -> Result<(), EngineError> {
        let (respond_tx, respond_rx) = oneshot::channel();
        send_instruction(&self.instructions, Instruction::Disconnect { respond: respond_tx }).await?;
        respond_rx.await.map_err(|_| ClosedClientError.into())?
    }

    /// Releases the transport, cancels timers and refuses all subsequent
    /// operations (§4.8, §5: "`close()` guarantees release... before
    /// returning").
    pub async fn close(&self) -> Result<(), EngineError> {
        let (respond_tx, respond_rx) = oneshot::channel();
        send_instruction(&self.instructions, Instruction::Close { respond: respond_tx }).await?;
        respond_rx.await.map_err(|_| ClosedClientError.into())?
    }

    /// Fire-and-forget send: carries no reply (§3 `Send`).
    pub async fn send(&self, data: Box<RawValue>) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        send_instruction(&self.instructions, Instruction::Submit { kind: CommandKind::Send { data }, ack: ack_tx })
            .await?;
        let rx = ack_rx.await.map_err(|_| EngineError::from(ClosedClientError))??;
        debug_assert!(rx.is_none());
        Ok(())
    }

    pub async fn rpc(&self, method: impl Into<String>, data: Box<RawValue>) -> Result<Box<RawValue>, EngineError> {
        self.call(CommandKind::Rpc { method: method.into(), data }).await
    }

    pub async fn publish(&self, channel: impl Into<String>, data: Box<RawValue>) -> Result<(), EngineError> {
        self.call(CommandKind::Publish { channel: channel.into(), data }).await.map(|_| ())
    }

    pub async fn history(
        &self,
        channel: impl Into<String>,
        opts: HistoryOptions,
    ) -> Result<Box<RawValue>, EngineError> {
        self.call(CommandKind::History {
            channel: channel.into(),
            limit: opts.limit,
            since: opts.since,
            reverse: opts.reverse,
        })
        .await
    }

    pub async fn presence(&self, channel: impl Into<String>) -> Result<Box<RawValue>, EngineError> {
        self.call(CommandKind::Presence { channel: channel.into() }).await
    }

    pub async fn presence_stats(&self, channel: impl Into<String>) -> Result<Box<RawValue>, EngineError> {
        self.call(CommandKind::PresenceStats { channel: channel.into() }).await
    }

    /// Submits a command that expects a correlated reply and awaits it
    /// (§4.1, §4.2). Every `kind` passed here must have `expects_reply()`
    /// true; a missing reply channel indicates the actor dropped the
    /// command before registering it (reported as `NotConnected` rather
    /// than panicking).
    async fn call(&self, kind: CommandKind) -> Result<Box<RawValue>, EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        send_instruction(&self.instructions, Instruction::Submit { kind, ack: ack_tx }).await?;
        let rx = ack_rx.await.map_err(|_| EngineError::from(ClosedClientError))??;
        let result = match rx {
            Some(rx) => await_reply(rx, self.call_timeout).await,
            None => Err(ConnectionError::NotConnected.into()),
        };
        if let Err(ref err) = result {
            // §7: every surfaced failure from a correlated call is also
            // published on the errors stream, not just push-driven ones.
            let _ = self.streams.errors.send(err.into());
        }
        result
    }

    /// Creates a fresh client-side subscription (§4.5).
    pub async fn new_subscription(
        &self,
        channel: impl Into<String>,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle, EngineError> {
        let channel = channel.into();
        let (ack_tx, ack_rx) = oneshot::channel();
        send_instruction(
            &self.instructions,
            Instruction::NewSubscription { channel: channel.clone(), config, ack: ack_tx },
        )
        .await?;
        let events = ack_rx.await.map_err(|_| EngineError::from(ClosedClientError))??;
        Ok(SubscriptionHandle { channel, instructions: self.instructions.clone(), events, call_timeout: self.call_timeout })
    }

    pub async fn get_subscription(&self, channel: impl Into<String>) -> Option<SubscriptionHandle> {
        let channel = channel.into();
        let (ack_tx, ack_rx) = oneshot::channel();
        if send_instruction(&self.instructions, Instruction::GetSubscription { channel: channel.clone(), ack: ack_tx })
            .await
            .is_err()
        {
            return None;
        }
        let events = ack_rx.await.ok().flatten()?;
        Some(SubscriptionHandle { channel, instructions: self.instructions.clone(), events, call_timeout: self.call_timeout })
    }

    pub async fn remove_subscription(&self, handle: SubscriptionHandle) -> Result<(), EngineError> {
        let (respond_tx, respond_rx) = oneshot::channel();
        send_instruction(
            &self.instructions,
            Instruction::RemoveSubscription { channel: handle.channel, respond: respond_tx },
        )
        .await?;
        respond_rx.await.map_err(|_| ClosedClientError.into())?
    }

    pub async fn server_subscriptions(&self) -> HashMap<String, ServerSubscriptionInfo> {
        let (respond_tx, respond_rx) = oneshot::channel();
        if send_instruction(&self.instructions, Instruction::ServerSubscriptions { respond: respond_tx }).await.is_err()
        {
            return HashMap::new();
        }
        respond_rx.await.unwrap_or_else(|_| HashMap::new())
    }

    /// The current connection state, read without round-tripping the actor
    /// (`watch` always holds the latest value, §5 lossy-latest semantics).
    pub fn state(&self) -> ConnectionState {
        self.state_watch.borrow().clone()
    }

    pub fn states(&self) -> broadcast::Receiver<StateEvent> {
        self.streams.states.subscribe()
    }

    pub fn publications(&self) -> broadcast::Receiver<crate::streams::PublicationEvent> {
        self.streams.publications.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<crate::streams::ErrorEvent> {
        self.streams.errors.subscribe()
    }

    pub fn messages(&self) -> broadcast::Receiver<crate::streams::MessageEvent> {
        self.streams.messages.subscribe()
    }

    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The state stream adapted to a [`futures_util::Stream`], for callers
    /// that want to `.next().await` rather than match on `RecvError` by
    /// hand (§5, §4.9).
    pub fn states_stream(&self) -> BroadcastStream<StateEvent> {
        BroadcastStream::new(self.states())
    }

    pub fn publications_stream(&self) -> BroadcastStream<crate::streams::PublicationEvent> {
        BroadcastStream::new(self.publications())
    }

    pub fn errors_stream(&self) -> BroadcastStream<crate::streams::ErrorEvent> {
        BroadcastStream::new(self.errors())
    }

    pub fn messages_stream(&self) -> BroadcastStream<crate::streams::MessageEvent> {
        BroadcastStream::new(self.messages())
    }
}
