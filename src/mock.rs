//! In-memory mock transport/dialer for this crate's own test suite and for
//! a host application's tests.
//!
//! Grounded on `ethers_providers::rpc::transports::mock::MockProvider`,
//! which the teacher likewise ships as an always-available, always-public
//! module rather than gating it to `cfg(test)` — reshaped here from a
//! request/response queue to the frame-push model [`Transport`]/[`Dialer`]
//! expose, since this crate's L1-L4 do their own request/reply correlation
//! rather than relying on the transport for it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::transport::{BoxFuture, Dialer, Transport, TransportDone, TransportHandle};

/// The client-facing half of one connection episode: records every frame
/// [`Client`](crate::Client) sends and forwards disconnect requests.
struct MockTransport {
    sent: Arc<Mutex<VecDeque<Vec<u8>>>>,
    closed: Arc<Mutex<bool>>,
}

impl Transport for MockTransport {
    fn send(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
        if *self.closed.lock().unwrap() {
            return Box::pin(async { Err(TransportError::Closed) });
        }
        self.sent.lock().unwrap().push_back(frame);
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&self, _code: Option<u16>, _reason: Option<String>) -> BoxFuture<'_, Result<(), TransportError>> {
        *self.closed.lock().unwrap() = true;
        Box::pin(async { Ok(()) })
    }
}

/// The test-facing half of one connection episode: push server frames,
/// inspect what the client sent, and end the episode with a close code.
pub struct MockEpisode {
    sent: Arc<Mutex<VecDeque<Vec<u8>>>>,
    frames_tx: mpsc::Sender<Vec<u8>>,
    done_tx: Option<oneshot::Sender<TransportDone>>,
}

impl MockEpisode {
    /// Delivers one already-encoded inbound frame to the client, as if the
    /// server had sent it.
    pub async fn push_frame(&self, frame: Vec<u8>) {
        let _ = self.frames_tx.send(frame).await;
    }

    /// Drains every frame the client has sent since the last call.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().drain(..).collect()
    }

    /// Ends the episode, as if the transport had observed `code` and
    /// stopped delivering frames.
    pub fn close(&mut self, code: Option<u16>) {
        if let Some(done_tx) = self.done_tx.take() {
            let _ = done_tx.send(TransportDone { raw_close_code: code });
        }
    }
}

/// Hands out a fresh [`MockEpisode`] on every [`Dialer::dial`] call, so a
/// test can drive an initial connect and every subsequent reconnect
/// attempt independently.
pub struct MockDialer {
    episodes: mpsc::UnboundedSender<MockEpisode>,
    fail_next: Arc<Mutex<bool>>,
}

impl MockDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockEpisode>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { episodes: tx, fail_next: Arc::new(Mutex::new(false)) }, rx)
    }

    /// Makes the next `dial` call fail instead of producing an episode.
    pub fn fail_next_dial(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

impl Dialer for MockDialer {
    fn dial(&self, _url: &str) -> BoxFuture<'static, Result<TransportHandle, TransportError>> {
        let episodes = self.episodes.clone();
        let fail_next = self.fail_next.clone();
        Box::pin(async move {
            if std::mem::take(&mut *fail_next.lock().unwrap()) {
                return Err(TransportError::Closed);
            }

            let sent = Arc::new(Mutex::new(VecDeque::new()));
            let (frames_tx, frames_rx) = mpsc::channel(64);
            let (done_tx, done_rx) = oneshot::channel();
            let transport = Arc::new(MockTransport { sent: sent.clone(), closed: Arc::new(Mutex::new(false)) });

            let _ = episodes.send(MockEpisode { sent, frames_tx, done_tx: Some(done_tx) });

            Ok(TransportHandle { transport, frames: frames_rx, done: done_rx })
        })
    }
}
