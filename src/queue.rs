//! L2 Command Queue (§4.2).
//!
//! Grounded on the dispatch-channel split in
//! `ethers_providers::rpc::transports::ws::backend::{WsBackend, BackendDriver}`
//! (`to_dispatch` / `dispatcher` `mpsc::unbounded` pair), generalized from a
//! single FIFO to two bounded priority lanes drained control-first.

use tokio::sync::mpsc;

use crate::command::{Command, Priority};
use crate::error::SendError;

/// The writer-side handle: enqueues encoded outbound commands (§4.2).
#[derive(Clone)]
pub struct QueueHandle {
    control_tx: mpsc::Sender<Command>,
    normal_tx: mpsc::Sender<Command>,
}

/// The transport-writer side: drains both lanes, control first (§4.2).
pub struct QueueDrain {
    control_rx: mpsc::Receiver<Command>,
    normal_rx: mpsc::Receiver<Command>,
}

/// Creates a bounded command queue. `high_water_mark` bounds each lane
/// independently; exceeding it surfaces as [`SendError::Backpressure`]
/// (§4.2: "Enqueue fails with backpressure when the queue exceeds its
/// high-water mark").
pub fn channel(high_water_mark: usize) -> (QueueHandle, QueueDrain) {
    let (control_tx, control_rx) = mpsc::channel(high_water_mark);
    let (normal_tx, normal_rx) = mpsc::channel(high_water_mark);
    (QueueHandle { control_tx, normal_tx }, QueueDrain { control_rx, normal_rx })
}

impl QueueHandle {
    /// Enqueues `cmd` onto the lane matching its kind's priority.
    pub fn enqueue(&self, cmd: Command) -> Result<(), SendError> {
        let lane = match cmd.kind.priority() {
            Priority::Control => &self.control_tx,
            Priority::Normal => &self.normal_tx,
        };
        lane.try_send(cmd).map_err(|_| SendError::Backpressure)
    }
}

impl QueueDrain {
    /// Receives the next command, preferring the control lane (§4.2:
    /// "drains in priority order"). Returns `None` once both lanes have
    /// been closed (every [`QueueHandle`] dropped).
    pub async fn recv(&mut self) -> Option<Command> {
        tokio::select! {
            biased;
            Some(cmd) = self.control_rx.recv() => Some(cmd),
            Some(cmd) = self.normal_rx.recv() => Some(cmd),
            else => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use serde_json::value::RawValue;

    fn send_cmd(id: u32) -> Command {
        Command::new(id, CommandKind::Send { data: RawValue::from_string("1".into()).unwrap() })
    }

    fn ping_cmd(id: u32) -> Command {
        Command::new(id, CommandKind::Ping)
    }

    #[tokio::test]
    async fn drains_control_before_normal() {
        let (tx, mut rx) = channel(8);
        tx.enqueue(send_cmd(1)).unwrap();
        tx.enqueue(ping_cmd(2)).unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, CommandKind::Ping));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, CommandKind::Send { .. }));
    }

    #[tokio::test]
    async fn backpressure_when_lane_full() {
        let (tx, mut rx) = channel(1);
        tx.enqueue(send_cmd(1)).unwrap();
        let err = tx.enqueue(send_cmd(2)).unwrap_err();
        assert!(matches!(err, SendError::Backpressure));

        // draining frees capacity for subsequent enqueues
        let _ = rx.recv().await.unwrap();
        tx.enqueue(send_cmd(3)).unwrap();
    }
}
