use std::net::SocketAddr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::RelayError;

/// Outbound lines buffered per peer before deliveries start failing.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Cloneable write side of one peer stream. Lines are queued to a dedicated
/// writer task; closing the handle stops that task and drops the socket half.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    id: Uuid,
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl TransportHandle {
    pub fn new(peer: SocketAddr) -> (Self, mpsc::Receiver<String>) {
        Self::with_queue_depth(peer, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(peer: SocketAddr, depth: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth);
        let handle = Self {
            id: Uuid::new_v4(),
            peer,
            tx,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues one newline-terminated message. A peer that stops reading
    /// fills its queue, after which lines are refused rather than buffered.
    pub fn send_line(&self, line: &str) -> Result<(), RelayError> {
        if self.closed.is_cancelled() {
            return Err(RelayError::DeliveryFailure(format!(
                "transport to {} is closed",
                self.peer
            )));
        }
        self.tx.try_send(line.to_string()).map_err(|err| {
            RelayError::DeliveryFailure(match err {
                TrySendError::Full(_) => format!("outbound queue for {} is full", self.peer),
                TrySendError::Closed(_) => format!("writer for {} has exited", self.peer),
            })
        })
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Spawns the task that drains queued lines into `writer`. A failed write
    /// closes the handle; callers learn about it on their next `send_line`.
    pub fn spawn_writer<W>(
        &self,
        mut writer: W,
        mut rx: mpsc::Receiver<String>,
    ) -> JoinHandle<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let closed = self.closed.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    line = rx.recv() => line,
                };
                let Some(line) = line else { break };
                let mut frame = line.into_bytes();
                frame.push(b'\n');
                if let Err(err) = writer.write_all(&frame).await {
                    debug!(%peer, error = %err, "transport write failed");
                    closed.cancel();
                    break;
                }
            }
            let _ = writer.shutdown().await;
            debug!(%peer, "transport writer finished");
        })
    }
}
