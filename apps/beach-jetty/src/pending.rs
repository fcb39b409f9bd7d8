use std::collections::VecDeque;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::lifecycle::DisconnectReason;
use crate::transport::TransportHandle;

/// Delivered to a connection worker when the rendezvous matches its connection.
#[derive(Debug)]
pub struct Promotion {
    pub identity: String,
    /// Fires when the session must end for a reason the worker cannot see on
    /// its own socket (record removed, superseded, shutdown).
    pub evicted: oneshot::Receiver<DisconnectReason>,
}

/// A transport accepted but not yet matched to an identity.
#[derive(Debug)]
pub struct PendingConnection {
    transport: TransportHandle,
    arrived_at: DateTime<Utc>,
    temp_label: String,
    promote: oneshot::Sender<Promotion>,
}

/// Worker side of a pending entry.
#[derive(Debug)]
pub struct PendingTicket {
    connection: Uuid,
    rx: oneshot::Receiver<Promotion>,
}

impl PendingConnection {
    pub fn new(
        transport: TransportHandle,
        arrived_at: DateTime<Utc>,
        temp_label: String,
    ) -> (Self, PendingTicket) {
        let (promote, rx) = oneshot::channel();
        let ticket = PendingTicket {
            connection: transport.id(),
            rx,
        };
        (
            Self {
                transport,
                arrived_at,
                temp_label,
                promote,
            },
            ticket,
        )
    }

    pub fn connection(&self) -> Uuid {
        self.transport.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.transport.peer()
    }

    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.arrived_at
    }

    pub fn temp_label(&self) -> &str {
        &self.temp_label
    }

    /// Hands the promotion to the waiting worker and yields the transport.
    /// Fails with the peer address when the worker is already gone.
    pub fn promote(self, promotion: Promotion) -> Result<TransportHandle, SocketAddr> {
        let peer = self.transport.peer();
        match self.promote.send(promotion) {
            Ok(()) => Ok(self.transport),
            Err(_) => Err(peer),
        }
    }
}

impl PendingTicket {
    pub fn connection(&self) -> Uuid {
        self.connection
    }

    /// Resolves once matched; `None` if the entry was dropped unmatched.
    pub async fn promoted(&mut self) -> Option<Promotion> {
        (&mut self.rx).await.ok()
    }

    /// Refuses any further promotion and returns one that already landed.
    pub(crate) fn abandon(&mut self) -> Option<Promotion> {
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

/// FIFO of unmatched connections: first arrived, first matched.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    queue: VecDeque<PendingConnection>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pending: PendingConnection) {
        self.queue.push_back(pending);
    }

    pub fn pop_oldest(&mut self) -> Option<PendingConnection> {
        self.queue.pop_front()
    }

    /// Drops the entry for `connection`, if it is still waiting.
    pub fn release(&mut self, connection: Uuid) -> Option<PendingConnection> {
        let index = self
            .queue
            .iter()
            .position(|pending| pending.connection() == connection)?;
        self.queue.remove(index)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingConnection> + '_ {
        self.queue.drain(..)
    }
}
