use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::control_plane::SubscriptionHandle;
use crate::lifecycle::DisconnectReason;
use crate::transport::TransportHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

/// The two control-plane watches a registered session owns.
#[derive(Debug, Clone)]
pub struct SessionWatches {
    pub command: SubscriptionHandle,
    pub presence: SubscriptionHandle,
}

impl SessionWatches {
    pub fn cancel(&self) {
        self.command.cancel();
        self.presence.cancel();
    }
}

/// Subscriptions are opened outside the table lock, so a session passes
/// through `Establishing` between registration and attachment.
#[derive(Debug, Clone, Default)]
pub enum SubscriptionSlot {
    #[default]
    Vacant,
    Establishing,
    Active(SessionWatches),
}

#[derive(Debug)]
pub struct ClientSession {
    pub identity: String,
    pub label: String,
    pub transport: Option<TransportHandle>,
    pub address: SocketAddr,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub subscription: SubscriptionSlot,
    pub(crate) evict: Option<oneshot::Sender<DisconnectReason>>,
}

impl ClientSession {
    pub fn new(
        identity: String,
        label: String,
        transport: TransportHandle,
        now: DateTime<Utc>,
        evict: oneshot::Sender<DisconnectReason>,
    ) -> Self {
        Self {
            identity,
            label,
            address: transport.peer(),
            transport: Some(transport),
            registered_at: now,
            last_seen: now,
            subscription: SubscriptionSlot::Establishing,
            evict: Some(evict),
        }
    }

    pub fn connection(&self) -> Option<Uuid> {
        self.transport.as_ref().map(TransportHandle::id)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.identity.clone(),
            label: self.label.clone(),
            address: self.address.to_string(),
            last_seen: self.last_seen,
            connected: self
                .transport
                .as_ref()
                .map(|transport| !transport.is_closed())
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub label: String,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub connected: bool,
}

/// Registered identities; at most one session per identity.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, ClientSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> Option<&ClientSession> {
        self.sessions.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut ClientSession> {
        self.sessions.get_mut(identity)
    }

    pub fn insert(&mut self, session: ClientSession) {
        self.sessions.insert(session.identity.clone(), session);
    }

    /// Removes the session only while it is still bound to `connection`.
    pub fn remove_if_bound(&mut self, identity: &str, connection: Uuid) -> Option<ClientSession> {
        let bound = self
            .sessions
            .get(identity)
            .and_then(ClientSession::connection)
            .map(|current| current == connection)
            .unwrap_or(false);
        if bound {
            self.sessions.remove(identity)
        } else {
            None
        }
    }

    /// Label lookup for callers that omit their identity. Labels are not
    /// unique; the earliest registration wins.
    pub fn find_by_label(&self, label: &str) -> Option<&ClientSession> {
        self.sessions
            .values()
            .filter(|session| session.label == label)
            .min_by_key(|session| session.registered_at)
    }

    pub fn identity_for_connection(&self, connection: Uuid) -> Option<&str> {
        self.sessions
            .values()
            .find(|session| session.connection() == Some(connection))
            .map(|session| session.identity.as_str())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.sessions.values().map(ClientSession::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ClientSession> + '_ {
        self.sessions.drain().map(|(_, session)| session)
    }
}
