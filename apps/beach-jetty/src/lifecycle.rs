//! Session teardown. Every step is best-effort: a failed step is logged and
//! the remaining ones still run.

use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control_plane::{paths, Subscription};
use crate::engine::RelayEngine;
use crate::session::{ClientSession, SessionStatus, SubscriptionSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer's stream reached EOF or failed.
    TransportClosed,
    /// The control-plane record was deleted (reaper or operator).
    RecordRemoved,
    /// A newer registration took over the identity.
    Superseded,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::TransportClosed => "transport_closed",
            DisconnectReason::RecordRemoved => "record_removed",
            DisconnectReason::Superseded => "superseded",
            DisconnectReason::Shutdown => "shutdown",
        }
    }

    /// A deleted record must not be recreated by the status write.
    fn publishes_status(&self) -> bool {
        !matches!(self, DisconnectReason::RecordRemoved)
    }
}

/// Watches `/{identity}/status`; the value turning null means the record is
/// gone and the session has to end.
pub(crate) fn spawn_presence_watch(
    engine: Arc<RelayEngine>,
    identity: String,
    mut subscription: Subscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Initial value predates the registration publish.
        let _ = subscription.next().await;

        while let Some(event) = subscription.next().await {
            if !event.data.is_null() {
                continue;
            }
            info!(%identity, "control-plane record removed");
            if !engine.evict(&identity, DisconnectReason::RecordRemoved) {
                if let Some(connection) = engine.connection_for(&identity) {
                    engine
                        .disconnect(connection, Some(&identity), DisconnectReason::RecordRemoved)
                        .await;
                }
            }
            break;
        }
        debug!(%identity, "presence watch stopped");
    })
}

impl RelayEngine {
    /// Signals the worker owning `identity` to end its session. Returns false
    /// when no worker is listening.
    pub fn evict(&self, identity: &str, reason: DisconnectReason) -> bool {
        let sender = {
            let mut state = self.state.lock();
            state
                .sessions
                .get_mut(identity)
                .and_then(|session| session.evict.take())
        };
        match sender {
            Some(sender) => sender.send(reason).is_ok(),
            None => false,
        }
    }

    pub(crate) fn connection_for(&self, identity: &str) -> Option<Uuid> {
        self.state
            .lock()
            .sessions
            .get(identity)
            .and_then(ClientSession::connection)
    }

    /// Tears down whatever `connection` still owns: its pending entry, and the
    /// session for `identity` if that session is still bound to it.
    pub async fn disconnect(
        &self,
        connection: Uuid,
        identity: Option<&str>,
        reason: DisconnectReason,
    ) {
        let removed = {
            let mut state = self.state.lock();
            if state.pending.release(connection).is_some() {
                debug!(%connection, "released pending connection");
            }
            let removed =
                identity.and_then(|identity| state.sessions.remove_if_bound(identity, connection));
            state.record_gauges();
            removed
        };

        let Some(session) = removed else {
            if let Some(identity) = identity {
                debug!(
                    %identity,
                    %connection,
                    reason = reason.as_str(),
                    "connection no longer owns its session"
                );
            }
            return;
        };
        self.finish_session(session, reason).await;
    }

    async fn finish_session(&self, mut session: ClientSession, reason: DisconnectReason) {
        let identity = session.identity.clone();

        match &session.subscription {
            SubscriptionSlot::Active(watches) => {
                self.control.unsubscribe(&watches.command);
                self.control.unsubscribe(&watches.presence);
            }
            SubscriptionSlot::Establishing | SubscriptionSlot::Vacant => {}
        }
        session.subscription = SubscriptionSlot::Vacant;

        if reason.publishes_status() {
            if let Err(err) = self
                .control
                .set(&paths::status(&identity), json!(SessionStatus::Disconnected.as_str()))
                .await
            {
                warn!(%identity, error = %err, "failed to publish disconnected status");
            }
        }

        if let Some(transport) = session.transport.take() {
            transport.close();
        }

        counter!("jetty_disconnects_total", 1, "reason" => reason.as_str());
        info!(%identity, label = %session.label, reason = reason.as_str(), "client disconnected");
    }

    /// Ends every session and drops every pending connection.
    pub async fn shutdown(&self) {
        let (sessions, pending) = {
            let mut state = self.state.lock();
            let sessions: Vec<ClientSession> = state.sessions.drain().collect();
            let pending: Vec<_> = state.pending.drain().collect();
            state.record_gauges();
            (sessions, pending)
        };

        drop(pending);
        for mut session in sessions {
            if let Some(sender) = session.evict.take() {
                let _ = sender.send(DisconnectReason::Shutdown);
            }
            self.finish_session(session, DisconnectReason::Shutdown).await;
        }
    }
}
