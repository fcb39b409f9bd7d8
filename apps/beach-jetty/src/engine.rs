use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control_plane::{paths, SharedControlPlane};
use crate::error::{RelayError, RelayResult};
use crate::identity::{assign_identity, temporary_label};
use crate::lifecycle::{self, DisconnectReason};
use crate::pending::{PendingConnection, PendingRegistry, PendingTicket, Promotion};
use crate::relay;
use crate::session::{
    ClientSession, SessionStatus, SessionSummary, SessionTable, SessionWatches, SubscriptionSlot,
};
use crate::transport::TransportHandle;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Timestamp format written to `last_seen` and into command frames.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Body of the out-of-band registration call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default = "default_label", alias = "client_name")]
    pub label: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, alias = "client_id")]
    pub identity: Option<String>,
}

fn default_label() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered { identity: String },
    /// Output-only call; `identity` is where the output was published, if anywhere.
    OutputAccepted { identity: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub pending_connections: usize,
    pub sessions: Vec<SessionSummary>,
}

pub(crate) struct RelayState {
    pub(crate) pending: PendingRegistry,
    pub(crate) sessions: SessionTable,
}

impl RelayState {
    pub(crate) fn record_gauges(&self) {
        gauge!("jetty_pending_connections", self.pending.len() as f64);
        gauge!("jetty_registered_sessions", self.sessions.len() as f64);
    }
}

/// Owns the pending registry and the session table behind one lock, and
/// drives rendezvous, relay, and lifecycle against a control plane.
pub struct RelayEngine {
    pub(crate) state: Mutex<RelayState>,
    pub(crate) control: SharedControlPlane,
    pub(crate) clock: Arc<dyn Clock>,
    reap_guard: Arc<tokio::sync::Mutex<()>>,
}

impl RelayEngine {
    pub fn new(control: SharedControlPlane) -> Arc<Self> {
        Self::with_clock(control, Arc::new(SystemClock))
    }

    pub fn with_clock(control: SharedControlPlane, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RelayState {
                pending: PendingRegistry::new(),
                sessions: SessionTable::new(),
            }),
            control,
            clock,
            reap_guard: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn control(&self) -> &SharedControlPlane {
        &self.control
    }

    /// Held by the liveness reaper for a whole pass and by every registration.
    pub fn reap_guard(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.reap_guard)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Parks a freshly accepted connection until a registration claims it.
    pub fn enqueue(&self, transport: TransportHandle) -> PendingTicket {
        let peer = transport.peer();
        let label = temporary_label();
        let (pending, ticket) = PendingConnection::new(transport, self.clock.now(), label.clone());

        let mut state = self.state.lock();
        state.pending.push(pending);
        state.record_gauges();
        debug!(
            %peer,
            temp_label = %label,
            pending = state.pending.len(),
            "connection awaiting registration"
        );
        ticket
    }

    /// Withdraws a pending connection whose transport closed. Returns the
    /// promotion if a registration matched it first.
    pub fn abandon_pending(&self, ticket: &mut PendingTicket) -> Option<Promotion> {
        let mut state = self.state.lock();
        state.pending.release(ticket.connection());
        state.record_gauges();
        ticket.abandon()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn has_session(&self, identity: &str) -> bool {
        self.state.lock().sessions.contains(identity)
    }

    pub fn session(&self, identity: &str) -> Option<SessionSummary> {
        self.state.lock().sessions.get(identity).map(ClientSession::summary)
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        let state = self.state.lock();
        RelaySnapshot {
            pending_connections: state.pending.len(),
            sessions: state.sessions.summaries(),
        }
    }

    pub async fn handle_registration(
        self: &Arc<Self>,
        request: RegistrationRequest,
    ) -> RelayResult<RegistrationOutcome> {
        if request.status == SessionStatus::Connected.as_str() {
            let identity = self.register(&request.label).await?;
            return Ok(RegistrationOutcome::Registered { identity });
        }

        match request.output.as_deref().filter(|output| !output.is_empty()) {
            Some(output) => {
                let identity = self
                    .report_output(request.identity.as_deref(), &request.label, output)
                    .await;
                Ok(RegistrationOutcome::OutputAccepted { identity })
            }
            None => Ok(RegistrationOutcome::OutputAccepted {
                identity: request.identity,
            }),
        }
    }

    /// Matches the oldest pending connection to `label` and publishes the
    /// resulting identity. Re-registering a known identity rebinds its
    /// transport and keeps the existing subscriptions.
    pub async fn register(self: &Arc<Self>, label: &str) -> RelayResult<String> {
        let reap_guard = self.reap_guard();
        let _reap = reap_guard.lock().await;
        let now = self.clock.now();

        let (identity, address, needs_watches) = {
            let mut state = self.state.lock();

            let matched = loop {
                let Some(pending) = state.pending.pop_oldest() else {
                    break None;
                };
                let identity = assign_identity(label, pending.peer(), now);
                let temp_label = pending.temp_label().to_string();
                let waited_ms = (now - pending.arrived_at()).num_milliseconds();
                let (evict_tx, evict_rx) = oneshot::channel();
                let promotion = Promotion {
                    identity: identity.clone(),
                    evicted: evict_rx,
                };
                match pending.promote(promotion) {
                    Ok(transport) => {
                        debug!(%identity, %temp_label, waited_ms, "pending connection matched");
                        break Some((identity, transport, evict_tx));
                    }
                    Err(peer) => {
                        debug!(%peer, "skipping pending connection whose worker has exited");
                    }
                }
            };

            let Some((identity, transport, evict_tx)) = matched else {
                state.record_gauges();
                counter!("jetty_registration_failures_total", 1);
                warn!(%label, "registration without a pending connection");
                return Err(RelayError::NoPendingConnection);
            };
            let address = transport.peer();

            let needs_watches = match state.sessions.get_mut(&identity) {
                Some(existing) => {
                    warn!(
                        %identity,
                        %label,
                        previous = %existing.address,
                        "identity already registered; rebinding to the new connection"
                    );
                    if let Some(previous) = existing.evict.take() {
                        let _ = previous.send(DisconnectReason::Superseded);
                    }
                    existing.label = label.to_string();
                    existing.address = address;
                    existing.transport = Some(transport);
                    existing.last_seen = now;
                    existing.evict = Some(evict_tx);
                    if matches!(existing.subscription, SubscriptionSlot::Vacant) {
                        existing.subscription = SubscriptionSlot::Establishing;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    state.sessions.insert(ClientSession::new(
                        identity.clone(),
                        label.to_string(),
                        transport,
                        now,
                        evict_tx,
                    ));
                    true
                }
            };
            state.record_gauges();
            (identity, address, needs_watches)
        };

        if needs_watches {
            self.establish_watches(&identity).await;
        }

        let mut record = Map::new();
        record.insert(paths::LABEL.into(), json!(label));
        record.insert(paths::STATUS.into(), json!(SessionStatus::Connected.as_str()));
        record.insert(paths::LAST_SEEN.into(), json!(timestamp(now)));
        record.insert(paths::ADDRESS.into(), json!(address.to_string()));
        if let Err(err) = self.control.update(&paths::record(&identity), record).await {
            warn!(%identity, error = %err, "failed to publish registration to control plane");
        }

        counter!("jetty_registrations_total", 1);
        info!(%identity, %label, peer = %address, "client registered");
        Ok(identity)
    }

    /// Opens the command and presence subscriptions for `identity` and
    /// attaches them to its session, unless the session vanished meanwhile.
    async fn establish_watches(self: &Arc<Self>, identity: &str) {
        let command = match self.control.subscribe(&paths::command(identity)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(%identity, error = %err, "failed to subscribe to command path");
                self.reset_watch_slot(identity);
                return;
            }
        };
        let presence = match self.control.subscribe(&paths::status(identity)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(%identity, error = %err, "failed to subscribe to status path");
                self.reset_watch_slot(identity);
                return;
            }
        };

        let watches = SessionWatches {
            command: command.handle(),
            presence: presence.handle(),
        };
        let attached = {
            let mut state = self.state.lock();
            match state.sessions.get_mut(identity) {
                Some(session) if matches!(session.subscription, SubscriptionSlot::Establishing) => {
                    session.subscription = SubscriptionSlot::Active(watches.clone());
                    true
                }
                _ => false,
            }
        };
        if !attached {
            debug!(%identity, "session ended before its subscriptions were attached");
            watches.cancel();
            return;
        }

        debug!(%identity, path = %command.root(), "command subscription established");
        relay::spawn_command_forwarder(Arc::clone(self), identity.to_string(), command);
        lifecycle::spawn_presence_watch(Arc::clone(self), identity.to_string(), presence);
    }

    fn reset_watch_slot(&self, identity: &str) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(identity) {
            if matches!(session.subscription, SubscriptionSlot::Establishing) {
                session.subscription = SubscriptionSlot::Vacant;
            }
        }
    }

    pub(crate) fn identity_for_connection(&self, connection: Uuid) -> Option<String> {
        self.state
            .lock()
            .sessions
            .identity_for_connection(connection)
            .map(str::to_string)
    }
}
