//! Probe-based removal of control-plane records whose peer stopped answering.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control_plane::{paths, SharedControlPlane};

pub const FIRST_PROBE: &str = "whoami";
pub const SECOND_PROBE: &str = "pwd";
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

/// One identity record as stored at the control-plane root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRecord {
    pub id: String,
    pub label: String,
    pub status: String,
    pub last_seen: String,
    pub address: String,
}

impl ClientRecord {
    fn from_value(id: &str, value: &Value) -> Option<Self> {
        let record = value.as_object()?;
        let field = |key: &str, fallback: &str| {
            record
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(fallback)
                .to_string()
        };
        Some(Self {
            id: id.to_string(),
            label: field(paths::LABEL, "Unknown"),
            status: field(paths::STATUS, "Unknown"),
            last_seen: field(paths::LAST_SEEN, "Never"),
            address: field(paths::ADDRESS, "Unknown"),
        })
    }
}

/// Every object-valued child of the root is a client record.
pub async fn list_clients(control: &SharedControlPlane) -> Vec<ClientRecord> {
    match control.get("/").await {
        Ok(Value::Object(root)) => root
            .iter()
            .filter_map(|(id, value)| ClientRecord::from_value(id, value))
            .collect(),
        Ok(_) => Vec::new(),
        Err(err) => {
            warn!(error = %err, "failed to list client records");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub probed: Vec<String>,
    pub removed: Vec<ClientRecord>,
}

impl ReapReport {
    pub fn retained(&self) -> usize {
        self.probed.len() - self.removed.len()
    }
}

pub struct Reaper {
    control: SharedControlPlane,
    settle: Duration,
    guard: Arc<Mutex<()>>,
}

impl Reaper {
    /// `guard` must be the one registrations take when running in-process.
    pub fn new(control: SharedControlPlane, settle: Duration, guard: Arc<Mutex<()>>) -> Self {
        Self {
            control,
            settle,
            guard,
        }
    }

    /// Reaper with a private guard, for processes that never register peers.
    pub fn standalone(control: SharedControlPlane, settle: Duration) -> Self {
        Self::new(control, settle, Arc::new(Mutex::new(())))
    }

    /// Probes every known identity twice and deletes the records whose output
    /// did not change between the probes. Absent output on both reads counts
    /// as unchanged.
    pub async fn run_pass(&self) -> ReapReport {
        let _guard = self.guard.lock().await;

        let clients = list_clients(&self.control).await;
        if clients.is_empty() {
            debug!("no client records to probe");
            return ReapReport::default();
        }
        info!(clients = clients.len(), "probing client records for liveness");

        self.broadcast(&clients, FIRST_PROBE).await;
        tokio::time::sleep(self.settle).await;
        let first = self.read_outputs(&clients).await;

        self.broadcast(&clients, SECOND_PROBE).await;
        tokio::time::sleep(self.settle).await;
        let second = self.read_outputs(&clients).await;

        let mut report = ReapReport {
            probed: clients.iter().map(|client| client.id.clone()).collect(),
            removed: Vec::new(),
        };
        for client in clients {
            if first.get(&client.id) != second.get(&client.id) {
                continue;
            }
            match self.control.delete(&paths::record(&client.id)).await {
                Ok(()) => {
                    counter!("jetty_reaped_identities_total", 1);
                    info!(
                        identity = %client.id,
                        label = %client.label,
                        "removed unresponsive client record"
                    );
                    report.removed.push(client);
                }
                Err(err) => {
                    warn!(identity = %client.id, error = %err, "failed to remove client record");
                }
            }
        }

        info!(
            probed = report.probed.len(),
            removed = report.removed.len(),
            "liveness pass complete"
        );
        report
    }

    async fn broadcast(&self, clients: &[ClientRecord], command: &str) {
        debug!(%command, "broadcasting liveness probe");
        for client in clients {
            if let Err(err) = self
                .control
                .set(&paths::command(&client.id), json!(command))
                .await
            {
                warn!(identity = %client.id, error = %err, "failed to send liveness probe");
            }
        }
    }

    /// An unreadable output counts as null.
    async fn read_outputs(&self, clients: &[ClientRecord]) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        for client in clients {
            let value = match self.control.get(&paths::output(&client.id)).await {
                Ok(value) => value,
                Err(err) => {
                    debug!(identity = %client.id, error = %err, "failed to read probe output");
                    Value::Null
                }
            };
            outputs.insert(client.id.clone(), value);
        }
        outputs
    }

    /// Runs a pass every `interval` until `shutdown` fires. The first pass
    /// happens one interval after start.
    pub fn spawn_periodic(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_pass().await;
                    }
                }
            }
            debug!("periodic reaper stopped");
        })
    }
}
