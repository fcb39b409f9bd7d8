//! Command and output directions of the relay.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control_plane::{display_value, paths, ChangeEvent, Subscription};
use crate::engine::{timestamp, RelayEngine};
use crate::error::{RelayError, RelayResult};

/// Command path relative to an identity record, as peers see it.
pub const COMMAND_PATH: &str = "/exe/command";

/// Frame delivered to a peer for one command write.
pub fn format_command_frame(at: DateTime<Utc>, path: &str, data: &Value) -> String {
    format!(
        "[{}] Firebase Change - Path: {}, Data: {}",
        timestamp(at),
        path,
        display_value(data)
    )
}

/// Forwards every non-null write on the session's command path to its
/// transport until the subscription is cancelled.
pub(crate) fn spawn_command_forwarder(
    engine: Arc<RelayEngine>,
    identity: String,
    mut subscription: Subscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            if event.data.is_null() {
                continue;
            }
            if let Err(err) = engine.deliver_command(&identity, &event) {
                counter!("jetty_delivery_failures_total", 1);
                warn!(%identity, error = %err, "command delivery failed");
            }
        }
        debug!(%identity, "command forwarder stopped");
    })
}

impl RelayEngine {
    /// Sends one command event to the transport bound to `identity`.
    pub fn deliver_command(&self, identity: &str, event: &ChangeEvent) -> RelayResult<()> {
        let transport = {
            let state = self.state.lock();
            state
                .sessions
                .get(identity)
                .and_then(|session| session.transport.clone())
        };
        let Some(transport) = transport else {
            return Err(RelayError::DeliveryFailure(format!(
                "no transport bound to {}",
                identity
            )));
        };

        let path = paths::child(COMMAND_PATH, &event.path);
        let frame = format_command_frame(self.clock.now(), &path, &event.data);
        info!(%identity, %path, data = %display_value(&event.data), "relaying command");
        transport.send_line(&frame)?;
        counter!("jetty_commands_delivered_total", 1);
        Ok(())
    }

    /// Publishes peer output verbatim to `/{identity}/exe/output`. Without an
    /// identity the first session registered under `label` is used. Returns
    /// the identity the output was attributed to.
    pub async fn report_output(
        &self,
        identity: Option<&str>,
        label: &str,
        output: &str,
    ) -> Option<String> {
        let now = self.clock.now();
        let identity = {
            let mut state = self.state.lock();
            let identity = match identity.filter(|identity| !identity.is_empty()) {
                Some(identity) => Some(identity.to_string()),
                None => state
                    .sessions
                    .find_by_label(label)
                    .map(|session| session.identity.clone()),
            };
            if let Some(session) = identity
                .as_deref()
                .and_then(|identity| state.sessions.get_mut(identity))
            {
                session.last_seen = now;
            }
            identity
        };

        let Some(identity) = identity else {
            warn!(%label, "output received without a resolvable identity; dropping");
            return None;
        };

        debug!(%identity, bytes = output.len(), "publishing peer output");
        if let Err(err) = self
            .control
            .set(&paths::output(&identity), Value::String(output.to_string()))
            .await
        {
            warn!(%identity, error = %err, "failed to publish output");
            return Some(identity);
        }
        if let Err(err) = self
            .control
            .set(&paths::last_seen(&identity), json!(timestamp(now)))
            .await
        {
            warn!(%identity, error = %err, "failed to refresh last_seen");
        }
        counter!("jetty_outputs_published_total", 1);
        Some(identity)
    }
}
