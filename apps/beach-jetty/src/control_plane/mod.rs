//! The control plane is the path-addressable store operators write commands
//! into and read peer output and metadata from. The relay mirrors its own
//! session table into it; writes are fire-and-forget.

mod memory;
pub mod paths;
mod redis_store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryControlPlane;
pub use redis_store::RedisControlPlane;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("subscription closed for {0}")]
    Closed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One observed write. `path` is relative to the subscription root and is
/// `/` when the root itself changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub path: String,
    pub data: Value,
}

/// A live watch on one path. The first event is the value at subscribe time.
/// Dropping the subscription cancels it.
pub struct Subscription {
    root: String,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        root: String,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root,
            events,
            cancel,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            token: self.cancel.clone(),
        }
    }

    /// Next event, or `None` once the subscription is cancelled or the
    /// backend went away. Cancellation wins over already-buffered events.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Takes an already-delivered event without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.events.try_recv().ok()
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cloneable cancel side of a [`Subscription`], stored on client sessions.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Replaces the value at `path`; `Value::Null` removes it.
    async fn set(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Current value at `path`, `Value::Null` when absent.
    async fn get(&self, path: &str) -> StoreResult<Value>;

    /// Sets each field as a child of `path`, leaving other children untouched.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> StoreResult<()> {
        for (name, value) in fields {
            self.set(&paths::child(path, &name), value).await?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.set(path, Value::Null).await
    }

    async fn subscribe(&self, path: &str) -> StoreResult<Subscription>;

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.cancel();
    }
}

pub type SharedControlPlane = Arc<dyn ControlPlane>;

/// Renders a control-plane value the way peers and operators read it: strings
/// verbatim, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}
