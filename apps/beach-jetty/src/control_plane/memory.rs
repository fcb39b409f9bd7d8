use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{paths, ChangeEvent, ControlPlane, StoreResult, Subscription};

/// In-process JSON tree with change fan-out. Watchers are notified while the
/// tree lock is held, so every watcher sees writes in commit order.
#[derive(Default)]
pub struct MemoryControlPlane {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    root: Value,
    watchers: Vec<Watcher>,
}

struct Watcher {
    segments: Vec<String>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
    token: CancellationToken,
}

impl MemoryControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of watchers that have not been cancelled yet.
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner
            .watchers
            .retain(|watcher| !watcher.token.is_cancelled() && !watcher.tx.is_closed());
        inner.watchers.len()
    }

    pub fn watcher_count_at(&self, path: &str) -> usize {
        let wanted = paths::segments(path);
        let mut inner = self.inner.lock();
        inner
            .watchers
            .retain(|watcher| !watcher.token.is_cancelled() && !watcher.tx.is_closed());
        inner
            .watchers
            .iter()
            .filter(|watcher| watcher.segments == wanted)
            .count()
    }
}

impl MemoryInner {
    fn write(&mut self, segments: &[String], value: Value) {
        let value = paths::prune(value);
        write_node(&mut self.root, segments, value.clone());
        if paths::is_vacant(&self.root) {
            self.root = Value::Null;
        }

        self.watchers
            .retain(|watcher| !watcher.token.is_cancelled() && !watcher.tx.is_closed());
        for watcher in &self.watchers {
            if let Some(event) = paths::route(&watcher.segments, segments, &value) {
                let _ = watcher.tx.send(event);
            }
        }
    }
}

fn write_node(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };

    if rest.is_empty() {
        if value.is_null() {
            map.remove(head);
        } else {
            map.insert(head.clone(), value);
        }
        return;
    }

    let child = map.entry(head.clone()).or_insert(Value::Null);
    write_node(child, rest, value);
    if map.get(head).map(paths::is_vacant).unwrap_or(false) {
        map.remove(head);
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let segments = paths::segments(path);
        self.inner.lock().write(&segments, value);
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Value> {
        let segments = paths::segments(path);
        let inner = self.inner.lock();
        Ok(paths::value_at(&inner.root, &segments))
    }

    async fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        let segments = paths::segments(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let mut inner = self.inner.lock();
        let _ = tx.send(ChangeEvent {
            path: "/".to_string(),
            data: paths::value_at(&inner.root, &segments),
        });
        inner.watchers.push(Watcher {
            segments: segments.clone(),
            tx,
            token: token.clone(),
        });

        Ok(Subscription::new(paths::join(&segments), rx, token))
    }
}
