use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{paths, ChangeEvent, ControlPlane, StoreResult, Subscription};

/// Redis-backed control plane. Every leaf lives at its own key
/// (`{prefix}/identity/exe/command`), subtrees are assembled with `SCAN`, and
/// each write is announced on `{prefix}events` for subscribers.
#[derive(Clone)]
pub struct RedisControlPlane {
    client: Client,
    redis: ConnectionManager,
    prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireChange {
    path: String,
    data: Value,
}

impl RedisControlPlane {
    pub async fn new(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            redis,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, segments: &[String]) -> String {
        if segments.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, paths::join(segments))
        }
    }

    fn events_channel(&self) -> String {
        format!("{}events", self.prefix)
    }

    fn subtree_pattern(&self, segments: &[String]) -> String {
        format!("{}/*", escape_glob(&self.key(segments)))
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    fn relative_segments(&self, key: &str) -> Vec<String> {
        paths::segments(key.strip_prefix(&self.prefix).unwrap_or(key))
    }
}

#[async_trait]
impl ControlPlane for RedisControlPlane {
    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let segments = paths::segments(path);
        let value = paths::prune(value);

        // Ancestors stored as leaves and the old subtree are both replaced.
        let mut stale: Vec<String> = (0..=segments.len())
            .map(|depth| self.key(&segments[..depth]))
            .collect();
        stale.extend(self.scan_keys(&self.subtree_pattern(&segments)).await?);

        let mut leaves = Vec::new();
        flatten(&segments, &value, &mut leaves);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&stale).ignore();
        for (leaf_segments, leaf) in &leaves {
            pipe.set(self.key(leaf_segments), serde_json::to_string(leaf)?)
                .ignore();
        }
        let change = serde_json::to_string(&WireChange {
            path: paths::join(&segments),
            data: value,
        })?;
        pipe.publish(self.events_channel(), change).ignore();

        let mut conn = self.redis.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Value> {
        let segments = paths::segments(path);
        let mut conn = self.redis.clone();

        if !segments.is_empty() {
            let leaf: Option<String> = conn.get(self.key(&segments)).await?;
            if let Some(json) = leaf {
                return Ok(serde_json::from_str(&json)?);
            }
        }

        let keys = self.scan_keys(&self.subtree_pattern(&segments)).await?;
        if keys.is_empty() {
            return Ok(Value::Null);
        }
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut tree = Value::Object(Map::new());
        for (key, json) in keys.iter().zip(values) {
            let Some(json) = json else { continue };
            let leaf: Value = match serde_json::from_str(&json) {
                Ok(leaf) => leaf,
                Err(err) => {
                    warn!(%key, error = %err, "skipping undecodable control-plane leaf");
                    continue;
                }
            };
            let relative = self.relative_segments(key);
            insert_leaf(&mut tree, &relative[segments.len()..], leaf);
        }
        Ok(paths::prune(tree))
    }

    async fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        let segments = paths::segments(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.events_channel()).await?;

        // Subscribed before reading so no write between the two is missed.
        let initial = self.get(path).await?;
        let _ = tx.send(ChangeEvent {
            path: "/".to_string(),
            data: initial,
        });

        let watch = segments.clone();
        let cancel = token.clone();
        tokio::spawn(async move {
            let messages = pubsub.on_message();
            tokio::pin!(messages);
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = messages.next() => message,
                };
                let Some(message) = message else {
                    debug!(path = %paths::join(&watch), "control-plane pubsub stream ended");
                    break;
                };
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "unreadable control-plane change payload");
                        continue;
                    }
                };
                let change: WireChange = match serde_json::from_str(&payload) {
                    Ok(change) => change,
                    Err(err) => {
                        warn!(error = %err, "undecodable control-plane change payload");
                        continue;
                    }
                };
                let written = paths::segments(&change.path);
                if let Some(event) = paths::route(&watch, &written, &change.data) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(paths::join(&segments), rx, token))
    }
}

fn flatten(prefix: &[String], value: &Value, out: &mut Vec<(Vec<String>, Value)>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (name, child) in map {
                let mut segments = prefix.to_vec();
                segments.push(name.clone());
                flatten(&segments, child, out);
            }
        }
        leaf => out.push((prefix.to_vec(), leaf.clone())),
    }
}

fn insert_leaf(tree: &mut Value, segments: &[String], leaf: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *tree = leaf;
        return;
    };
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    if let Value::Object(map) = tree {
        let child = map.entry(head.clone()).or_insert(Value::Null);
        insert_leaf(child, rest, leaf);
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
