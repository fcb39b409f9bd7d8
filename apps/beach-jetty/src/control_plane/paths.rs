//! Path helpers shared by every control-plane backend.

use serde_json::Value;

use super::ChangeEvent;

pub const STATUS: &str = "status";
pub const LAST_SEEN: &str = "last_seen";
pub const ADDRESS: &str = "address";
pub const LABEL: &str = "pc_name";

/// `/{identity}`
pub fn record(identity: &str) -> String {
    format!("/{}", identity)
}

pub fn status(identity: &str) -> String {
    format!("/{}/{}", identity, STATUS)
}

pub fn last_seen(identity: &str) -> String {
    format!("/{}/{}", identity, LAST_SEEN)
}

pub fn address(identity: &str) -> String {
    format!("/{}/{}", identity, ADDRESS)
}

pub fn label(identity: &str) -> String {
    format!("/{}/{}", identity, LABEL)
}

pub fn command(identity: &str) -> String {
    format!("/{}/exe/command", identity)
}

pub fn output(identity: &str) -> String {
    format!("/{}/exe/output", identity)
}

/// Splits a path into its non-empty segments; `/`, `` and `//` are all the root.
pub fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical `/a/b` form of a path.
pub fn normalize(path: &str) -> String {
    join(&segments(path))
}

pub fn join(segments: &[String]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

pub fn child(path: &str, name: &str) -> String {
    let mut parts = segments(path);
    parts.extend(segments(name));
    join(&parts)
}

/// Returns the node at `segments` inside `value`, or `Value::Null`.
pub fn value_at(value: &Value, segments: &[String]) -> Value {
    let mut node = value;
    for segment in segments {
        match node.get(segment) {
            Some(next) => node = next,
            None => return Value::Null,
        }
    }
    node.clone()
}

/// Drops `null` leaves and empty objects; the store never holds either.
pub fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: serde_json::Map<String, Value> = map
                .into_iter()
                .map(|(key, value)| (key, prune(value)))
                .filter(|(_, value)| !is_vacant(value))
                .collect();
            if pruned.is_empty() {
                Value::Null
            } else {
                Value::Object(pruned)
            }
        }
        other => other,
    }
}

pub fn is_vacant(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Decides what a watcher rooted at `watch` observes when `written` is replaced
/// by `value`. Writes below the watch root are reported relative to it; writes
/// at or above the root report the root's new value.
pub fn route(watch: &[String], written: &[String], value: &Value) -> Option<ChangeEvent> {
    if written.starts_with(watch) {
        let relative = &written[watch.len()..];
        return Some(ChangeEvent {
            path: join(relative),
            data: value.clone(),
        });
    }
    if watch.starts_with(written) {
        return Some(ChangeEvent {
            path: "/".to_string(),
            data: value_at(value, &watch[written.len()..]),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(path: &str) -> Vec<String> {
        segments(path)
    }

    #[test_timeout::timeout]
    fn identity_paths_are_rooted_at_the_identity() {
        assert_eq!(record("abc"), "/abc");
        assert_eq!(command("abc"), "/abc/exe/command");
        assert_eq!(output("abc"), "/abc/exe/output");
        assert_eq!(label("abc"), "/abc/pc_name");
        assert_eq!(normalize("//abc//exe/"), "/abc/exe");
        assert_eq!(normalize(""), "/");
    }

    #[test_timeout::timeout]
    fn route_reports_descendant_writes_relative_to_watch_root() {
        let event = route(&segs("/id"), &segs("/id/exe/command"), &json!("whoami")).unwrap();
        assert_eq!(event.path, "/exe/command");
        assert_eq!(event.data, json!("whoami"));

        let exact = route(&segs("/id/exe/command"), &segs("/id/exe/command"), &json!("pwd"));
        assert_eq!(exact.unwrap().path, "/");
    }

    #[test_timeout::timeout]
    fn route_reports_ancestor_deletes_as_null() {
        let event = route(&segs("/id/status"), &segs("/id"), &Value::Null).unwrap();
        assert_eq!(event.path, "/");
        assert_eq!(event.data, Value::Null);

        let replaced = route(
            &segs("/id/status"),
            &segs("/id"),
            &json!({"status": "connected"}),
        )
        .unwrap();
        assert_eq!(replaced.data, json!("connected"));
    }

    #[test_timeout::timeout]
    fn route_ignores_siblings() {
        assert!(route(&segs("/a/exe/command"), &segs("/b/exe/command"), &json!(1)).is_none());
        assert!(route(&segs("/a/exe/command"), &segs("/a/exe/output"), &json!(1)).is_none());
    }

    #[test_timeout::timeout]
    fn prune_strips_nulls_and_empty_objects() {
        let pruned = prune(json!({"a": null, "b": {}, "c": {"d": 1, "e": null}}));
        assert_eq!(pruned, json!({"c": {"d": 1}}));
        assert_eq!(prune(json!({"a": null})), Value::Null);
    }
}
