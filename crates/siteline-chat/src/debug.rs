//! Bounded payload summaries for log output.

use std::collections::HashSet;

use serde_json::{Map, Value};

const MAX_DEPTH: usize = 6;
const MAX_STRING: usize = 200;
const MAX_ITEMS: usize = 20;
const CIRCULAR: &str = "[Circular]";
const TRUNCATED: &str = "[Truncated]";

/// Render an arbitrary payload for logging.
///
/// Containers are tracked by address in a visited set; a container seen
/// twice on the current path is replaced by `[Circular]`. Depth, item counts
/// and string lengths are capped so one large frame cannot flood the log.
pub fn summarize_payload(value: &Value) -> String {
    let mut visited = HashSet::new();
    summarize(value, 0, &mut visited).to_string()
}

fn summarize(value: &Value, depth: usize, visited: &mut HashSet<*const Value>) -> Value {
    match value {
        Value::String(text) => Value::String(truncate(text)),
        Value::Array(items) => guarded(value, depth, visited, |visited| {
            let mut out: Vec<Value> = items
                .iter()
                .take(MAX_ITEMS)
                .map(|item| summarize(item, depth + 1, visited))
                .collect();
            if items.len() > MAX_ITEMS {
                out.push(Value::String(format!("[+{} more]", items.len() - MAX_ITEMS)));
            }
            Value::Array(out)
        }),
        Value::Object(fields) => guarded(value, depth, visited, |visited| {
            let mut out = Map::new();
            for (key, field) in fields.iter().take(MAX_ITEMS) {
                out.insert(key.clone(), summarize(field, depth + 1, visited));
            }
            if fields.len() > MAX_ITEMS {
                out.insert(
                    "…".to_string(),
                    Value::String(format!("[+{} more]", fields.len() - MAX_ITEMS)),
                );
            }
            Value::Object(out)
        }),
        other => other.clone(),
    }
}

/// Track `container` on the current path while `render` descends into it.
fn guarded(
    container: &Value,
    depth: usize,
    visited: &mut HashSet<*const Value>,
    render: impl FnOnce(&mut HashSet<*const Value>) -> Value,
) -> Value {
    let address = container as *const Value;
    if !visited.insert(address) {
        return Value::String(CIRCULAR.to_string());
    }
    let summary = if depth >= MAX_DEPTH {
        Value::String(TRUNCATED.to_string())
    } else {
        render(visited)
    };
    visited.remove(&address);
    summary
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_STRING {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX_STRING).collect();
    format!("{head}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_small_payload_unchanged() {
        let payload = json!({"type": "task_started", "task": {"id": "t1"}});
        let summary: Value = serde_json::from_str(&summarize_payload(&payload)).unwrap();
        assert_eq!(summary, payload);
    }

    #[test]
    fn test_long_strings_truncated() {
        let payload = json!({"result": "x".repeat(1_000)});
        let summary: Value = serde_json::from_str(&summarize_payload(&payload)).unwrap();
        let result = summary["result"].as_str().unwrap();
        assert_eq!(result.chars().count(), MAX_STRING + 1);
        assert!(result.ends_with('…'));
    }

    #[test]
    fn test_deep_nesting_truncated() {
        let mut payload = json!("leaf");
        for _ in 0..10 {
            payload = json!({ "next": payload });
        }
        let summary = summarize_payload(&payload);
        assert!(summary.contains(TRUNCATED));
        assert!(!summary.contains("leaf"));
    }

    #[test]
    fn test_repeated_siblings_are_not_circular() {
        let shared = json!({"zone": "R2"});
        let payload = json!([shared.clone(), shared]);
        let summary = summarize_payload(&payload);
        assert!(!summary.contains(CIRCULAR));
    }

    #[test]
    fn test_long_arrays_capped() {
        let payload = Value::Array((0..50).map(Value::from).collect());
        let summary: Value = serde_json::from_str(&summarize_payload(&payload)).unwrap();
        let items = summary.as_array().unwrap();
        assert_eq!(items.len(), MAX_ITEMS + 1);
        assert_eq!(items[MAX_ITEMS], "[+30 more]");
    }
}
