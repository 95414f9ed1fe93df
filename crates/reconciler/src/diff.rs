//! Structural JSON diff.
//!
//! A plain two-pass comparison that returns what changed; callers decide
//! whether to write based on the list being non-empty. Paths are
//! slash-separated key chains.

use serde_json::Value;

/// One changed leaf between two JSON documents.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Slash-separated path to the changed leaf.
    pub path: String,
    /// Previous value. `None` when the leaf was added.
    pub from: Option<Value>,
    /// New value. `None` when the leaf was removed.
    pub to: Option<Value>,
}

/// Compare two JSON documents structurally, descending into objects.
/// Arrays and scalars compare as whole values.
pub fn diff(from: &Value, to: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    walk("", from, to, &mut changes);
    changes
}

fn walk(path: &str, from: &Value, to: &Value, changes: &mut Vec<Change>) {
    match (from, to) {
        (Value::Object(from_map), Value::Object(to_map)) => {
            for (key, from_value) in from_map {
                let child = join(path, key);
                match to_map.get(key) {
                    Some(to_value) => walk(&child, from_value, to_value, changes),
                    None => changes.push(Change {
                        path: child,
                        from: Some(from_value.clone()),
                        to: None,
                    }),
                }
            }
            for (key, to_value) in to_map {
                if !from_map.contains_key(key) {
                    changes.push(Change {
                        path: join(path, key),
                        from: None,
                        to: Some(to_value.clone()),
                    });
                }
            }
        }
        _ if from == to => {}
        _ => changes.push(Change {
            path: path.to_string(),
            from: Some(from.clone()),
            to: Some(to.clone()),
        }),
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}/{key}")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn identical_documents_diff_empty() {
        let doc = json!({"users": {"@a:x": 50}, "ban": 50});
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn nested_change_reports_full_path() {
        let from = json!({"users": {"@a:x": 50}});
        let to = json!({"users": {"@a:x": 99}});
        let changes = diff(&from, &to);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "users/@a:x");
        assert_eq!(changes[0].from, Some(json!(50)));
        assert_eq!(changes[0].to, Some(json!(99)));
    }

    #[test]
    fn additions_and_removals_are_reported() {
        let from = json!({"kick": 50, "users": {"@old:x": 50}});
        let to = json!({"kick": 50, "users": {"@new:x": 50}});
        let mut changes = diff(&from, &to);
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "users/@new:x");
        assert_eq!(changes[0].from, None);
        assert_eq!(changes[1].path, "users/@old:x");
        assert_eq!(changes[1].to, None);
    }

    #[test]
    fn type_change_is_a_single_leaf() {
        let changes = diff(&json!({"events": {}}), &json!({"events": 5}));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "events");
    }
}
