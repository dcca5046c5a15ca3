//! Config validation - warns about unknown fields

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Validate JSON config and warn about unknown fields.
pub fn warn_unknown_fields(content: &str, config_name: &str) {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return;
    };

    for path in find_unknown_keys(&value, &expected_config_keys(), "") {
        warn!("Unknown config field in {config_name}: {path}");
    }
}

/// Find unknown keys in JSON value compared to expected keys.
/// Returns paths like "debug.unknownField" for unknown fields.
fn find_unknown_keys(value: &Value, expected: &ExpectedKeys, prefix: &str) -> Vec<String> {
    let Value::Object(obj) = value else {
        return Vec::new();
    };

    let mut unknowns = Vec::new();
    for (key, child) in obj {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        if let Some(nested) = expected.nested.get(key.as_str()) {
            unknowns.extend(find_unknown_keys(child, nested, &path));
        } else if !expected.fields.contains(key.as_str()) {
            unknowns.push(path);
        }
    }

    unknowns
}

/// `fields` are leaf fields, `nested` are nested objects with their own expected keys.
struct ExpectedKeys {
    fields: HashSet<&'static str>,
    nested: HashMap<&'static str, ExpectedKeys>,
}

impl ExpectedKeys {
    fn new(fields: &[&'static str]) -> Self {
        Self {
            fields: fields.iter().copied().collect(),
            nested: HashMap::new(),
        }
    }

    fn with_nested(mut self, key: &'static str, nested: ExpectedKeys) -> Self {
        self.nested.insert(key, nested);
        self
    }
}

fn expected_config_keys() -> ExpectedKeys {
    ExpectedKeys::new(&["dataDir"])
        .with_nested(
            "discovery",
            ExpectedKeys::new(&["pollIntervalMs", "boardListTimeoutMs"]),
        )
        .with_nested(
            "debug",
            ExpectedKeys::new(&[
                "maxSessionsPerInstance",
                "shutdownGraceMs",
                "defaultInterpreter",
            ]),
        )
        .with_nested("operations", ExpectedKeys::new(&["eventBuffer"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unknowns(value: &Value) -> Vec<String> {
        let mut found = find_unknown_keys(value, &expected_config_keys(), "");
        found.sort();
        found
    }

    #[test]
    fn test_known_fields_pass() {
        let value = json!({
            "dataDir": "/srv/kiln",
            "discovery": {"pollIntervalMs": 500},
            "debug": {"defaultInterpreter": "mi2"},
            "operations": {"eventBuffer": 16}
        });
        assert!(unknowns(&value).is_empty());
    }

    #[test]
    fn test_reports_nested_paths() {
        let value = json!({
            "debug": {"maxSession": 2},
            "discovery": {"pollIntervalMs": 500, "usb": true},
            "theme": "dark"
        });
        assert_eq!(
            unknowns(&value),
            vec!["debug.maxSession", "discovery.usb", "theme"]
        );
    }

    #[test]
    fn test_non_object_is_ignored() {
        assert!(unknowns(&json!([1, 2])).is_empty());
        warn_unknown_fields("not json", "config.json");
    }
}
