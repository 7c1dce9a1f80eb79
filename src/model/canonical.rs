//! Canonical JSON serialization.
//!
//! Cross-view byte-equality and id determinism both hinge on one canonical
//! encoding: UTF-8, object keys sorted lexicographically at every level, no
//! insignificant whitespace, numbers in serde_json's shortest round-trip
//! form. `serde_json::Map` is ordered by key, so normalization is a
//! recursive rebuild of every object node.

use serde_json::{Map, Value};

use crate::errors::BunsenError;

/// Rebuild a value with every object node in sorted-key form.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            for (key, inner) in map {
                sorted.insert(key.clone(), normalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Canonical bytes of a JSON value.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, BunsenError> {
    serde_json::to_vec(&normalize(value))
        .map_err(|e| BunsenError::ValidationFailed(format!("canonical serialization: {e}")))
}

/// Canonical text of a JSON value.
pub fn to_string(value: &Value) -> Result<String, BunsenError> {
    serde_json::to_string(&normalize(value))
        .map_err(|e| BunsenError::ValidationFailed(format!("canonical serialization: {e}")))
}

/// Parse JSON text, failing with `ValidationFailed` on malformed input.
pub fn parse(text: &[u8]) -> Result<Value, BunsenError> {
    serde_json::from_slice(text)
        .map_err(|e| BunsenError::ValidationFailed(format!("malformed JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use serde_json::json;

    /// Keys sort at every level and whitespace is dropped.
    #[test]
    fn test_sorted_compact() {
        let value: Value =
            serde_json::from_str(r#"{"b": 1, "a": {"z": true, "m": [3, {"y":0,"x":1}]}}"#).unwrap();
        assert_eq!(
            to_string(&value).unwrap(),
            r#"{"a":{"m":[3,{"x":1,"y":0}],"z":true},"b":1}"#
        );
    }

    /// Numbers keep their shortest round-trip form.
    #[test]
    fn test_number_forms() {
        let value = json!({"count": 42, "ratio": 0.5, "neg": -7});
        assert_eq!(
            to_string(&value).unwrap(),
            r#"{"count":42,"neg":-7,"ratio":0.5}"#
        );
    }

    /// Canonicalization is a fixed point: re-encoding canonical text is
    /// byte-identical.
    #[test]
    fn test_fixed_point() {
        let value = json!({"b": [1, 2], "a": null, "c": {"k": "v"}});
        let once = to_bytes(&value).unwrap();
        let twice = to_bytes(&parse(&once).unwrap()).unwrap();
        assert_eq!(once, twice);
    }

    quickcheck! {
        /// parse(serialize(v)) == normalize(v) for arbitrary string maps.
        fn prop_round_trip(entries: Vec<(String, i64)>) -> bool {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(k, Value::from(v));
            }
            let value = Value::Object(map);
            let bytes = to_bytes(&value).unwrap();
            parse(&bytes).unwrap() == normalize(&value)
        }
    }
}
