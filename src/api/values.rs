//! Free-form values trees and their merge semantics.
//!
//! `Values` wraps a JSON object and survives round-trips through the
//! apiserver unchanged. Merging is right-biased and recurses into nested
//! mappings; dotted-path assignment follows the `--set key=value` convention.

use std::fmt;

use schemars::{schema::Schema, JsonSchema};
use serde::de::{Deserializer, Error as _};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A nested mapping of string keys to arbitrary JSON-compatible values.
///
/// A JSON `null` deserializes to an empty mapping so that a cleared
/// `spec.values` never fails decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values(pub Map<String, Value>);

impl Values {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a value by path segments, descending through nested mappings.
    pub fn get_path(&self, keys: &[&str]) -> Option<&Value> {
        let (first, rest) = keys.split_first()?;
        let mut current = self.0.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    /// A copy with null-valued entries removed at every mapping level,
    /// used when projecting values onto the status block.
    pub fn without_nulls(&self) -> Values {
        fn strip(map: &Map<String, Value>) -> Map<String, Value> {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                match v {
                    Value::Null => {}
                    Value::Object(m) => {
                        out.insert(k.clone(), Value::Object(strip(m)));
                    }
                    other => {
                        out.insert(k.clone(), other.clone());
                    }
                }
            }
            out
        }
        Values(strip(&self.0))
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

impl From<Map<String, Value>> for Values {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Serialize for Values {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Values {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Values::default()),
            Value::Object(map) => Ok(Values(map)),
            other => Err(D::Error::custom(format!(
                "values must be a mapping, got {other}"
            ))),
        }
    }
}

impl JsonSchema for Values {
    fn schema_name() -> String {
        "Values".to_string()
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> Schema {
        // Free-form object; unknown fields are preserved by the apiserver.
        serde_json::from_value(serde_json::json!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }))
        .expect("static schema literal")
    }
}

/// Right-biased recursive merge of two mappings.
///
/// Keys present in `overlay` replace those in `base` unless both sides are
/// mappings, in which case the merge recurses. Null overlay entries replace
/// rather than delete.
pub fn merge_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut out = base.clone();
    for (k, v) in overlay {
        if let Value::Object(overlay_map) = v {
            if let Some(Value::Object(base_map)) = out.get(k) {
                out.insert(k.clone(), Value::Object(merge_maps(base_map, overlay_map)));
                continue;
            }
        }
        out.insert(k.clone(), v.clone());
    }
    out
}

/// Assign `raw` into `base` at the dotted path `key`, creating intermediate
/// mappings as needed. Scalars are typed the way `--set` types them:
/// booleans, integers, floats and `null` are recognized, everything else
/// stays a string.
pub fn merge_into(key: &str, raw: &str, base: &mut Map<String, Value>) -> Result<(), String> {
    if key.is_empty() {
        return Err("empty key".to_string());
    }
    let mut segments = key.split('.').collect::<Vec<_>>();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(format!("invalid key [{key}]"));
    }
    let last = segments.pop().expect("split yields at least one segment");

    let mut current = base;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            // A scalar in the way is replaced, matching overlay semantics.
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
    current.insert(last.to_string(), parse_scalar(raw));
    Ok(())
}

fn parse_scalar(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

/// Semantic equality for values trees: two empty trees compare equal, else
/// deep structural equality.
pub fn equal_values(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    (a.is_empty() && b.is_empty()) || a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn null_deserializes_to_empty() {
        let v: Values = serde_json::from_str("null").unwrap();
        assert!(v.is_empty());
    }

    #[test]
    fn non_mapping_fails() {
        assert!(serde_json::from_str::<Values>("[1,2]").is_err());
        assert!(serde_json::from_str::<Values>("\"x\"").is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let v: Values = serde_json::from_value(json!({"a":"b","num":42,"m":{"x":1.5}})).unwrap();
        let encoded = serde_json::to_value(&v).unwrap();
        let again: Values = serde_json::from_value(encoded).unwrap();
        assert_eq!(v, again);
    }

    #[test]
    fn clone_is_deep() {
        let mut orig: Values = serde_json::from_value(json!({"s":"v","m":{"x":1.0}})).unwrap();
        let copy = orig.clone();
        orig.0.insert("s".into(), json!("changed"));
        orig.0
            .get_mut("m")
            .and_then(Value::as_object_mut)
            .unwrap()
            .insert("x".into(), json!(2.0));
        assert_eq!(copy.0["s"], json!("v"));
        assert_eq!(copy.0["m"]["x"], json!(1.0));
    }

    #[test]
    fn merge_is_right_biased_and_recursive() {
        let base = obj(json!({"a":1,"m":{"x":1,"y":2},"s":"keep"}));
        let overlay = obj(json!({"a":2,"m":{"y":3,"z":4}}));
        let merged = merge_maps(&base, &overlay);
        assert_eq!(Value::Object(merged), json!({"a":2,"m":{"x":1,"y":3,"z":4},"s":"keep"}));
    }

    #[test]
    fn merge_disjoint_is_associative() {
        let a = obj(json!({"a":1}));
        let b = obj(json!({"b":2}));
        let c = obj(json!({"c":3}));
        let left = merge_maps(&merge_maps(&a, &b), &c);
        let right = merge_maps(&a, &merge_maps(&b, &c));
        assert_eq!(left, right);
    }

    #[test]
    fn merge_null_replaces_but_does_not_delete() {
        let base = obj(json!({"a":1}));
        let overlay = obj(json!({"a":null}));
        let merged = merge_maps(&base, &overlay);
        assert_eq!(merged["a"], Value::Null);
        assert!(merged.contains_key("a"));
    }

    #[test]
    fn merge_into_builds_nested_path() {
        let mut base = obj(json!({"a":{"keep":true}}));
        merge_into("a.b.c", "v", &mut base).unwrap();
        assert_eq!(
            Value::Object(base),
            json!({"a":{"keep":true,"b":{"c":"v"}}})
        );
    }

    #[test]
    fn merge_into_types_scalars() {
        let mut base = Map::new();
        merge_into("b", "true", &mut base).unwrap();
        merge_into("i", "42", &mut base).unwrap();
        merge_into("f", "1.5", &mut base).unwrap();
        merge_into("n", "null", &mut base).unwrap();
        merge_into("s", "hello", &mut base).unwrap();
        assert_eq!(base["b"], json!(true));
        assert_eq!(base["i"], json!(42));
        assert_eq!(base["f"], json!(1.5));
        assert_eq!(base["n"], Value::Null);
        assert_eq!(base["s"], json!("hello"));
    }

    #[test]
    fn merge_into_rejects_bad_keys() {
        let mut base = Map::new();
        assert!(merge_into("", "v", &mut base).is_err());
        assert!(merge_into("a..b", "v", &mut base).is_err());
    }

    #[test]
    fn equal_values_treats_empty_as_equal() {
        assert!(equal_values(&Map::new(), &Map::new()));
        let a = obj(json!({"k":"v"}));
        assert!(equal_values(&a, &a.clone()));
        assert!(!equal_values(&a, &Map::new()));
        assert!(!equal_values(&a, &obj(json!({"k":"other"}))));
    }

    #[test]
    fn without_nulls_strips_recursively() {
        let v: Values =
            serde_json::from_value(json!({"a":null,"m":{"x":null,"y":1},"k":"v"})).unwrap();
        let stripped = v.without_nulls();
        assert_eq!(
            serde_json::to_value(&stripped).unwrap(),
            json!({"m":{"y":1},"k":"v"})
        );
    }

    #[test]
    fn get_path_descends_mappings() {
        let v: Values = serde_json::from_value(json!({"global":{"paused":true}})).unwrap();
        assert_eq!(v.get_path(&["global", "paused"]), Some(&json!(true)));
        assert_eq!(v.get_path(&["global", "missing"]), None);
        assert_eq!(v.get_path(&["missing"]), None);
    }
}
