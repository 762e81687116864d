//! Unit tests for the values tree: JSON round trips, deep copies, merge
//! semantics and reference round trips for managed resources.

use bundler::api::values::{equal_values, merge_into, merge_maps};
use bundler::api::{ManagedResource, Values};
use serde_json::{json, Map, Value};

fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        other => panic!("expected object, got {other}"),
    }
}

#[test]
fn null_round_trips_to_empty_tree() {
    let values: Values = serde_json::from_str("null").unwrap();
    assert!(values.is_empty());
    assert_eq!(serde_json::to_string(&values).unwrap(), "{}");
}

#[test]
fn values_survive_json_round_trip() {
    let source = json!({
        "image": {"repository": "nginx", "tag": "1.27"},
        "replicas": 3,
        "flags": [true, false],
        "annotation": null,
    });
    let values: Values = serde_json::from_value(source.clone()).unwrap();
    let encoded = serde_json::to_value(&values).unwrap();
    assert_eq!(encoded, source);
}

#[test]
fn deep_copy_shares_nothing() {
    let mut original: Values =
        serde_json::from_value(json!({"outer": {"inner": {"leaf": 1}}})).unwrap();
    let copy = original.clone();
    original
        .0
        .get_mut("outer")
        .and_then(Value::as_object_mut)
        .and_then(|o| o.get_mut("inner"))
        .and_then(Value::as_object_mut)
        .unwrap()
        .insert("leaf".into(), json!(99));
    assert_eq!(copy.0["outer"]["inner"]["leaf"], json!(1));
}

#[test]
fn merge_maps_is_right_biased_on_conflicts() {
    let base = obj(json!({"a": {"x": 1}, "keep": "base"}));
    let overlay = obj(json!({"a": {"x": 2}}));
    let merged = merge_maps(&base, &overlay);
    assert_eq!(merged["a"]["x"], json!(2));
    assert_eq!(merged["keep"], json!("base"));
}

#[test]
fn merge_maps_scalar_replaces_mapping() {
    let base = obj(json!({"a": {"x": 1}}));
    let overlay = obj(json!({"a": "flat"}));
    let merged = merge_maps(&base, &overlay);
    assert_eq!(merged["a"], json!("flat"));
}

#[test]
fn merge_into_overlays_onto_existing_base() {
    let mut base = obj(json!({"a": {"b": {"existing": true}}}));
    merge_into("a.b.c", "v", &mut base).unwrap();
    assert_eq!(
        Value::Object(base),
        json!({"a": {"b": {"existing": true, "c": "v"}}})
    );
}

#[test]
fn equal_values_empty_vs_missing() {
    assert!(equal_values(&Map::new(), &obj(json!({}))));
}

#[test]
fn managed_resource_tuple_round_trip() {
    let reference = ManagedResource {
        api_version: "networking.k8s.io/v1".into(),
        kind: "Ingress".into(),
        namespace: "prod".into(),
        name: "web".into(),
    };
    assert_eq!(reference.group_version(), ("networking.k8s.io", "v1"));
    assert_eq!(reference.group_kind(), ("networking.k8s.io", "Ingress"));
    let from_stub = ManagedResource::from_object(&reference.to_stub()).unwrap();
    assert_eq!(from_stub, reference);

    let encoded = serde_json::to_value(&reference).unwrap();
    let decoded: ManagedResource = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, reference);
}
