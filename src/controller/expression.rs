//! Guarded expression evaluation over the reconciled state.
//!
//! Expressions are evaluated against three variables: `instance` (the full
//! object as a mapping), `resources` (live objects in managed order) and
//! `values` (mirror of the final values). Failures never fail the
//! reconcile; callers log and fall back to defaults.

use minijinja::value::ValueKind;
use minijinja::Environment;
use serde_json::{Map, Value};

/// Bound environment for one evaluation.
#[derive(Debug, Default)]
pub struct ExpressionData {
    pub instance: Value,
    pub resources: Vec<Value>,
    pub values: Map<String, Value>,
}

/// Compile and evaluate `expr`, unwrapping the result into plain JSON.
pub fn eval_expression(expr: &str, data: &ExpressionData) -> anyhow::Result<Value> {
    let mut env = Environment::new();
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Chainable);
    let compiled = env.compile_expression(expr)?;

    // `values` falls back to `instance.values` when not populated.
    let values = if data.values.is_empty() {
        data.instance
            .get("status")
            .and_then(|s| s.get("values"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    } else {
        data.values.clone()
    };

    let result = compiled.eval(minijinja::context! {
        instance => minijinja::Value::from_serialize(&data.instance),
        resources => minijinja::Value::from_serialize(&data.resources),
        values => minijinja::Value::from_serialize(&values),
    })?;
    Ok(unwrap_value(&result))
}

/// Recursively convert an engine value to JSON. Sequences become arrays,
/// mappings become objects with non-string keys skipped, and anything
/// unrepresentable becomes null.
fn unwrap_value(value: &minijinja::Value) -> Value {
    match value.kind() {
        ValueKind::Undefined | ValueKind::None => Value::Null,
        ValueKind::Bool => Value::Bool(value.is_true()),
        ValueKind::Number => {
            if let Ok(i) = i64::try_from(value.clone()) {
                Value::Number(i.into())
            } else {
                // Floats and out-of-range integers go through serde.
                serde_json::to_value(value).unwrap_or(Value::Null)
            }
        }
        ValueKind::String => Value::String(value.as_str().unwrap_or_default().to_string()),
        ValueKind::Seq | ValueKind::Iterable => {
            let items = value
                .try_iter()
                .map(|iter| iter.map(|item| unwrap_value(&item)).collect())
                .unwrap_or_default();
            Value::Array(items)
        }
        ValueKind::Map => {
            let mut out = Map::new();
            if let Ok(keys) = value.try_iter() {
                for key in keys {
                    let Some(key_str) = key.as_str() else {
                        continue;
                    };
                    let item = value.get_item(&key).unwrap_or_default();
                    out.insert(key_str.to_string(), unwrap_value(&item));
                }
            }
            Value::Object(out)
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> ExpressionData {
        ExpressionData {
            instance: json!({
                "metadata": {"name": "test-instance"},
                "status": {"values": {"foo": "bar"}},
            }),
            resources: vec![json!({
                "kind": "Service",
                "metadata": {"name": "test-svc"},
            })],
            values: match json!({"foo": "bar"}) {
                Value::Object(m) => m,
                _ => unreachable!(),
            },
        }
    }

    #[test]
    fn simple_value_access() {
        let got = eval_expression("values.foo", &data()).unwrap();
        assert_eq!(got, json!("bar"));
    }

    #[test]
    fn resource_access() {
        let got = eval_expression("resources[0].kind", &data()).unwrap();
        assert_eq!(got, json!("Service"));
    }

    #[test]
    fn list_construction() {
        let got = eval_expression("[{'name': 'test', 'status': 'Running'}]", &data()).unwrap();
        assert_eq!(got, json!([{"name": "test", "status": "Running"}]));
    }

    #[test]
    fn endpoint_literal() {
        let got = eval_expression("[{'name':'x','url':'http://x'}]", &data()).unwrap();
        assert_eq!(got, json!([{"name": "x", "url": "http://x"}]));
    }

    #[test]
    fn invalid_syntax_is_an_error() {
        assert!(eval_expression("values.foo +", &data()).is_err());
    }

    #[test]
    fn values_fall_back_to_instance_status() {
        let mut d = data();
        d.values = Map::new();
        let got = eval_expression("values.foo", &d).unwrap();
        assert_eq!(got, json!("bar"));
    }

    #[test]
    fn numbers_and_bools_unwrap() {
        let got = eval_expression("[1, 2.5, true]", &data()).unwrap();
        assert_eq!(got, json!([1, 2.5, true]));
    }
}
