//! Value resolution: external references plus inline values become the
//! final values tree.
//!
//! References resolve in declaration order. Secret data and ConfigMap data
//! entries are dotted-path assignments (`--set` style); ConfigMap
//! binaryData entries are whole YAML documents deep-merged into the
//! accumulator. Inline values merge last, on top of everything.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use serde_json::{Map, Value};

use crate::api::values::{merge_into, merge_maps};
use crate::api::{Instance, Values};
use crate::error::{Error, Result};

/// Resolve `spec.valuesFrom` and fold the inline values on top, writing the
/// final tree back onto the spec.
pub async fn resolve_values(client: &Client, instance: &mut Instance) -> Result<()> {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let mut base: Map<String, Value> = Map::new();

    for reference in &instance.spec.values_from {
        match reference.kind.to_lowercase().as_str() {
            "secret" => {
                let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
                let secret = match api.get_opt(&reference.name).await? {
                    Some(secret) => secret,
                    None if reference.optional => continue,
                    None => {
                        return Err(Error::Reference {
                            kind: reference.kind.clone(),
                            name: reference.name.clone(),
                            detail: "not found".to_string(),
                        })
                    }
                };
                for (key, raw) in secret.data.unwrap_or_default() {
                    let value = String::from_utf8_lossy(&raw.0);
                    let path = format!("{}{}", reference.prefix, key);
                    merge_into(&path, &value, &mut base).map_err(|e| Error::Reference {
                        kind: reference.kind.clone(),
                        name: reference.name.clone(),
                        detail: format!("key[{key}]: {e}"),
                    })?;
                }
            }
            "configmap" => {
                let api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
                let configmap = match api.get_opt(&reference.name).await? {
                    Some(configmap) => configmap,
                    None if reference.optional => continue,
                    None => {
                        return Err(Error::Reference {
                            kind: reference.kind.clone(),
                            name: reference.name.clone(),
                            detail: "not found".to_string(),
                        })
                    }
                };
                // binaryData entries are whole values documents
                for (key, raw) in configmap.binary_data.unwrap_or_default() {
                    let document: Value =
                        serde_yaml::from_slice(&raw.0).map_err(|e| Error::Reference {
                            kind: reference.kind.clone(),
                            name: reference.name.clone(),
                            detail: format!("key[{key}]: {e}"),
                        })?;
                    match document {
                        Value::Null => {}
                        Value::Object(map) => base = merge_maps(&base, &map),
                        other => {
                            return Err(Error::Reference {
                                kind: reference.kind.clone(),
                                name: reference.name.clone(),
                                detail: format!("key[{key}]: document is not a mapping: {other}"),
                            })
                        }
                    }
                }
                for (key, value) in configmap.data.unwrap_or_default() {
                    let path = format!("{}{}", reference.prefix, key);
                    merge_into(&path, &value, &mut base).map_err(|e| Error::Reference {
                        kind: reference.kind.clone(),
                        name: reference.name.clone(),
                        detail: format!("key[{key}]: {e}"),
                    })?;
                }
            }
            other => {
                return Err(Error::Reference {
                    kind: other.to_string(),
                    name: reference.name.clone(),
                    detail: "kind is not supported".to_string(),
                })
            }
        }
    }

    // inline values win
    let merged = merge_maps(&base, &instance.spec.values.0);
    instance.spec.values = Values(merged);
    Ok(())
}
