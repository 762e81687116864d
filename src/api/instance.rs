//! The Instance custom resource: one declaratively-managed package
//! deployment.

use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::api::values::Values;

/// Desired state of a packaged workload.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.bundler.dev",
    version = "v1",
    kind = "Instance",
    plural = "instances",
    namespaced,
    status = "InstanceStatus",
    printcolumn = r#"{"name":"VERSION","type":"string","jsonPath":".status.version","description":"Package version"}"#,
    printcolumn = r#"{"name":"PHASE","type":"string","jsonPath":".status.phase","description":"Current phase"}"#,
    printcolumn = r#"{"name":"APP","type":"string","jsonPath":".status.appVersion","description":"App version","priority":1}"#,
    printcolumn = r#"{"name":"UPDATE","type":"date","jsonPath":".status.upgradeTimestamp","description":"Last upgrade","priority":1}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp","description":"Creation time"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Package kind deciding which materializer handles this instance.
    #[serde(default)]
    pub kind: InstanceKind,

    /// URL of the package source: helm repository, tarball url, `file://`
    /// directory, etc.
    pub url: String,

    /// Version of the package (chart version, revision, tag).
    #[serde(default)]
    pub version: String,

    /// Name of the chart to install when it differs from the instance name.
    #[serde(default)]
    pub chart: String,

    /// Path inside the downloaded package to the chart/overlay directory.
    #[serde(default)]
    pub path: String,

    /// Instances (or arbitrary objects) that must exist before this one is
    /// installed.
    #[serde(default)]
    pub dependencies: Vec<DependencyReference>,

    /// Inline values merged on top of everything referenced in `valuesFrom`.
    #[serde(default)]
    pub values: Values,

    /// References to ConfigMaps/Secrets whose contents become values.
    #[serde(default)]
    pub values_from: Vec<ValuesFrom>,

    /// Backend-specific options (e.g. helm `timeout`, `maxHistory`).
    #[serde(default)]
    pub options: Vec<InstanceOption>,

    /// Free-form extension knobs passed through to the materializer.
    #[serde(default)]
    pub extensions: Vec<InstanceOption>,
}

/// Which materializer backend handles an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    #[default]
    Helm,
    Kustomize,
    Template,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Helm => write!(f, "helm"),
            InstanceKind::Kustomize => write!(f, "kustomize"),
            InstanceKind::Template => write!(f, "template"),
        }
    }
}

pub const VALUES_FROM_KIND_CONFIGMAP: &str = "ConfigMap";
pub const VALUES_FROM_KIND_SECRET: &str = "Secret";

/// Reference to a ConfigMap or Secret providing values.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFrom {
    /// `ConfigMap` or `Secret`.
    pub kind: String,
    /// Name of the referenced object, looked up in the instance namespace.
    pub name: String,
    /// Identifier prepended to each key before the dotted-path assignment.
    #[serde(default)]
    pub prefix: String,
    /// When true a missing reference is skipped instead of failing.
    #[serde(default)]
    pub optional: bool,
}

/// Reference to an object this instance depends on. Blank fields default to
/// the instance namespace and the Instance group/kind.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReference {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

/// Named option consumed by a materializer backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct InstanceOption {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Observed state written back by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Generation last acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Single-word lifecycle summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Error text of the last failed reconcile; empty after success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Post-install notes rendered by the package, when it carries any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Final values passed to the materializer on the last apply.
    #[serde(default, skip_serializing_if = "Values::is_empty")]
    pub values: Values,

    /// Resolved package version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Application version reported by the package metadata.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,

    /// Namespace the package was installed into.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// First successful install time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,

    /// Last successful install/upgrade time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_timestamp: Option<String>,

    /// Objects created or patched on behalf of this instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ManagedResource>,

    /// Reachable endpoints extracted from the managed resources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,

    /// Per-workload health states.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<State>,

    /// Free-form summary entries (chart description, home page, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, String>,
}

/// Weak reference to a cluster object; identity is the full 4-tuple.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl ManagedResource {
    /// Reference for a rendered manifest document. Documents without
    /// apiVersion/kind/name yield `None` and are not tracked.
    pub fn from_object(obj: &Value) -> Option<ManagedResource> {
        let api_version = obj.get("apiVersion")?.as_str()?.to_string();
        let kind = obj.get("kind")?.as_str()?.to_string();
        let metadata = obj.get("metadata")?;
        let name = metadata.get("name")?.as_str()?.to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(ManagedResource {
            api_version,
            kind,
            namespace,
            name,
        })
    }

    /// `(group, version)` parsed from the apiVersion string.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn group_kind(&self) -> (&str, &str) {
        (self.group_version().0, self.kind.as_str())
    }

    /// Stub object carrying just enough identity for a delete call.
    pub fn to_stub(&self) -> Value {
        serde_json::json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "metadata": { "name": self.name, "namespace": self.namespace },
        })
    }
}

impl fmt::Display for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

/// Lifecycle phase persisted on status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    /// Removed or explicitly turned off.
    Disabled,
    /// Last sync attempt failed.
    Failed,
    /// Package applied; no workload health to track.
    Installed,
    /// values.global.paused gates the instance.
    Paused,
    /// Some jobs failed while others succeeded.
    PartialFailed,
    Succeeded,
    Running,
    Pending,
    Degraded,
    Unhealthy,
    Healthy,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Disabled => "Disabled",
            Phase::Failed => "Failed",
            Phase::Installed => "Installed",
            Phase::Paused => "Paused",
            Phase::PartialFailed => "PartialFailed",
            Phase::Succeeded => "Succeeded",
            Phase::Running => "Running",
            Phase::Pending => "Pending",
            Phase::Degraded => "Degraded",
            Phase::Unhealthy => "Unhealthy",
            Phase::Healthy => "Healthy",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-workload health state.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// One of the identifiers in [`state_status`], or whatever a states
    /// expression produced.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Stable state-status identifiers.
pub mod state_status {
    pub const PENDING: &str = "Pending";
    pub const RUNNING: &str = "Running";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const DEGRADED: &str = "Degraded";
    pub const UPDATING: &str = "Updating";
    pub const SCALING: &str = "Scaling";
    pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";
    pub const ERROR: &str = "Error";
    pub const UNKNOWN: &str = "Unknown";
}

/// Reachable endpoint extracted from a managed resource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EndpointKind>,
}

/// Reachability class of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EndpointKind {
    /// Resolvable only from inside the cluster network.
    Cluster,
    /// Reachable from the node network (e.g. NodePort).
    Internal,
    /// Reachable from outside the cluster.
    External,
}

/// Condition types written on status.
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_INSTALLED: &str = "Installed";
pub const CONDITION_DEPENDENCIES_READY: &str = "DependenciesReady";

/// Structured status condition.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl InstanceStatus {
    /// Upsert a condition, refreshing the transition time only when the
    /// status value actually flips.
    pub fn set_condition(
        &mut self,
        r#type: &str,
        status: bool,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
    ) {
        let status_str = if status { "True" } else { "False" };
        let now = Utc::now().to_rfc3339();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.r#type == r#type) {
            if existing.status != status_str {
                existing.last_transition_time = Some(now);
            }
            existing.status = status_str.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
            return;
        }
        self.conditions.push(Condition {
            r#type: r#type.to_string(),
            status: status_str.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(now),
            observed_generation,
        });
    }

    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn instance_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_value(InstanceKind::Helm).unwrap(), json!("helm"));
        assert_eq!(
            serde_json::to_value(InstanceKind::Kustomize).unwrap(),
            json!("kustomize")
        );
        let k: InstanceKind = serde_json::from_value(json!("template")).unwrap();
        assert_eq!(k, InstanceKind::Template);
    }

    #[test]
    fn phase_strings_are_stable() {
        assert_eq!(Phase::Installed.to_string(), "Installed");
        assert_eq!(Phase::PartialFailed.to_string(), "PartialFailed");
        assert_eq!(Phase::Failed.to_string(), "Failed");
        let p: Phase = serde_json::from_value(json!("Healthy")).unwrap();
        assert_eq!(p, Phase::Healthy);
    }

    #[test]
    fn managed_resource_round_trips_with_object() {
        let doc = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": {}
        });
        let reference = ManagedResource::from_object(&doc).unwrap();
        assert_eq!(reference.api_version, "apps/v1");
        assert_eq!(reference.group_version(), ("apps", "v1"));
        assert_eq!(reference.group_kind(), ("apps", "Deployment"));

        let stub = reference.to_stub();
        assert_eq!(ManagedResource::from_object(&stub).unwrap(), reference);
    }

    #[test]
    fn managed_resource_core_group_is_empty() {
        let reference = ManagedResource {
            api_version: "v1".into(),
            kind: "Pod".into(),
            namespace: "default".into(),
            name: "p".into(),
        };
        assert_eq!(reference.group_version(), ("", "v1"));
    }

    #[test]
    fn from_object_skips_incomplete_documents() {
        assert!(ManagedResource::from_object(&json!({"kind": "Pod"})).is_none());
        assert!(ManagedResource::from_object(&json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": {}
        }))
        .is_none());
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let mut status = InstanceStatus::default();
        status.set_condition(CONDITION_READY, true, "Installed", "", Some(1));
        let first = status
            .condition(CONDITION_READY)
            .and_then(|c| c.last_transition_time.clone());
        status.set_condition(CONDITION_READY, true, "Healthy", "", Some(2));
        let c = status.condition(CONDITION_READY).unwrap();
        assert_eq!(c.last_transition_time, first);
        assert_eq!(c.reason, "Healthy");
        assert_eq!(c.observed_generation, Some(2));

        status.set_condition(CONDITION_READY, false, "Failed", "boom", Some(2));
        let c = status.condition(CONDITION_READY).unwrap();
        assert_eq!(c.status, "False");
        assert_eq!(c.message, "boom");
    }
}
