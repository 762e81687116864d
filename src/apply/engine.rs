//! Diff & apply engine: computes the create/update/delete set against the
//! previously managed list and reconciles it with server-side apply.

use std::collections::HashMap;

use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde_json::Value;
use tracing::{error, info};

use crate::api::ManagedResource;
use crate::constants::{ANNOTATION_SKIP_DELETE, ANNOTATION_SKIP_UPDATE, FIELD_OWNER};
use crate::error::{Error, Result};

/// Partition of rendered objects against the prior managed list.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Rendered objects with no prior reference.
    pub creates: Vec<Value>,
    /// Rendered objects already managed.
    pub applies: Vec<Value>,
    /// Prior references no rendered object touched.
    pub removes: Vec<ManagedResource>,
}

/// Compute the diff purely on 4-tuple identity. Namespaces must be
/// corrected on both sides beforehand.
pub fn diff(managed: &[ManagedResource], resources: &[Value]) -> DiffResult {
    let mut result = DiffResult::default();
    let mut seen: HashMap<ManagedResource, bool> =
        managed.iter().map(|m| (m.clone(), false)).collect();
    for item in resources {
        let Some(reference) = ManagedResource::from_object(item) else {
            continue;
        };
        match seen.insert(reference, true) {
            None => result.creates.push(item.clone()),
            Some(_) => result.applies.push(item.clone()),
        }
    }
    let mut removes: Vec<ManagedResource> = seen
        .into_iter()
        .filter_map(|(reference, touched)| (!touched).then_some(reference))
        .collect();
    removes.sort();
    result.removes = removes;
    result
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub create_namespace: bool,
    /// When false, CustomResourceDefinitions are never pruned.
    pub clean_crd: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            create_namespace: true,
            clean_crd: false,
        }
    }
}

/// Result of a sync pass: the surviving managed list plus per-object
/// failures. Sub-operation errors never abort the pass.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub managed: Vec<ManagedResource>,
    pub errors: Vec<String>,
}

impl SyncOutcome {
    pub fn into_error(self) -> Option<Error> {
        if self.errors.is_empty() {
            None
        } else {
            Some(Error::Apply(self.errors))
        }
    }
}

/// Cluster-side apply engine shared by the kustomize/template backends and
/// the helm release workflow.
#[derive(Clone)]
pub struct ClientApply {
    client: Client,
}

impl ClientApply {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Full pass: correct namespaces, diff, then reconcile the delta.
    pub async fn sync(
        &self,
        default_namespace: &str,
        managed: &[ManagedResource],
        resources: Vec<Value>,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        let mapper = self.rest_mapper().await?;
        let mut resources = resources;
        let mut managed = managed.to_vec();
        correct_namespaces(&mapper, default_namespace, &mut resources);
        correct_reference_namespaces(&mapper, default_namespace, &mut managed);
        let diffresult = diff(&managed, &resources);
        self.sync_diff(&mapper, diffresult, options).await
    }

    /// Namespace-corrected diff without any cluster mutation, exposed so
    /// callers can take the no-op fast path before syncing.
    pub async fn diff_with_default_namespace(
        &self,
        default_namespace: &str,
        managed: &[ManagedResource],
        resources: &mut Vec<Value>,
    ) -> Result<(RestMapper, DiffResult)> {
        let mapper = self.rest_mapper().await?;
        let mut managed = managed.to_vec();
        correct_namespaces(&mapper, default_namespace, resources);
        correct_reference_namespaces(&mapper, default_namespace, &mut managed);
        let diffresult = diff(&managed, resources);
        Ok((mapper, diffresult))
    }

    /// Reconcile a computed diff: creates, then applies, then removes.
    /// Per-object failures are collected; the surviving managed list always
    /// reflects what is actually on the cluster.
    pub async fn sync_diff(
        &self,
        mapper: &RestMapper,
        diffresult: DiffResult,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        for item in &diffresult.creates {
            let Some(reference) = ManagedResource::from_object(item) else {
                continue;
            };
            info!(resource = %reference, "creating resource");
            if options.create_namespace {
                self.create_namespace_if_missing(&reference.namespace).await;
            }
            if let Err(e) = self.apply_resource(mapper, item, &reference).await {
                let msg = format!("{reference}: {e:#}");
                error!("creating resource: {msg}");
                outcome.errors.push(msg);
                continue;
            }
            outcome.managed.push(reference);
        }

        for item in &diffresult.applies {
            let Some(reference) = ManagedResource::from_object(item) else {
                continue;
            };
            outcome.managed.push(reference.clone());

            if is_skip_update(item) {
                info!(resource = %reference, "ignoring update");
                continue;
            }
            info!(resource = %reference, "applying resource");
            if options.create_namespace {
                self.create_namespace_if_missing(&reference.namespace).await;
            }
            if let Err(e) = self.apply_resource(mapper, item, &reference).await {
                let msg = format!("{reference}: {e:#}");
                error!("applying resource: {msg}");
                outcome.errors.push(msg);
            }
        }

        for reference in &diffresult.removes {
            if is_crd(reference) && !options.clean_crd {
                continue;
            }
            info!(resource = %reference, "deleting resource");
            match self.delete_resource(mapper, reference).await {
                Ok(()) => {}
                Err(DeleteOutcome::Skipped) => {
                    info!(resource = %reference, "ignoring delete");
                    outcome.managed.push(reference.clone());
                }
                Err(DeleteOutcome::Failed(e)) => {
                    let msg = format!("{reference}: {e:#}");
                    error!("deleting resource: {msg}");
                    outcome.errors.push(msg);
                    // Keep the reference so the next pass retries the delete.
                    outcome.managed.push(reference.clone());
                }
            }
        }

        outcome.managed.sort();
        Ok(outcome)
    }

    /// Get-then-create for absent objects; server-side apply with forced
    /// ownership otherwise.
    async fn apply_resource(
        &self,
        mapper: &RestMapper,
        obj: &Value,
        reference: &ManagedResource,
    ) -> anyhow::Result<()> {
        let api = self.dynamic_api(mapper, reference);
        match api.get_opt(&reference.name).await? {
            None => {
                let dynamic: DynamicObject = serde_json::from_value(obj.clone())?;
                api.create(&PostParams::default(), &dynamic).await?;
            }
            Some(_) => {
                let mut obj = obj.clone();
                if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.remove("managedFields");
                }
                let params = PatchParams::apply(FIELD_OWNER).force();
                api.patch(&reference.name, &params, &Patch::Apply(&obj))
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_resource(
        &self,
        mapper: &RestMapper,
        reference: &ManagedResource,
    ) -> std::result::Result<(), DeleteOutcome> {
        let api = self.dynamic_api(mapper, reference);
        match api.get_opt(&reference.name).await {
            Ok(None) => return Ok(()),
            Ok(Some(live)) => {
                let skip = live
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_SKIP_DELETE))
                    .is_some_and(|v| v == "true");
                if skip {
                    return Err(DeleteOutcome::Skipped);
                }
            }
            Err(e) => return Err(DeleteOutcome::Failed(e.into())),
        }
        match api.delete(&reference.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if Error::is_not_found(&e) => Ok(()),
            Err(e) => Err(DeleteOutcome::Failed(e.into())),
        }
    }

    fn dynamic_api(&self, mapper: &RestMapper, reference: &ManagedResource) -> Api<DynamicObject> {
        let (resource, scope) = mapper.resolve(reference);
        match scope {
            Scope::Namespaced => {
                Api::namespaced_with(self.client.clone(), &reference.namespace, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        }
    }

    async fn create_namespace_if_missing(&self, name: &str) {
        use k8s_openapi::api::core::v1::Namespace;
        if name.is_empty() {
            return;
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        if matches!(api.get_opt(name).await, Ok(Some(_))) {
            return;
        }
        let ns = Namespace {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Err(e) = api.create(&PostParams::default(), &ns).await {
            if !matches!(&e, kube::Error::Api(ae) if ae.code == 409) {
                error!("creating namespace {name}: {e}");
            }
        }
    }

    /// Snapshot the cluster's discovery information for scope and resource
    /// resolution during one sync pass.
    pub async fn rest_mapper(&self) -> Result<RestMapper> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(Error::Kube)?;
        Ok(RestMapper { discovery })
    }
}

enum DeleteOutcome {
    Skipped,
    Failed(anyhow::Error),
}

/// Scope and resource resolution backed by one discovery snapshot.
pub struct RestMapper {
    discovery: Discovery,
}

impl RestMapper {
    /// Resolve a reference to its API resource and scope. Kinds missing
    /// from discovery (e.g. a CRD applied earlier in the same stream) fall
    /// back to a pluralization guess and are assumed namespaced when the
    /// reference carries a namespace.
    pub fn resolve(&self, reference: &ManagedResource) -> (ApiResource, Scope) {
        let (group, version) = reference.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        if let Some((resource, caps)) = self.discovery.resolve_gvk(&gvk) {
            return (resource, caps.scope);
        }
        let scope = if reference.namespace.is_empty() {
            Scope::Cluster
        } else {
            Scope::Namespaced
        };
        (ApiResource::from_gvk(&gvk), scope)
    }

    /// Scope of a kind as known to discovery; `None` when unknown.
    pub fn scope_of(&self, reference: &ManagedResource) -> Option<Scope> {
        let (group, version) = reference.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        self.discovery.resolve_gvk(&gvk).map(|(_, caps)| caps.scope)
    }
}

/// Fill blank namespaces on namespace-scoped objects and clear namespaces
/// on cluster-scoped ones. Kinds unknown to discovery are left untouched.
pub fn correct_namespaces(mapper: &RestMapper, default_namespace: &str, resources: &mut [Value]) {
    for item in resources.iter_mut() {
        let Some(reference) = ManagedResource::from_object(item) else {
            continue;
        };
        let Some(scope) = mapper.scope_of(&reference) else {
            continue;
        };
        let Some(meta) = item.get_mut("metadata").and_then(Value::as_object_mut) else {
            continue;
        };
        match scope {
            Scope::Namespaced if reference.namespace.is_empty() => {
                meta.insert(
                    "namespace".to_string(),
                    Value::String(default_namespace.to_string()),
                );
            }
            Scope::Cluster if !reference.namespace.is_empty() => {
                meta.remove("namespace");
            }
            _ => {}
        }
    }
}

/// Same correction for bare references.
pub fn correct_reference_namespaces(
    mapper: &RestMapper,
    default_namespace: &str,
    references: &mut [ManagedResource],
) {
    for reference in references.iter_mut() {
        let Some(scope) = mapper.scope_of(reference) else {
            continue;
        };
        match scope {
            Scope::Namespaced if reference.namespace.is_empty() => {
                reference.namespace = default_namespace.to_string();
            }
            Scope::Cluster if !reference.namespace.is_empty() => {
                reference.namespace = String::new();
            }
            _ => {}
        }
    }
}

fn is_skip_update(obj: &Value) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(ANNOTATION_SKIP_UPDATE))
        .and_then(Value::as_str)
        .is_some_and(|v| v == "true")
}

fn is_crd(reference: &ManagedResource) -> bool {
    reference.group_kind() == ("apiextensions.k8s.io", "CustomResourceDefinition")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, ns: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns},
        })
    }

    fn reference(name: &str, ns: &str) -> ManagedResource {
        ManagedResource {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            namespace: ns.into(),
            name: name.into(),
        }
    }

    #[test]
    fn diff_partitions_creates_applies_removes() {
        let managed = vec![reference("kept", "ns"), reference("gone", "ns")];
        let rendered = vec![cm("kept", "ns"), cm("new", "ns")];
        let result = diff(&managed, &rendered);
        assert_eq!(result.creates.len(), 1);
        assert_eq!(result.creates[0]["metadata"]["name"], "new");
        assert_eq!(result.applies.len(), 1);
        assert_eq!(result.applies[0]["metadata"]["name"], "kept");
        assert_eq!(result.removes, vec![reference("gone", "ns")]);
    }

    #[test]
    fn diff_is_idempotent_once_managed_reflects_the_apply() {
        let rendered = vec![cm("a", "ns"), cm("b", "ns")];
        let first = diff(&[], &rendered);
        assert_eq!(first.creates.len(), 2);
        assert!(first.removes.is_empty());

        // Managed list after the apply: exactly the rendered references.
        let managed: Vec<ManagedResource> = rendered
            .iter()
            .filter_map(ManagedResource::from_object)
            .collect();
        let second = diff(&managed, &rendered);
        assert!(second.creates.is_empty());
        assert!(second.removes.is_empty());
        assert_eq!(second.applies.len(), 2);
    }

    #[test]
    fn diff_distinguishes_namespaces() {
        let managed = vec![reference("a", "ns1")];
        let rendered = vec![cm("a", "ns2")];
        let result = diff(&managed, &rendered);
        assert_eq!(result.creates.len(), 1);
        assert_eq!(result.removes.len(), 1);
    }

    #[test]
    fn diff_ignores_documents_without_identity() {
        let rendered = vec![json!({"apiVersion": "v1"})];
        let result = diff(&[], &rendered);
        assert!(result.creates.is_empty());
        assert!(result.applies.is_empty());
    }

    #[test]
    fn skip_update_annotation_is_detected() {
        let mut obj = cm("a", "ns");
        assert!(!is_skip_update(&obj));
        obj["metadata"]["annotations"] = json!({ANNOTATION_SKIP_UPDATE: "true"});
        assert!(is_skip_update(&obj));
    }

    #[test]
    fn crd_detection_matches_group_and_kind() {
        let crd = ManagedResource {
            api_version: "apiextensions.k8s.io/v1".into(),
            kind: "CustomResourceDefinition".into(),
            namespace: String::new(),
            name: "foos.example.com".into(),
        };
        assert!(is_crd(&crd));
        assert!(!is_crd(&reference("a", "ns")));
    }

    #[test]
    fn sync_outcome_aggregates_errors() {
        let outcome = SyncOutcome {
            managed: vec![],
            errors: vec!["x".into(), "y".into()],
        };
        let err = outcome.into_error().unwrap();
        assert_eq!(err.to_string(), "x\ny");

        let ok = SyncOutcome::default();
        assert!(ok.into_error().is_none());
    }
}
