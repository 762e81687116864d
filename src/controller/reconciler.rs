//! Reconciliation state machine for Instance resources.
//!
//! Per invocation: fetch, branch on deletion vs sync, gate on
//! dependencies, resolve values, materialize, compute status, and write
//! back whatever changed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kube::api::{Api, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::Client;
use kube_runtime::controller::Action;
use kube_runtime::reflector::Store;
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::{
    Instance, Phase, CONDITION_DEPENDENCIES_READY, CONDITION_INSTALLED, CONDITION_READY,
};
use crate::apply::engine::ClientApply;
use crate::apply::BundleApplier;
use crate::constants::{FINALIZER_NAME, GROUP_NAME};
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::dynamic::DynamicSources;
use crate::controller::resolve::resolve_values;
use crate::controller::status::sync_status;
use crate::error::{DependencyReason, Error, Result};
use crate::observability::metrics;

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub applier: BundleApplier,
    pub engine: ClientApply,
    pub sources: Arc<DynamicSources>,
    pub store: Store<Instance>,
    pub backoffs: Mutex<HashMap<String, ExponentialBackoff>>,
}

impl Context {
    fn reset_backoff(&self, key: &str) {
        if let Ok(mut backoffs) = self.backoffs.lock() {
            if let Some(backoff) = backoffs.get_mut(key) {
                backoff.reset();
            }
        }
    }
}

fn resource_key(instance: &Instance) -> String {
    format!(
        "{}/{}",
        instance.metadata.namespace.as_deref().unwrap_or_default(),
        instance.metadata.name.as_deref().unwrap_or_default(),
    )
}

pub async fn reconcile(instance: Arc<Instance>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = instance.metadata.name.clone().unwrap_or_default();
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let api: Api<Instance> = Api::namespaced(ctx.client.clone(), &namespace);

    // Work on a fresh read; the cached copy may trail our own writes.
    let mut instance = match api.get(&name).await {
        Ok(instance) => instance,
        Err(e) if Error::is_not_found(&e) => return Ok(Action::await_change()),
        Err(e) => return Err(Error::Kube(e)),
    };
    info!(%name, %namespace, "reconciling instance");
    metrics::increment_reconciliations();
    let original_status = instance.status.clone();

    if instance.metadata.deletion_timestamp.is_some() {
        ctx.applier.remove(&mut instance).await?;
        if remove_finalizer(&mut instance) {
            info!(%name, "remove finalizer");
            match update_finalizers(&api, &instance).await {
                Ok(()) => return Ok(Action::await_change()),
                // Someone else got there; the object is going away anyway.
                Err(e) if Error::is_conflict(&e) || Error::is_not_found(&e) => {
                    return Ok(Action::await_change())
                }
                Err(e) => return Err(Error::Kube(e)),
            }
        }
        if instance.status != original_status {
            patch_status(&api, &instance).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&instance) {
        info!(%name, "add finalizer");
        add_finalizer(&mut instance);
        update_finalizers(&api, &instance).await.map_err(Error::Kube)?;
        return Ok(Action::await_change());
    }

    let result = sync(&mut instance, &ctx).await;
    {
        let status = instance.status.get_or_insert_with(Default::default);
        status.observed_generation = instance.metadata.generation;
        if let Err(e) = &result {
            status.phase = Some(Phase::Failed);
            status.message = e.to_string();
            status.set_condition(
                CONDITION_READY,
                false,
                "Failed",
                &e.to_string(),
                instance.metadata.generation,
            );
        }
    }
    if instance.status != original_status {
        patch_status(&api, &instance).await?;
    }
    metrics::observe_reconcile_duration(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            ctx.reset_backoff(&resource_key(&instance));
            info!(
                %name,
                duration = start.elapsed().as_secs_f64(),
                "reconciliation complete"
            );
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Requeue failures with per-key exponential backoff.
pub fn error_policy(instance: Arc<Instance>, error: &Error, ctx: Arc<Context>) -> Action {
    metrics::increment_reconcile_errors();
    let key = resource_key(&instance);
    let delay = ctx
        .backoffs
        .lock()
        .map(|mut backoffs| backoffs.entry(key.clone()).or_default().next_backoff())
        .unwrap_or_else(|_| std::time::Duration::from_secs(60));
    error!(%key, "reconciliation error (requeue in {delay:?}): {error}");
    Action::requeue(delay)
}

async fn sync(instance: &mut Instance, ctx: &Context) -> Result<()> {
    let generation = instance.metadata.generation;

    if let Err(e) = check_dependencies(instance, ctx).await {
        let status = instance.status.get_or_insert_with(Default::default);
        status.set_condition(
            CONDITION_DEPENDENCIES_READY,
            false,
            "DependencyError",
            &e.to_string(),
            generation,
        );
        return Err(e);
    }
    instance
        .status
        .get_or_insert_with(Default::default)
        .set_condition(
            CONDITION_DEPENDENCIES_READY,
            true,
            "DependenciesReady",
            "",
            generation,
        );

    resolve_values(&ctx.client, instance).await?;

    if let Err(e) = ctx.applier.apply(instance).await {
        let status = instance.status.get_or_insert_with(Default::default);
        status.set_condition(CONDITION_INSTALLED, false, "Failed", &e.to_string(), generation);
        return Err(e);
    }
    instance
        .status
        .get_or_insert_with(Default::default)
        .set_condition(CONDITION_INSTALLED, true, "Installed", "", generation);

    register_dynamic_watches(instance, ctx).await;
    sync_status(&ctx.client, &ctx.engine, instance).await?;
    Ok(())
}

/// Existence/phase gate over `spec.dependencies`. Blank fields default to
/// the instance namespace and this controller's own group/version/kind
/// (resolved statically, never from the live object's TypeMeta).
async fn check_dependencies(instance: &Instance, ctx: &Context) -> Result<()> {
    let own_namespace = instance.metadata.namespace.clone().unwrap_or_default();
    for dep in &instance.spec.dependencies {
        if dep.name.is_empty() {
            continue;
        }
        let namespace = if dep.namespace.is_empty() {
            own_namespace.clone()
        } else {
            dep.namespace.clone()
        };
        let (api_version, kind) = if dep.kind.is_empty() {
            (format!("{GROUP_NAME}/v1"), "Instance".to_string())
        } else {
            (dep.api_version.clone(), dep.kind.clone())
        };

        if kind == "Instance" && api_version.starts_with(GROUP_NAME) {
            let api: Api<Instance> = Api::namespaced(ctx.client.clone(), &namespace);
            let target = match api.get_opt(&dep.name).await? {
                Some(target) => target,
                None => {
                    return Err(Error::Dependency {
                        reason: DependencyReason::NotFound,
                        namespace,
                        name: dep.name.clone(),
                    })
                }
            };
            let installed = target
                .status
                .as_ref()
                .is_some_and(|s| s.phase == Some(Phase::Installed));
            if !installed {
                return Err(Error::Dependency {
                    reason: DependencyReason::NotInstalled,
                    namespace,
                    name: dep.name.clone(),
                });
            }
            continue;
        }

        // Arbitrary kinds only need to exist.
        let reference = crate::api::ManagedResource {
            api_version: api_version.clone(),
            kind: kind.clone(),
            namespace: namespace.clone(),
            name: dep.name.clone(),
        };
        let mapper = ctx.engine.rest_mapper().await?;
        let (resource, scope) = mapper.resolve(&reference);
        let api: Api<kube::core::DynamicObject> = match scope {
            kube::discovery::Scope::Namespaced => {
                Api::namespaced_with(ctx.client.clone(), &namespace, &resource)
            }
            kube::discovery::Scope::Cluster => Api::all_with(ctx.client.clone(), &resource),
        };
        if api.get_opt(&dep.name).await?.is_none() {
            return Err(Error::Dependency {
                reason: DependencyReason::NotFound,
                namespace,
                name: dep.name.clone(),
            });
        }
    }
    Ok(())
}

/// Lazily watch every kind present in the managed list so changes to those
/// objects re-trigger reconciliation.
async fn register_dynamic_watches(instance: &Instance, ctx: &Context) {
    let Some(status) = instance.status.as_ref() else {
        return;
    };
    let mut seen = std::collections::HashSet::new();
    for reference in &status.resources {
        let (group, version) = reference.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        if !seen.insert((group.to_string(), version.to_string(), reference.kind.clone())) {
            continue;
        }
        if let Err(e) = ctx.sources.watch(&gvk).await {
            warn!(kind = %reference.kind, "registering dynamic watch: {e}");
        }
    }
}

fn has_finalizer(instance: &Instance) -> bool {
    instance
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|t| t == FINALIZER_NAME))
}

fn add_finalizer(instance: &mut Instance) {
    instance
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER_NAME.to_string());
}

/// Remove our token; true when it was present.
fn remove_finalizer(instance: &mut Instance) -> bool {
    let Some(finalizers) = instance.metadata.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|t| t != FINALIZER_NAME);
    before != finalizers.len()
}

async fn update_finalizers(
    api: &Api<Instance>,
    instance: &Instance,
) -> std::result::Result<(), kube::Error> {
    let name = instance.metadata.name.as_deref().unwrap_or_default();
    let patch = json!({"metadata": {"finalizers": instance.metadata.finalizers}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn patch_status(api: &Api<Instance>, instance: &Instance) -> Result<()> {
    let name = instance.metadata.name.as_deref().unwrap_or_default();
    let patch = json!({"status": instance.status});
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InstanceSpec;

    fn instance() -> Instance {
        let mut instance = Instance::new(
            "demo",
            InstanceSpec {
                url: "file:///tmp".into(),
                ..Default::default()
            },
        );
        instance.metadata.namespace = Some("default".into());
        instance
    }

    #[test]
    fn finalizer_round_trip() {
        let mut inst = instance();
        assert!(!has_finalizer(&inst));
        add_finalizer(&mut inst);
        assert!(has_finalizer(&inst));
        assert!(remove_finalizer(&mut inst));
        assert!(!has_finalizer(&inst));
        assert!(!remove_finalizer(&mut inst));
    }

    #[test]
    fn finalizer_removal_keeps_foreign_tokens() {
        let mut inst = instance();
        inst.metadata.finalizers = Some(vec![
            "other.io/finalizer".to_string(),
            FINALIZER_NAME.to_string(),
        ]);
        assert!(remove_finalizer(&mut inst));
        assert_eq!(
            inst.metadata.finalizers,
            Some(vec!["other.io/finalizer".to_string()])
        );
    }

    #[test]
    fn resource_key_is_namespace_slash_name() {
        assert_eq!(resource_key(&instance()), "default/demo");
    }
}
