//! # Controller
//!
//! Controller setup and the modules it is built from:
//!
//! - `reconciler`: the sync/remove state machine
//! - `resolve`: external references + inline values → final values
//! - `status`: phase aggregation, endpoints and workload states
//! - `expression`: guarded expression evaluation
//! - `dynamic`: lazy watches on managed kinds
//! - `backoff`: per-key retry pacing

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::controller::Controller;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use tracing::{info, warn};

pub mod backoff;
pub mod dynamic;
pub mod expression;
pub mod reconciler;
pub mod resolve;
pub mod status;

use crate::api::{Instance, ValuesFrom};
use crate::apply::engine::ClientApply;
use crate::apply::{ApplierOptions, BundleApplier};
use crate::constants::MAX_CONCURRENT_RECONCILES;
use crate::server::{self, ServerState};
use dynamic::DynamicSources;
use reconciler::{error_policy, reconcile, Context};

/// Runtime options, populated from the CLI flags.
#[derive(Debug, Clone)]
pub struct Options {
    pub metrics_addr: String,
    pub probe_addr: String,
    pub leader_election: bool,
    pub leader_election_id: String,
    pub cache_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        let cache_base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            metrics_addr: ":9090".to_string(),
            probe_addr: ":8081".to_string(),
            leader_election: false,
            leader_election_id: "bundler-leader-election".to_string(),
            cache_dir: cache_base.join("bundler"),
        }
    }
}

/// Build and run the controller until the process is signalled.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    let server_state = Arc::new(ServerState::new());
    server::spawn(&options.metrics_addr, &options.probe_addr, server_state.clone());

    if options.leader_election {
        // Single-replica deployments are the expected topology; election is
        // left to the deployment environment.
        warn!(
            id = %options.leader_election_id,
            "leader election requested but not performed by this build"
        );
    }

    let instances: Api<Instance> = Api::all(client.clone());
    let configmaps: Api<ConfigMap> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());

    let controller = Controller::new(instances, watcher::Config::default()).with_config(
        kube_runtime::controller::Config::default().concurrency(MAX_CONCURRENT_RECONCILES as u16),
    );
    let store = controller.store();
    let sources = Arc::new(DynamicSources::new(client.clone(), store.clone()));
    let trigger = sources.start();

    let controller = controller
        .watches(
            configmaps,
            watcher::Config::default(),
            values_from_mapper(store.clone(), "ConfigMap"),
        )
        .watches(
            secrets,
            watcher::Config::default(),
            values_from_mapper(store.clone(), "Secret"),
        )
        .reconcile_on(trigger)
        .shutdown_on_signal();

    let context = Arc::new(Context {
        client: client.clone(),
        applier: BundleApplier::new(
            client.clone(),
            &ApplierOptions {
                cache_dir: options.cache_dir.clone(),
            },
        ),
        engine: ClientApply::new(client),
        sources,
        store,
        backoffs: Mutex::new(HashMap::new()),
    });

    server_state.set_ready(true);
    info!("starting manager");
    controller
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            if let Err(e) = result {
                tracing::debug!("reconcile dispatch error: {e:?}");
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}

/// Map a ConfigMap/Secret event to the Instances in the same namespace that
/// reference it by kind+name in `spec.valuesFrom`.
fn values_from_mapper<K>(
    store: Store<Instance>,
    kind: &'static str,
) -> impl Fn(K) -> Vec<ObjectRef<Instance>>
where
    K: kube::Resource<DynamicType = ()>,
{
    move |obj: K| {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();
        store
            .state()
            .iter()
            .filter(|instance| {
                instance.metadata.namespace.as_deref() == Some(namespace.as_str())
                    && references_object(&instance.spec.values_from, kind, &name)
            })
            .map(|instance| ObjectRef::from_obj(&**instance))
            .collect()
    }
}

fn references_object(values_from: &[ValuesFrom], kind: &str, name: &str) -> bool {
    values_from
        .iter()
        .any(|r| r.kind.eq_ignore_ascii_case(kind) && r.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_cli_documentation() {
        let options = Options::default();
        assert_eq!(options.metrics_addr, ":9090");
        assert_eq!(options.probe_addr, ":8081");
        assert!(!options.leader_election);
        assert!(options.cache_dir.ends_with("bundler"));
    }

    #[test]
    fn values_from_matching_is_case_insensitive_on_kind() {
        let refs = vec![ValuesFrom {
            kind: "configmap".into(),
            name: "app-values".into(),
            ..Default::default()
        }];
        assert!(references_object(&refs, "ConfigMap", "app-values"));
        assert!(!references_object(&refs, "Secret", "app-values"));
        assert!(!references_object(&refs, "ConfigMap", "other"));
    }
}
