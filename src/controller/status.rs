//! Status computer.
//!
//! Runs after each successful apply: fetches the live managed resources,
//! extracts endpoints and workload states (by expression or by the built-in
//! defaults), honors the pause gate, and aggregates everything into a
//! lifecycle phase and a Ready condition.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::discovery::Scope;
use kube::Client;
use serde_json::Value;
use tracing::error;

use crate::api::instance::state_status;
use crate::api::{
    Endpoint, EndpointKind, Instance, ManagedResource, Phase, State, CONDITION_READY,
};
use crate::apply::engine::{ClientApply, RestMapper};
use crate::constants::{
    ANNOTATION_ENDPOINTS_EXPRESSION, ANNOTATION_STATES_EXPRESSION, NODE_IP_PLACEHOLDER,
};
use crate::controller::expression::{eval_expression, ExpressionData};
use crate::error::Result;

/// Workload classification of an instance's managed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadType {
    /// Only batch workloads (Job/CronJob).
    JobOnly,
    /// At least one long-running workload.
    Workload,
    /// Configuration only.
    Config,
}

const JOB_KINDS: [(&str, &str); 2] = [("batch", "Job"), ("batch", "CronJob")];
const WORKLOAD_KINDS: [(&str, &str); 5] = [
    ("apps", "Deployment"),
    ("apps", "StatefulSet"),
    ("apps", "DaemonSet"),
    ("apps", "ReplicaSet"),
    ("", "Pod"),
];

pub fn detect_workload_type(resources: &[ManagedResource]) -> WorkloadType {
    if resources.is_empty() {
        return WorkloadType::Config;
    }
    let mut has_job = false;
    let mut has_workload = false;
    for reference in resources {
        let group_kind = reference.group_kind();
        if JOB_KINDS.contains(&group_kind) {
            has_job = true;
            continue;
        }
        if WORKLOAD_KINDS.contains(&group_kind) {
            has_workload = true;
        }
    }
    match (has_job, has_workload) {
        (true, false) => WorkloadType::JobOnly,
        (_, true) => WorkloadType::Workload,
        _ => WorkloadType::Config,
    }
}

/// Aggregate phase for job-only instances.
pub fn compute_job_phase(states: &[State]) -> (Phase, bool, String) {
    let mut has_failed = false;
    let mut has_succeeded = false;
    let mut has_running = false;
    let mut has_pending = false;
    for s in states {
        match s.status.as_str() {
            state_status::FAILED => has_failed = true,
            state_status::SUCCEEDED => has_succeeded = true,
            state_status::RUNNING => has_running = true,
            state_status::PENDING => has_pending = true,
            _ => {}
        }
    }
    let all_completed = !has_running && !has_pending;
    if all_completed {
        if has_failed && has_succeeded {
            return (Phase::PartialFailed, false, unhealthy_message(states));
        }
        if has_failed {
            return (Phase::Failed, false, unhealthy_message(states));
        }
        if has_succeeded {
            return (Phase::Succeeded, true, String::new());
        }
    }
    if has_running {
        return (Phase::Running, true, String::new());
    }
    (Phase::Pending, true, String::new())
}

/// Aggregate phase for instances with long-running workloads.
pub fn compute_workload_phase(states: &[State]) -> (Phase, bool, String) {
    let mut has_failed = false;
    let mut has_degraded = false;
    let mut has_pending = false;
    for s in states {
        match s.status.as_str() {
            state_status::FAILED | state_status::ERROR | state_status::CRASH_LOOP_BACK_OFF => {
                has_failed = true
            }
            state_status::DEGRADED | state_status::UPDATING | state_status::SCALING => {
                has_degraded = true
            }
            state_status::PENDING => has_pending = true,
            _ => {}
        }
    }
    if has_failed {
        return (Phase::Failed, false, unhealthy_message(states));
    }
    if has_degraded {
        return (Phase::Degraded, false, unhealthy_message(states));
    }
    if has_pending {
        return (Phase::Unhealthy, false, unhealthy_message(states));
    }
    (Phase::Healthy, true, String::new())
}

fn unhealthy_message(states: &[State]) -> String {
    let messages: Vec<&str> = states
        .iter()
        .filter(|s| !is_state_healthy(&s.status) && !s.message.is_empty())
        .map(|s| s.message.as_str())
        .collect();
    messages.join("\n")
}

fn is_state_healthy(status: &str) -> bool {
    matches!(status, "Running" | "Healthy" | "Active" | "Succeeded")
}

/// The pause gate: `values.global.paused` set to `true` (bool or string).
pub fn is_paused(values: &crate::api::Values) -> bool {
    values
        .get_path(&["global", "paused"])
        .is_some_and(|v| v == &Value::Bool(true) || v == &Value::String("true".into()))
}

/// Default workload states for the supported kinds; other kinds contribute
/// no state.
pub fn default_states(resources: &[Value]) -> Vec<State> {
    let mut states = Vec::new();
    for resource in resources {
        let Some(reference) = ManagedResource::from_object(resource) else {
            continue;
        };
        let state = match reference.group_kind() {
            ("batch", "Job") => job_state(resource),
            ("apps", "Deployment") => replica_state::<Deployment>(resource, "Deployment"),
            ("apps", "StatefulSet") => replica_state::<StatefulSet>(resource, "StatefulSet"),
            ("apps", "DaemonSet") => daemonset_state(resource),
            ("", "Pod") => pod_state(resource),
            _ => continue,
        };
        if let Some(state) = state {
            states.push(state);
        }
    }
    states
}

fn job_state(resource: &Value) -> Option<State> {
    let job: Job = serde_json::from_value(resource.clone()).ok()?;
    let mut state = State {
        name: job.metadata.name.clone().unwrap_or_default(),
        kind: "Job".to_string(),
        ..Default::default()
    };
    for condition in job.status.as_ref().and_then(|s| s.conditions.as_ref()).into_iter().flatten() {
        if condition.type_ == "Complete" && condition.status == "True" {
            state.status = state_status::SUCCEEDED.to_string();
            return Some(state);
        }
        if condition.type_ == "Failed" && condition.status == "True" {
            state.status = state_status::FAILED.to_string();
            state.message = condition.message.clone().unwrap_or_default();
            return Some(state);
        }
    }
    state.status = state_status::RUNNING.to_string();
    Some(state)
}

/// Shared ready-replica comparison for Deployment and StatefulSet.
fn replica_state<T>(resource: &Value, kind: &str) -> Option<State>
where
    T: serde::de::DeserializeOwned,
{
    // Both carry status.readyReplicas / status.replicas; read them from the
    // JSON after a typed parse validated the shape.
    let _typed: T = serde_json::from_value(resource.clone()).ok()?;
    let name = resource
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let ready = resource
        .get("status")
        .and_then(|s| s.get("readyReplicas"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let replicas = resource
        .get("status")
        .and_then(|s| s.get("replicas"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let status = if ready == replicas {
        state_status::RUNNING
    } else {
        state_status::DEGRADED
    };
    Some(State {
        name,
        kind: kind.to_string(),
        status: status.to_string(),
        message: String::new(),
    })
}

fn daemonset_state(resource: &Value) -> Option<State> {
    let ds: DaemonSet = serde_json::from_value(resource.clone()).ok()?;
    let status = ds.status.as_ref();
    let ready = status.map(|s| s.number_ready).unwrap_or(0);
    let desired = status.map(|s| s.desired_number_scheduled).unwrap_or(0);
    Some(State {
        name: ds.metadata.name.clone().unwrap_or_default(),
        kind: "DaemonSet".to_string(),
        status: if ready == desired {
            state_status::RUNNING.to_string()
        } else {
            state_status::DEGRADED.to_string()
        },
        message: String::new(),
    })
}

fn pod_state(resource: &Value) -> Option<State> {
    let pod: k8s_openapi::api::core::v1::Pod = serde_json::from_value(resource.clone()).ok()?;
    let mut state = State {
        name: pod.metadata.name.clone().unwrap_or_default(),
        kind: "Pod".to_string(),
        ..Default::default()
    };
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();
    state.status = match phase {
        "Succeeded" => state_status::SUCCEEDED.to_string(),
        "Failed" => {
            state.message = pod
                .status
                .as_ref()
                .and_then(|s| s.message.clone())
                .unwrap_or_default();
            state_status::FAILED.to_string()
        }
        "Running" => state_status::RUNNING.to_string(),
        _ => state_status::PENDING.to_string(),
    };
    Some(state)
}

/// Default endpoints from Ingresses and Services.
pub fn default_endpoints(resources: &[Value]) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    for resource in resources {
        let Some(reference) = ManagedResource::from_object(resource) else {
            continue;
        };
        if reference.api_version == "networking.k8s.io/v1" && reference.kind == "Ingress" {
            if let Ok(ingress) = serde_json::from_value::<Ingress>(resource.clone()) {
                endpoints.extend(ingress_endpoints(&ingress));
            }
            continue;
        }
        if reference.api_version == "v1" && reference.kind == "Service" {
            if let Ok(service) = serde_json::from_value::<Service>(resource.clone()) {
                endpoints.extend(service_endpoints(&service));
            }
        }
    }
    endpoints
}

fn ingress_endpoints(ingress: &Ingress) -> Vec<Endpoint> {
    let name = ingress.metadata.name.clone().unwrap_or_default();
    let spec = ingress.spec.as_ref();
    let has_tls = spec.and_then(|s| s.tls.as_ref()).is_some_and(|t| !t.is_empty());
    let scheme = if has_tls { "https" } else { "http" };
    spec.and_then(|s| s.rules.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|rule| rule.host.as_deref())
        .filter(|host| !host.is_empty())
        .map(|host| Endpoint {
            name: name.clone(),
            url: format!("{scheme}://{host}"),
            urls: Vec::new(),
            kind: Some(EndpointKind::External),
        })
        .collect()
}

fn service_endpoints(service: &Service) -> Vec<Endpoint> {
    let Some(spec) = service.spec.as_ref() else {
        return Vec::new();
    };
    let Some(ports) = spec.ports.as_ref() else {
        return Vec::new();
    };
    let service_name = service.metadata.name.clone().unwrap_or_default();
    let namespace = service.metadata.namespace.clone().unwrap_or_default();
    let service_type = spec.type_.as_deref().unwrap_or("ClusterIP");

    let mut endpoints = Vec::new();
    for port in ports {
        // metrics ports are not user endpoints
        if port.port == 9000 || port.port == 9090 {
            continue;
        }
        let mut name = service_name.clone();
        if let Some(port_name) = port.name.as_deref().filter(|n| !n.is_empty()) {
            name = format!("{name}-{port_name}");
        }
        let scheme = port_scheme(port);

        match service_type {
            "LoadBalancer" => {
                let ingresses = service
                    .status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.as_ref());
                for ingress in ingresses.into_iter().flatten() {
                    let host = ingress
                        .hostname
                        .as_deref()
                        .filter(|h| !h.is_empty())
                        .or(ingress.ip.as_deref())
                        .unwrap_or_default();
                    endpoints.push(Endpoint {
                        name: name.clone(),
                        url: format!("{scheme}://{host}:{}", port.port),
                        urls: Vec::new(),
                        kind: Some(EndpointKind::External),
                    });
                }
            }
            "NodePort" => {
                let node_port = port.node_port.unwrap_or_default();
                endpoints.push(Endpoint {
                    name: name.clone(),
                    url: format!("{scheme}://{NODE_IP_PLACEHOLDER}:{node_port}"),
                    urls: Vec::new(),
                    kind: Some(EndpointKind::Internal),
                });
            }
            "ClusterIP" => {
                endpoints.push(Endpoint {
                    name: name.clone(),
                    url: format!("{scheme}://{service_name}.{namespace}:{}", port.port),
                    urls: Vec::new(),
                    kind: Some(EndpointKind::Cluster),
                });
            }
            // ExternalName services resolve outside the cluster; nothing to emit.
            _ => {}
        }
    }
    endpoints
}

/// Scheme resolution order: appProtocol, port-name substring, well-known
/// port number, then `tcp`.
pub fn port_scheme(port: &ServicePort) -> String {
    if let Some(protocol) = port.app_protocol.as_deref().filter(|p| !p.is_empty()) {
        return protocol.to_lowercase();
    }
    if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
        if name.contains("https") {
            return "https".to_string();
        }
        if name.contains("http") {
            return "http".to_string();
        }
    }
    match port.port {
        80 | 8080 => "http".to_string(),
        443 => "https".to_string(),
        _ => "tcp".to_string(),
    }
}

/// Fetch the live objects named by the managed list; missing objects are
/// silently omitted.
pub async fn fetch_live_resources(
    client: &Client,
    mapper: &RestMapper,
    references: &[ManagedResource],
) -> Vec<Value> {
    let mut resources = Vec::new();
    for reference in references {
        let (resource, scope) = mapper.resolve(reference);
        let api: Api<DynamicObject> = match scope {
            Scope::Namespaced => {
                Api::namespaced_with(client.clone(), &reference.namespace, &resource)
            }
            Scope::Cluster => Api::all_with(client.clone(), &resource),
        };
        let Ok(Some(live)) = api.get_opt(&reference.name).await else {
            continue;
        };
        if let Ok(value) = serde_json::to_value(&live) {
            resources.push(value);
        }
    }
    resources
}

fn expression_states(expr: &str, data: &ExpressionData) -> Vec<State> {
    match eval_expression(expr, data) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<State>(item).ok())
            .collect(),
        Ok(other) => {
            error!(expression = expr, result = %other, "states expression result is not a list");
            Vec::new()
        }
        Err(e) => {
            error!(expression = expr, "evaluate states expression failed: {e:#}");
            Vec::new()
        }
    }
}

fn expression_endpoints(expr: &str, data: &ExpressionData) -> Vec<Endpoint> {
    match eval_expression(expr, data) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<Endpoint>(item).ok())
            .filter(|e| !e.url.is_empty())
            .collect(),
        Ok(other) => {
            error!(expression = expr, result = %other, "endpoints expression result is not a list");
            Vec::new()
        }
        Err(e) => {
            error!(expression = expr, "evaluate endpoints expression failed: {e:#}");
            Vec::new()
        }
    }
}

/// Populate phase, endpoints, states and the Ready condition after a
/// successful apply.
pub async fn sync_status(client: &Client, engine: &ClientApply, instance: &mut Instance) -> Result<()> {
    let references = instance
        .status
        .as_ref()
        .map(|s| s.resources.clone())
        .unwrap_or_default();
    let mapper = engine.rest_mapper().await?;
    let resources = fetch_live_resources(client, &mapper, &references).await;

    let generation = instance.metadata.generation;
    let annotations = instance.metadata.annotations.clone().unwrap_or_default();
    let data = ExpressionData {
        instance: serde_json::to_value(&*instance).unwrap_or_default(),
        resources: resources.clone(),
        values: instance
            .status
            .as_ref()
            .map(|s| s.values.0.clone())
            .unwrap_or_default(),
    };

    let status = instance.status.get_or_insert_with(Default::default);
    status.endpoints = match annotations.get(ANNOTATION_ENDPOINTS_EXPRESSION) {
        Some(expr) if !expr.is_empty() => expression_endpoints(expr, &data),
        _ => default_endpoints(&resources),
    };
    status.states = match annotations.get(ANNOTATION_STATES_EXPRESSION) {
        Some(expr) if !expr.is_empty() => expression_states(expr, &data),
        _ => default_states(&resources),
    };

    if is_paused(&status.values) {
        status.phase = Some(Phase::Paused);
        status.message = String::new();
        status.set_condition(
            CONDITION_READY,
            false,
            "Paused",
            "Instance is paused",
            generation,
        );
        return Ok(());
    }

    let (phase, ready, message) = match detect_workload_type(&status.resources) {
        WorkloadType::JobOnly => compute_job_phase(&status.states),
        WorkloadType::Workload => compute_workload_phase(&status.states),
        WorkloadType::Config => (Phase::Installed, true, String::new()),
    };
    status.phase = Some(phase);
    status.message = message.clone();
    if ready {
        status.set_condition(CONDITION_READY, true, phase.as_str(), "", generation);
    } else {
        status.set_condition(CONDITION_READY, false, phase.as_str(), &message, generation);
    }
    Ok(())
}
