//! Unit tests for status computation: phase aggregation, the pause gate
//! and expression-driven endpoints, exercised without a cluster.

use bundler::api::{Phase, State, Values};
use bundler::controller::expression::{eval_expression, ExpressionData};
use bundler::controller::status::{
    compute_job_phase, compute_workload_phase, is_paused,
};
use serde_json::json;

fn state(status: &str) -> State {
    State {
        name: "w".into(),
        kind: "Deployment".into(),
        status: status.into(),
        message: String::new(),
    }
}

#[test]
fn job_and_workload_phases_are_deterministic_and_total() {
    let statuses = [
        "Pending",
        "Running",
        "Succeeded",
        "Failed",
        "Degraded",
        "Updating",
        "Scaling",
        "CrashLoopBackOff",
        "Error",
        "Unknown",
        "something-else",
    ];
    for a in &statuses {
        for b in &statuses {
            let states = vec![state(a), state(b)];
            let first = compute_job_phase(&states);
            let second = compute_job_phase(&states);
            assert_eq!(first, second);
            let first = compute_workload_phase(&states);
            let second = compute_workload_phase(&states);
            assert_eq!(first, second);
        }
    }
}

#[test]
fn workload_failure_beats_degradation() {
    let (phase, ready, _) =
        compute_workload_phase(&[state("Degraded"), state("Error"), state("Running")]);
    assert_eq!(phase, Phase::Failed);
    assert!(!ready);
}

#[test]
fn jobs_mixing_success_and_failure_are_partial() {
    let (phase, ready, _) = compute_job_phase(&[state("Succeeded"), state("Failed")]);
    assert_eq!(phase, Phase::PartialFailed);
    assert!(!ready);
}

#[test]
fn pause_gate_accepts_bool_and_string() {
    let paused: Values = serde_json::from_value(json!({"global": {"paused": true}})).unwrap();
    assert!(is_paused(&paused));
    let paused: Values = serde_json::from_value(json!({"global": {"paused": "true"}})).unwrap();
    assert!(is_paused(&paused));
    let not_paused: Values = serde_json::from_value(json!({"global": {"paused": false}})).unwrap();
    assert!(!is_paused(&not_paused));
    let empty: Values = serde_json::from_value(json!({})).unwrap();
    assert!(!is_paused(&empty));
}

#[test]
fn endpoints_expression_yields_configured_list() {
    let data = ExpressionData {
        instance: json!({"metadata": {"name": "demo"}}),
        resources: vec![],
        values: Default::default(),
    };
    let result = eval_expression("[{'name':'x','url':'http://x'}]", &data).unwrap();
    assert_eq!(result, json!([{"name": "x", "url": "http://x"}]));
}

#[test]
fn states_expression_reads_live_resources() {
    let data = ExpressionData {
        instance: json!({"metadata": {"name": "demo"}}),
        resources: vec![json!({
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "status": {"readyReplicas": 2},
        })],
        values: Default::default(),
    };
    let result = eval_expression(
        "[{'name': resources[0].metadata.name, 'status': 'Running'}]",
        &data,
    )
    .unwrap();
    assert_eq!(result, json!([{"name": "web", "status": "Running"}]));
}
