//! End-to-end execution scenarios over the built-in node library.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use trellis_core::node::{Node, PortDefinition, ProcessContext};
use trellis_core::registry::{build_default_registry, register_builtin_nodes, NodeRegistry};
use trellis_core::{
    execute, EngineError, ExecutorOptions, NodeStatus, PortType, RunReport, RunStatus,
    WorkflowGraph,
};

fn graph_from(value: Value) -> WorkflowGraph {
    serde_json::from_value(value).expect("graph should deserialize")
}

async fn run_default(value: Value) -> RunReport {
    let registry = Arc::new(build_default_registry());
    execute(&graph_from(value), registry, ExecutorOptions::default())
        .await
        .expect("run should produce a report")
}

/// Every edge's source finished before its target started.
fn assert_topological_respect(report: &RunReport, edges: &[(&str, &str)]) {
    for (from, to) in edges {
        let from_finished = report.nodes[*from]
            .finished_at
            .expect("source node should have finished");
        let to_started = report.nodes[*to]
            .started_at
            .expect("target node should have started");
        assert!(
            from_finished <= to_started,
            "edge ({from}, {to}) violated topological order"
        );
    }
}

// ─── Scenario 1: linear pipeline ─────────────────────────────────────────────

#[tokio::test]
async fn test_linear_text_pipeline() {
    let report = run_default(json!({
        "nodes": {
            "textInput": { "type": "TextInput", "inputs": { "text": "  hi  " } },
            "strip": { "type": "TextStrip", "inputs": {} },
            "toList": { "type": "TextToList", "inputs": { "format": "delimited", "delimiter": "," } }
        },
        "connections": [
            { "from_node": "textInput", "from_port": "text", "to_node": "strip", "to_port": "text" },
            { "from_node": "strip", "from_port": "text", "to_node": "toList", "to_port": "text" }
        ]
    }))
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output("toList", "list"), Some(&json!(["hi"])));
    for node_id in ["textInput", "strip", "toList"] {
        assert_eq!(report.node_status(node_id), Some(NodeStatus::Done));
    }
    assert_topological_respect(&report, &[("textInput", "strip"), ("strip", "toList")]);
}

// ─── Scenario 2: diamond ─────────────────────────────────────────────────────

fn diamond_graph() -> Value {
    json!({
        "nodes": {
            "a": { "type": "Constant", "inputs": { "type": "number", "value": 3 } },
            "b": { "type": "MathOperation", "inputs": { "b": 2, "operation": "multiply" } },
            "c": { "type": "MathOperation", "inputs": { "b": 10, "operation": "add" } },
            "d": { "type": "MathOperation", "inputs": { "operation": "add" } }
        },
        "connections": [
            { "from_node": "a", "from_port": "value", "to_node": "b", "to_port": "a" },
            { "from_node": "a", "from_port": "value", "to_node": "c", "to_port": "a" },
            { "from_node": "b", "from_port": "result", "to_node": "d", "to_port": "a" },
            { "from_node": "c", "from_port": "result", "to_node": "d", "to_port": "b" }
        ]
    })
}

#[tokio::test]
async fn test_diamond_combines_branches() {
    let report = run_default(diamond_graph()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output("d", "result"), Some(&json!(19)));
    assert_topological_respect(
        &report,
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    );
}

#[tokio::test]
async fn test_diamond_results_are_deterministic() {
    let first = run_default(diamond_graph()).await;
    let second = run_default(diamond_graph()).await;

    assert_eq!(first.results, second.results);
}

struct SlowDoubleNode;

#[async_trait::async_trait]
impl Node for SlowDoubleNode {
    fn node_type(&self) -> &str {
        "slow_double"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("in", PortType::Number)]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("out", PortType::Number)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> anyhow::Result<HashMap<String, Value>> {
        let value = inputs
            .get("in")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("expected number on port 'in'"))?;
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(HashMap::from([("out".to_string(), json!(value * 2))]))
    }
}

/// Sibling branches of a diamond run concurrently: with two 80ms nodes,
/// their running windows must overlap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diamond_siblings_run_concurrently() {
    let mut registry = NodeRegistry::new();
    register_builtin_nodes(&mut registry);
    registry.register("slow_double", "test", |_| Ok(Box::new(SlowDoubleNode)));

    let graph = graph_from(json!({
        "nodes": {
            "a": { "type": "Constant", "inputs": { "type": "number", "value": 3 } },
            "b": { "type": "slow_double", "inputs": {} },
            "c": { "type": "slow_double", "inputs": {} }
        },
        "connections": [
            { "from_node": "a", "from_port": "value", "to_node": "b", "to_port": "in" },
            { "from_node": "a", "from_port": "value", "to_node": "c", "to_port": "in" }
        ]
    }));

    let report = execute(&graph, Arc::new(registry), ExecutorOptions::default())
        .await
        .expect("diamond should execute");
    assert_eq!(report.status, RunStatus::Completed);

    let b = &report.nodes["b"];
    let c = &report.nodes["c"];
    let b_window = (b.started_at.unwrap(), b.finished_at.unwrap());
    let c_window = (c.started_at.unwrap(), c.finished_at.unwrap());
    assert!(
        b_window.0 < c_window.1 && c_window.0 < b_window.1,
        "sibling running windows should overlap"
    );
}

// ─── Scenario 3: Switch + Merge ──────────────────────────────────────────────

#[tokio::test]
async fn test_switch_then_merge_selects_matching_branch() {
    let report = run_default(json!({
        "nodes": {
            "switch": {
                "type": "Switch",
                "inputs": {
                    "data": { "type": "image" },
                    "output_count": 2,
                    "rules": [
                        { "field": "type", "operator": "equals", "value": "text", "output_index": 0 },
                        { "field": "type", "operator": "equals", "value": "image", "output_index": 1 }
                    ]
                }
            },
            "merge": { "type": "Merge", "inputs": { "input_count": 3 } }
        },
        "connections": [
            { "from_node": "switch", "from_port": "output_0", "to_node": "merge", "to_port": "input_0" },
            { "from_node": "switch", "from_port": "output_1", "to_node": "merge", "to_port": "input_1" },
            { "from_node": "switch", "from_port": "fallback", "to_node": "merge", "to_port": "input_2" }
        ]
    }))
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output("merge", "selected_index"), Some(&json!(1)));
    assert_eq!(
        report.output("merge", "output"),
        Some(&json!({"type": "image"}))
    );

    // first_match exclusivity: exactly one of output_* / fallback emitted.
    let switch_outputs = report
        .results
        .get("switch")
        .expect("switch should have outputs");
    assert_eq!(switch_outputs.len(), 1);
    assert!(switch_outputs.contains_key("output_1"));
}

// ─── Scenario 8: missing required input ──────────────────────────────────────

#[tokio::test]
async fn test_missing_required_input_fails_before_dispatch() {
    let registry = Arc::new(build_default_registry());
    let graph = graph_from(json!({
        "nodes": {
            "x": { "type": "TextStrip", "inputs": {} },
            "downstream": { "type": "TextStrip", "inputs": {} }
        },
        "connections": [
            { "from_node": "x", "from_port": "text", "to_node": "downstream", "to_port": "text" }
        ]
    }));

    let err = execute(&graph, registry, ExecutorOptions::default())
        .await
        .expect_err("unsatisfiable required input should fail the run");

    match err {
        EngineError::MissingRequiredInput { node, port } => {
            assert_eq!(node, "x");
            assert_eq!(port, "text");
        }
        other => panic!("expected MissingRequiredInput, got {other}"),
    }
}

// ─── Scenario 7: cancellation mid-run ────────────────────────────────────────

struct SlowNode;

#[async_trait::async_trait]
impl Node for SlowNode {
    fn node_type(&self) -> &str {
        "slow"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("out", PortType::String)]
    }

    async fn process(
        &mut self,
        _inputs: &HashMap<String, Value>,
        ctx: &ProcessContext,
    ) -> anyhow::Result<HashMap<String, Value>> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                Ok(HashMap::from([("out".to_string(), json!("late"))]))
            }
            _ = ctx.cancel.cancelled() => Ok(HashMap::new()),
        }
    }
}

#[tokio::test]
async fn test_cancellation_preserves_completed_work() {
    let mut registry = NodeRegistry::new();
    register_builtin_nodes(&mut registry);
    registry.register("slow", "test", |_| Ok(Box::new(SlowNode)));
    let registry = Arc::new(registry);

    let graph = graph_from(json!({
        "nodes": {
            "quick": { "type": "TextInput", "inputs": { "text": "done" } },
            "long": { "type": "slow", "inputs": {} }
        },
        "connections": []
    }));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = tokio::spawn(async move {
        execute(
            &graph,
            registry,
            ExecutorOptions {
                cancel: run_cancel,
                ..Default::default()
            },
        )
        .await
    });

    // Let the quick branch finish, then cancel while the long branch is
    // still running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancel_instant = Instant::now();
    cancel.cancel();

    let report = run
        .await
        .expect("run task should join")
        .expect("run should produce a report");

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.output("quick", "text"), Some(&json!("done")));
    assert!(
        report.results.get("long").is_none(),
        "cancelled node must not publish outputs"
    );

    // Cancellation finality: nothing entered running after the cancel.
    for (node_id, record) in &report.nodes {
        if let Some(started_at) = record.started_at {
            assert!(
                started_at < cancel_instant,
                "node {node_id} started after cancellation"
            );
        }
        assert_ne!(record.status, NodeStatus::Running);
    }
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let registry = Arc::new(build_default_registry());
    let graph = graph_from(json!({
        "nodes": {
            "src": { "type": "TextInput", "inputs": { "text": "x" } }
        },
        "connections": []
    }));

    let cancel = CancellationToken::new();
    cancel.cancel();
    cancel.cancel();

    let report = execute(
        &graph,
        registry,
        ExecutorOptions {
            cancel,
            ..Default::default()
        },
    )
    .await
    .expect("run should produce a report");
    assert_eq!(report.status, RunStatus::Cancelled);
}

// ─── Invariants ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connection_overrides_constant_input() {
    let report = run_default(json!({
        "nodes": {
            "three": { "type": "Constant", "inputs": { "type": "number", "value": 3 } },
            "probe": { "type": "MathOperation", "inputs": { "a": 100, "b": 1, "operation": "add" } }
        },
        "connections": [
            { "from_node": "three", "from_port": "value", "to_node": "probe", "to_port": "a" }
        ]
    }))
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.output("probe", "result"),
        Some(&json!(4)),
        "the connected value must win over the constant"
    );
}

#[tokio::test]
async fn test_cycle_rejected_before_any_node_runs() {
    let registry = Arc::new(build_default_registry());
    let graph = graph_from(json!({
        "nodes": {
            "a": { "type": "TextStrip", "inputs": {} },
            "b": { "type": "TextStrip", "inputs": {} }
        },
        "connections": [
            { "from_node": "a", "from_port": "text", "to_node": "b", "to_port": "text" },
            { "from_node": "b", "from_port": "text", "to_node": "a", "to_port": "text" }
        ]
    }));

    let err = execute(&graph, registry, ExecutorOptions::default())
        .await
        .expect_err("cyclic graph should fail before execution");
    assert!(matches!(err, EngineError::CyclicGraph { .. }));
}

#[tokio::test]
async fn test_result_store_holds_exactly_the_done_nodes() {
    let report = run_default(diamond_graph()).await;

    let done_nodes: Vec<&String> = report
        .nodes
        .iter()
        .filter(|(_, record)| record.status == NodeStatus::Done)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(report.results.len(), done_nodes.len());
    for node_id in done_nodes {
        assert!(report.results.contains_key(node_id));
    }
}

#[tokio::test]
async fn test_failure_skips_downstream_and_reports_first_error() {
    let report = run_default(json!({
        "nodes": {
            "bad_math": { "type": "MathOperation", "inputs": { "a": 1, "b": 0, "operation": "divide" } },
            "after": { "type": "MathOperation", "inputs": { "b": 1, "operation": "add" } }
        },
        "connections": [
            { "from_node": "bad_math", "from_port": "result", "to_node": "after", "to_port": "a" }
        ]
    }))
    .await;

    assert_eq!(report.status, RunStatus::Error);
    let error = report.error.as_ref().expect("run should report an error");
    assert_eq!(error.node_id, "bad_math");
    assert!(error.message.contains("division by zero"));
    assert_eq!(report.node_status("after"), Some(NodeStatus::Skipped));
}
