use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::graph::{NodeSpec, RouteIndex, WorkflowGraph};
use crate::node::{Node, ProcessContext};
use crate::registry::NodeRegistry;
use crate::resolve::resolve_effective_inputs;
use crate::run::{NodeRecord, NodeStatus, RunError, RunReport, RunStatus};

/// Per-run knobs for [`execute`].
pub struct ExecutorOptions {
    pub run_id: Option<String>,
    /// External cancellation signal. The executor derives a run-local child
    /// token from it, so a node failure cancels this run without touching
    /// the caller's token.
    pub cancel: CancellationToken,
    pub nesting_depth: u32,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            cancel: CancellationToken::new(),
            nesting_depth: 0,
        }
    }
}

impl ExecutorOptions {
    /// Options for a child run driven from inside a node's `process()`.
    pub fn child_of(ctx: &ProcessContext) -> Self {
        let child = ctx.child();
        Self {
            run_id: None,
            cancel: child.cancel,
            nesting_depth: child.nesting_depth,
        }
    }
}

/// Execute a workflow graph to completion.
///
/// Level-parallel: a node is dispatched the moment every one of its
/// inbound edges has delivered, each on its own task. The scheduler owns
/// the result store; tasks only return their outputs, so every node's
/// entry is written exactly once and is fully visible before any successor
/// is dispatched.
///
/// Returns `Err` only when the graph fails validation before anything
/// runs. Node failures and cancellation are reported through the
/// [`RunReport`] status: the first failure trips the run-local cancel
/// token, no further nodes are dispatched, in-flight nodes are drained and
/// their outputs discarded.
pub async fn execute(
    graph: &WorkflowGraph,
    registry: Arc<NodeRegistry>,
    options: ExecutorOptions,
) -> Result<RunReport, EngineError> {
    graph.validate(&registry)?;

    let run_id = options
        .run_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let external = options.cancel;
    let run_cancel = external.child_token();

    let mut records: HashMap<String, NodeRecord> = graph
        .nodes()
        .map(|spec| (spec.id.clone(), NodeRecord::pending()))
        .collect();
    let mut results: HashMap<String, HashMap<String, Value>> = HashMap::new();
    let mut first_error: Option<RunError> = None;

    if external.is_cancelled() {
        for record in records.values_mut() {
            record.mark(NodeStatus::Skipped);
        }
        return Ok(RunReport {
            run_id,
            status: RunStatus::Cancelled,
            results,
            nodes: records,
            error: None,
        });
    }

    let routes = graph.route_index();
    let mut in_degrees = graph.in_degrees();
    let mut ready: VecDeque<_> = graph.source_nodes().into();

    let ctx = ProcessContext {
        cancel: run_cancel.clone(),
        registry: Arc::clone(&registry),
        nesting_depth: options.nesting_depth,
    };

    let mut join_set: JoinSet<(String, anyhow::Result<HashMap<String, Value>>)> = JoinSet::new();
    let mut task_node_ids: HashMap<tokio::task::Id, String> = HashMap::new();

    debug!(%run_id, nodes = records.len(), "run started");

    loop {
        if first_error.is_none() && !run_cancel.is_cancelled() {
            while let Some(idx) = ready.pop_front() {
                let spec = graph.node(idx);
                match prepare_dispatch(spec, &registry, &routes, &results) {
                    Ok((node, inputs)) => {
                        debug!(%run_id, node_id = %spec.id, node_type = %spec.node_type, "node dispatched");
                        records
                            .get_mut(&spec.id)
                            .expect("dispatched node should have a record")
                            .mark_running();

                        let node_id = spec.id.clone();
                        let task_ctx = ctx.clone();
                        let handle = join_set.spawn(async move {
                            let mut node = node;
                            let outputs = node.process(&inputs, &task_ctx).await;
                            (node_id, outputs)
                        });
                        task_node_ids.insert(handle.id(), spec.id.clone());
                    }
                    Err(err) => {
                        warn!(%run_id, node_id = %spec.id, error = %err, "node failed at dispatch");
                        records
                            .get_mut(&spec.id)
                            .expect("dispatched node should have a record")
                            .mark(NodeStatus::Failed);
                        first_error = Some(RunError {
                            node_id: spec.id.clone(),
                            message: err.to_string(),
                        });
                        run_cancel.cancel();
                        break;
                    }
                }
            }
        }

        if join_set.is_empty() {
            break;
        }

        // External cancellation propagates through the child token, so the
        // dispatch guard above stops launching and in-flight nodes observe
        // it cooperatively; all that is left here is to drain completions.
        let Some(joined) = join_set.join_next().await else {
            break;
        };

        match joined {
            Ok((node_id, Ok(outputs))) => {
                task_node_ids.retain(|_, id| *id != node_id);
                let record = records
                    .get_mut(&node_id)
                    .expect("completed node should have a record");
                record.mark(NodeStatus::Done);

                if first_error.is_some() || run_cancel.is_cancelled() {
                    // Run is winding down; outputs of stragglers are
                    // discarded and successors stay undispatched.
                    debug!(%run_id, %node_id, "node completed after shutdown, outputs discarded");
                    continue;
                }

                debug!(%run_id, %node_id, "node completed");
                let idx = graph
                    .index_of(&node_id)
                    .expect("completed node should exist in graph");
                results.insert(node_id, outputs);

                for (successor, _) in graph.connections_from(idx) {
                    let degree = in_degrees
                        .get_mut(&successor)
                        .expect("successor should have an in-degree entry");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(successor);
                    }
                }
            }
            Ok((node_id, Err(source))) => {
                task_node_ids.retain(|_, id| *id != node_id);
                let err = EngineError::NodeProcess {
                    node: node_id.clone(),
                    source,
                };
                warn!(%run_id, %node_id, error = %err, "node failed");
                records
                    .get_mut(&node_id)
                    .expect("failed node should have a record")
                    .mark(NodeStatus::Failed);

                // A failure after external cancellation is a casualty of
                // the cancel, not the run's reported error.
                if first_error.is_none() && !external.is_cancelled() {
                    first_error = Some(RunError {
                        node_id,
                        message: err.to_string(),
                    });
                    run_cancel.cancel();
                }
            }
            Err(join_err) => {
                let node_id = task_node_ids.remove(&join_err.id()).unwrap_or_default();
                warn!(%run_id, %node_id, error = %join_err, "node task aborted");
                if let Some(record) = records.get_mut(&node_id) {
                    record.mark(NodeStatus::Failed);
                }
                if first_error.is_none() && !external.is_cancelled() {
                    first_error = Some(RunError {
                        node_id,
                        message: format!("node task aborted: {join_err}"),
                    });
                    run_cancel.cancel();
                }
            }
        }
    }

    for record in records.values_mut() {
        if record.status == NodeStatus::Pending {
            record.mark(NodeStatus::Skipped);
        }
    }

    let status = if first_error.is_some() {
        RunStatus::Error
    } else if external.is_cancelled() {
        RunStatus::Cancelled
    } else if records
        .values()
        .all(|record| record.status == NodeStatus::Done)
    {
        RunStatus::Completed
    } else {
        RunStatus::Cancelled
    };

    info!(%run_id, ?status, "run finished");

    Ok(RunReport {
        run_id,
        status,
        results,
        nodes: records,
        error: first_error,
    })
}

/// Instantiate a node and compute its effective inputs. Failure here is the
/// node's failure, surfaced at dispatch time.
fn prepare_dispatch(
    spec: &NodeSpec,
    registry: &NodeRegistry,
    routes: &RouteIndex,
    results: &HashMap<String, HashMap<String, Value>>,
) -> Result<(Box<dyn Node>, HashMap<String, Value>), EngineError> {
    let node = registry
        .create(&spec.node_type, &spec.input_values)
        .map_err(|e| {
            EngineError::GraphValidation(format!(
                "failed to instantiate node '{}' of type '{}': {e:#}",
                spec.id, spec.node_type
            ))
        })?;

    let inputs = resolve_effective_inputs(
        spec,
        &node.input_ports(),
        routes.inbound(&spec.id),
        results,
    )?;

    Ok((node, inputs))
}
