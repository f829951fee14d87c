use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::executor::{execute, ExecutorOptions};
use crate::graph::WorkflowGraph;
use crate::node::{Node, PortDefinition, ProcessContext, MAX_NESTING_DEPTH};
use crate::nodes::foreach_item::FOREACH_ITEM_TYPE;
use crate::run::{RunReport, RunStatus};
use crate::types::{value_kind, PortType};

/// Concurrency cap applied when `parallel=true` and no `max_workers` is
/// given: `min(items.len(), DEFAULT_MAX_WORKERS)`.
pub const DEFAULT_MAX_WORKERS: usize = 64;

/// Fan-out engine: materializes and runs one fresh sub-graph per input
/// item, injecting the item, its index, and the shared globals into every
/// `ForEachItem` node of that iteration's graph.
///
/// The node itself succeeds even when iterations fail: partial work is
/// always reported through `success_count`/`error_count`/`errors`, and
/// `continue_on_error=false` merely stops starting new iterations.
pub struct ForEachNode;

impl ForEachNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ForEachNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for ForEachNode {
    fn node_type(&self) -> &str {
        "ForEach"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("items", PortType::Array),
            PortDefinition::required("sub_workflow", PortType::Object),
            PortDefinition::required("result_node_id", PortType::String),
            PortDefinition::required("result_port_name", PortType::String),
            PortDefinition::with_default("parallel", PortType::Boolean, json!(false)),
            PortDefinition::optional("max_workers", PortType::Number),
            PortDefinition::with_default("continue_on_error", PortType::Boolean, json!(true)),
            PortDefinition::optional("max_iterations", PortType::Number),
            PortDefinition::with_default("global_vars", PortType::Object, json!({})),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("results", PortType::Array),
            PortDefinition::required("sub_workflow_results", PortType::Array),
            PortDefinition::optional("item_value", PortType::Any),
            PortDefinition::required("current_index", PortType::Number),
            PortDefinition::required("total_count", PortType::Number),
            PortDefinition::required("success_count", PortType::Number),
            PortDefinition::required("error_count", PortType::Number),
            PortDefinition::required("errors", PortType::Array),
        ]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        if ctx.nesting_depth >= MAX_NESTING_DEPTH {
            bail!("ForEach: maximum nesting depth ({MAX_NESTING_DEPTH}) exceeded");
        }

        let items = match inputs.get("items") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(EngineError::InvalidItems(value_kind(other).to_string()).into())
            }
            None => return Err(EngineError::InvalidItems("null".to_string()).into()),
        };

        // The sub-workflow is validated once; every iteration reuses the
        // validated description.
        let template = parse_sub_workflow(inputs.get("sub_workflow"), &ctx.registry)?;

        let result_node_id = require_str(inputs, "result_node_id")?;
        let result_port_name = require_str(inputs, "result_port_name")?;
        check_result_port(&template, &result_node_id, &result_port_name, ctx)?;

        let effective_count = match inputs.get("max_iterations").and_then(Value::as_u64) {
            Some(cap) => items.len().min(cap as usize),
            None => items.len(),
        };

        let parallel = inputs
            .get("parallel")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let continue_on_error = inputs
            .get("continue_on_error")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let global_vars = inputs.get("global_vars").cloned().unwrap_or(json!({}));

        let workers = if parallel {
            inputs
                .get("max_workers")
                .and_then(Value::as_u64)
                .map(|w| (w as usize).max(1))
                .unwrap_or_else(|| effective_count.clamp(1, DEFAULT_MAX_WORKERS))
        } else {
            1
        };

        debug!(
            total = effective_count,
            parallel, workers, continue_on_error, "foreach fan-out started"
        );

        let mut collector = IterationCollector::new(effective_count);

        if parallel {
            run_parallel(
                &template,
                &items[..effective_count],
                &global_vars,
                workers,
                continue_on_error,
                ctx,
                &result_node_id,
                &result_port_name,
                &mut collector,
            )
            .await;
        } else {
            run_sequential(
                &template,
                &items[..effective_count],
                &global_vars,
                continue_on_error,
                ctx,
                &result_node_id,
                &result_port_name,
                &mut collector,
            )
            .await;
        }

        Ok(collector.into_outputs(effective_count))
    }
}

fn parse_sub_workflow(
    raw: Option<&Value>,
    registry: &Arc<crate::registry::NodeRegistry>,
) -> Result<WorkflowGraph> {
    let raw = raw.ok_or_else(|| {
        EngineError::InvalidSubWorkflow("input 'sub_workflow' is required".to_string())
    })?;

    let template: WorkflowGraph = serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::InvalidSubWorkflow(format!("failed to parse: {e}")))?;

    template
        .validate(registry)
        .map_err(|e| EngineError::InvalidSubWorkflow(e.to_string()))?;

    Ok(template)
}

fn require_str(inputs: &HashMap<String, Value>, name: &str) -> Result<String> {
    match inputs.get(name).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => bail!("ForEach: input '{name}' must be a non-empty string"),
    }
}

fn check_result_port(
    template: &WorkflowGraph,
    result_node_id: &str,
    result_port_name: &str,
    ctx: &ProcessContext,
) -> Result<()> {
    let result_spec = template.node_by_id(result_node_id).ok_or_else(|| {
        EngineError::InvalidSubWorkflow(format!(
            "result node '{result_node_id}' not found in sub-workflow"
        ))
    })?;

    let node = ctx
        .registry
        .create(&result_spec.node_type, &result_spec.input_values)
        .map_err(|e| {
            EngineError::InvalidSubWorkflow(format!(
                "failed to instantiate result node '{result_node_id}': {e:#}"
            ))
        })?;

    if !node
        .output_ports()
        .iter()
        .any(|port| port.name == result_port_name)
    {
        return Err(EngineError::InvalidSubWorkflow(format!(
            "result node '{result_node_id}' declares no output port '{result_port_name}'"
        ))
        .into());
    }

    Ok(())
}

/// Fresh sub-graph for one iteration: a clone of the validated description
/// with the injection values written into every `ForEachItem` node's input
/// values. Iterations never share node state.
fn materialize_iteration(
    template: &WorkflowGraph,
    item: &Value,
    index: usize,
    global_vars: &Value,
) -> WorkflowGraph {
    let mut graph = template.clone();
    for spec in graph.nodes_mut() {
        if spec.node_type == FOREACH_ITEM_TYPE {
            spec.input_values
                .insert("foreach_item".to_string(), item.clone());
            spec.input_values
                .insert("foreach_index".to_string(), json!(index));
            spec.input_values
                .insert("foreach_global_vars".to_string(), global_vars.clone());
        }
    }
    graph
}

#[allow(clippy::too_many_arguments)]
async fn run_sequential(
    template: &WorkflowGraph,
    items: &[Value],
    global_vars: &Value,
    continue_on_error: bool,
    ctx: &ProcessContext,
    result_node_id: &str,
    result_port_name: &str,
    collector: &mut IterationCollector,
) {
    for (index, item) in items.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let graph = materialize_iteration(template, item, index, global_vars);
        let report = execute(
            &graph,
            Arc::clone(&ctx.registry),
            ExecutorOptions::child_of(ctx),
        )
        .await;

        let failed = collector.record(
            index,
            item.clone(),
            report,
            result_node_id,
            result_port_name,
        );
        if failed && !continue_on_error {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_parallel(
    template: &WorkflowGraph,
    items: &[Value],
    global_vars: &Value,
    workers: usize,
    continue_on_error: bool,
    ctx: &ProcessContext,
    result_node_id: &str,
    result_port_name: &str,
    collector: &mut IterationCollector,
) {
    let mut join_set: JoinSet<(usize, Value, Result<RunReport, EngineError>)> = JoinSet::new();
    let mut next = 0;
    let mut abort = false;

    loop {
        // Iterations start in ascending index order, at most `workers` in
        // flight; completion order is whatever it is.
        while next < items.len() && join_set.len() < workers && !abort && !ctx.cancel.is_cancelled()
        {
            let graph = materialize_iteration(template, &items[next], next, global_vars);
            let registry = Arc::clone(&ctx.registry);
            let options = ExecutorOptions::child_of(ctx);
            let item = items[next].clone();
            let index = next;
            join_set.spawn(async move {
                let report = execute(&graph, registry, options).await;
                (index, item, report)
            });
            next += 1;
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };

        match joined {
            Ok((index, item, report)) => {
                let failed =
                    collector.record(index, item, report, result_node_id, result_port_name);
                if failed && !continue_on_error {
                    abort = true;
                }
            }
            Err(join_err) => {
                warn!(error = %join_err, "foreach iteration task aborted");
                if !continue_on_error {
                    abort = true;
                }
            }
        }
    }
}

/// Accumulates per-iteration outcomes at their captured index, then
/// compacts into the ForEach output ports.
struct IterationCollector {
    result_slots: Vec<Option<Value>>,
    sub_workflow_results: Vec<(usize, Value)>,
    errors: Vec<(usize, Value)>,
    success_count: usize,
    error_count: usize,
    last_index: Option<usize>,
    last_item: Value,
}

impl IterationCollector {
    fn new(capacity: usize) -> Self {
        Self {
            result_slots: vec![None; capacity],
            sub_workflow_results: Vec::new(),
            errors: Vec::new(),
            success_count: 0,
            error_count: 0,
            last_index: None,
            last_item: Value::Null,
        }
    }

    /// Record one finished iteration; returns whether it failed.
    fn record(
        &mut self,
        index: usize,
        item: Value,
        outcome: Result<RunReport, EngineError>,
        result_node_id: &str,
        result_port_name: &str,
    ) -> bool {
        if self.last_index.map_or(true, |last| index >= last) {
            self.last_index = Some(index);
            self.last_item = item.clone();
        }

        match outcome {
            Ok(report) if report.status == RunStatus::Completed => {
                let value = report
                    .output(result_node_id, result_port_name)
                    .cloned()
                    .unwrap_or(Value::Null);
                self.result_slots[index] = Some(value);
                self.sub_workflow_results
                    .push((index, json!({"index": index, "results": report.results})));
                self.success_count += 1;
                false
            }
            Ok(report) => {
                let message = report
                    .error
                    .map(|error| error.message)
                    .unwrap_or_else(|| "run cancelled".to_string());
                self.push_error(index, item, message, json!(report.results));
                true
            }
            Err(err) => {
                self.push_error(index, item, err.to_string(), json!({}));
                true
            }
        }
    }

    fn push_error(&mut self, index: usize, item: Value, message: String, partial: Value) {
        self.errors.push((
            index,
            json!({
                "index": index,
                "item": item,
                "error": message,
                "partial_results": partial,
            }),
        ));
        self.error_count += 1;
    }

    fn into_outputs(mut self, total_count: usize) -> HashMap<String, Value> {
        // Compact to successful iterations in ascending original index
        // order.
        let results: Vec<Value> = self.result_slots.into_iter().flatten().collect();

        self.sub_workflow_results.sort_by_key(|(index, _)| *index);
        self.errors.sort_by_key(|(index, _)| *index);

        HashMap::from([
            ("results".to_string(), Value::Array(results)),
            (
                "sub_workflow_results".to_string(),
                Value::Array(
                    self.sub_workflow_results
                        .into_iter()
                        .map(|(_, entry)| entry)
                        .collect(),
                ),
            ),
            ("item_value".to_string(), self.last_item),
            (
                "current_index".to_string(),
                match self.last_index {
                    Some(index) => json!(index),
                    None => json!(-1),
                },
            ),
            ("total_count".to_string(), json!(total_count)),
            ("success_count".to_string(), json!(self.success_count)),
            ("error_count".to_string(), json!(self.error_count)),
            (
                "errors".to_string(),
                Value::Array(self.errors.into_iter().map(|(_, entry)| entry).collect()),
            ),
        ])
    }
}
