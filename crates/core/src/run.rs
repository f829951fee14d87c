use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal and in-flight states of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Cancelled
        )
    }
}

/// Per-node lifecycle within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// Execution record for one node: status plus dispatch/completion instants
/// for ordering assertions.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub status: NodeStatus,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl NodeRecord {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = NodeStatus::Running;
        self.started_at = Some(Instant::now());
    }

    pub fn mark(&mut self, status: NodeStatus) {
        self.status = status;
        self.finished_at = Some(Instant::now());
    }
}

/// The first surfaced failure of a run; later failures are logged but do
/// not overwrite it.
#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub node_id: String,
    pub message: String,
}

/// Terminal snapshot of one run: result store, per-node records, and the
/// reported error if any. The result store holds, for every node that
/// completed, the map of its outputs, written exactly once.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub results: HashMap<String, HashMap<String, Value>>,
    pub nodes: HashMap<String, NodeRecord>,
    pub error: Option<RunError>,
}

impl RunReport {
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|record| record.status)
    }

    pub fn output(&self, node_id: &str, port: &str) -> Option<&Value> {
        self.results.get(node_id).and_then(|outputs| outputs.get(port))
    }
}
