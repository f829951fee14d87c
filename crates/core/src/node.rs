use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::registry::NodeRegistry;
use crate::types::PortType;

/// Sub-graph nesting limit for ForEach fan-out.
pub const MAX_NESTING_DEPTH: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortDefinition {
    pub name: String,
    pub port_type: PortType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Finite set of admissible values, when the port is an enum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
}

impl PortDefinition {
    pub fn required(name: &str, port_type: PortType) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            required: true,
            default_value: None,
            options: None,
        }
    }

    pub fn optional(name: &str, port_type: PortType) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            required: false,
            default_value: None,
            options: None,
        }
    }

    pub fn with_default(name: &str, port_type: PortType, default: Value) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            required: false,
            default_value: Some(default),
            options: None,
        }
    }

    pub fn with_options(mut self, options: Vec<Value>) -> Self {
        self.options = Some(options);
        self
    }
}

/// Per-run context handed to every `process()` invocation.
///
/// Cancellation is cooperative: implementations are expected to check the
/// token at I/O boundaries, and the runtime never forcibly kills a running
/// node. The registry handle lets control nodes (ForEach) materialize and
/// run sub-graphs through the same executor.
#[derive(Clone)]
pub struct ProcessContext {
    pub cancel: CancellationToken,
    pub registry: Arc<NodeRegistry>,
    pub nesting_depth: u32,
}

impl ProcessContext {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            registry,
            nesting_depth: 0,
        }
    }

    /// Context for a child run: fresh token chained to this one, one level
    /// deeper.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            registry: Arc::clone(&self.registry),
            nesting_depth: self.nesting_depth + 1,
        }
    }
}

/// Core node contract implemented by every built-in and registered node.
///
/// A node declares its input and output ports and transforms effective
/// inputs into a map of output values. `process` may suspend on I/O or on
/// sub-runs; a single node's `process` runs sequentially within its own
/// task.
#[async_trait]
pub trait Node: Send + Sync {
    fn node_type(&self) -> &str;
    fn input_ports(&self) -> Vec<PortDefinition>;
    fn output_ports(&self) -> Vec<PortDefinition>;
    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_port_definition_constructors() {
        let input = PortDefinition::required("data", PortType::Any);
        assert_eq!(input.name, "data");
        assert!(input.required);
        assert!(input.default_value.is_none());

        let mode = PortDefinition::with_default("mode", PortType::String, json!("first_match"))
            .with_options(vec![json!("first_match"), json!("all_matches")]);
        assert!(!mode.required);
        assert_eq!(mode.default_value, Some(json!("first_match")));
        assert_eq!(mode.options.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_child_context_chains_cancellation() {
        let registry = Arc::new(NodeRegistry::new());
        let ctx = ProcessContext::new(registry);
        let child = ctx.child();

        assert_eq!(child.nesting_depth, 1);
        assert!(!child.cancel.is_cancelled());

        ctx.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn test_child_cancellation_does_not_propagate_upward() {
        let registry = Arc::new(NodeRegistry::new());
        let ctx = ProcessContext::new(registry);
        let child = ctx.child();

        child.cancel.cancel();
        assert!(!ctx.cancel.is_cancelled());
    }
}
