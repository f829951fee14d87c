use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::PortType;

const PREVIEW_MAX_CHARS: usize = 500;

/// Pass-through that logs its input, for debugging pipelines in place.
pub struct PrintNode;

impl PrintNode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Node for PrintNode {
    fn node_type(&self) -> &str {
        "Print"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::optional("value", PortType::Any),
            PortDefinition::with_default("label", PortType::String, json!("")),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("value", PortType::Any)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let value = inputs.get("value").cloned().unwrap_or(Value::Null);
        let label = inputs.get("label").and_then(Value::as_str).unwrap_or("");

        let rendered = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let preview: String = rendered.chars().take(PREVIEW_MAX_CHARS).collect();
        let truncated = rendered.chars().count() > PREVIEW_MAX_CHARS;

        info!(label, %preview, truncated, "print");

        Ok(HashMap::from([("value".to_string(), value)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;
    use std::sync::Arc;

    fn ctx() -> ProcessContext {
        ProcessContext::new(Arc::new(NodeRegistry::new()))
    }

    #[tokio::test]
    async fn test_passes_value_through() {
        let mut node = PrintNode::new();
        let inputs = HashMap::from([("value".to_string(), json!({"k": [1, 2]}))]);

        let outputs = node.process(&inputs, &ctx()).await.expect("print should run");
        assert_eq!(outputs.get("value"), Some(&json!({"k": [1, 2]})));
    }

    #[tokio::test]
    async fn test_absent_value_becomes_null() {
        let mut node = PrintNode::new();

        let outputs = node
            .process(&HashMap::new(), &ctx())
            .await
            .expect("print should run");
        assert_eq!(outputs.get("value"), Some(&Value::Null));
    }
}
