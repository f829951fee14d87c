use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::PortType;

pub const FOREACH_ITEM_TYPE: &str = "ForEachItem";

/// Entry node of a ForEach sub-workflow. The fan-out engine injects the
/// current item, its index, and the shared globals into this node's input
/// values before each iteration; `process` republishes them for downstream
/// nodes. Ports the engine did not inject come out as `null`, so the same
/// sub-graph also validates and runs standalone.
pub struct ForEachItemNode;

impl ForEachItemNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ForEachItemNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for ForEachItemNode {
    fn node_type(&self) -> &str {
        FOREACH_ITEM_TYPE
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::optional("foreach_item", PortType::Any),
            PortDefinition::optional("foreach_index", PortType::Number),
            PortDefinition::optional("foreach_global_vars", PortType::Object),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::optional("item", PortType::Any),
            PortDefinition::optional("index", PortType::Number),
            PortDefinition::optional("global_vars", PortType::Object),
        ]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let take = |name: &str| inputs.get(name).cloned().unwrap_or(Value::Null);

        Ok(HashMap::from([
            ("item".to_string(), take("foreach_item")),
            ("index".to_string(), take("foreach_index")),
            ("global_vars".to_string(), take("foreach_global_vars")),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> ProcessContext {
        ProcessContext::new(Arc::new(NodeRegistry::new()))
    }

    #[tokio::test]
    async fn test_passes_injected_values_through() {
        let mut node = ForEachItemNode::new();
        let inputs = HashMap::from([
            ("foreach_item".to_string(), json!("alpha")),
            ("foreach_index".to_string(), json!(4)),
            ("foreach_global_vars".to_string(), json!({"env": "test"})),
        ]);

        let outputs = node
            .process(&inputs, &ctx())
            .await
            .expect("pass-through should succeed");

        assert_eq!(outputs.get("item"), Some(&json!("alpha")));
        assert_eq!(outputs.get("index"), Some(&json!(4)));
        assert_eq!(outputs.get("global_vars"), Some(&json!({"env": "test"})));
    }

    #[tokio::test]
    async fn test_uninjected_ports_come_out_null() {
        let mut node = ForEachItemNode::new();

        let outputs = node
            .process(&HashMap::new(), &ctx())
            .await
            .expect("pass-through should succeed");

        assert_eq!(outputs.get("item"), Some(&Value::Null));
        assert_eq!(outputs.get("index"), Some(&Value::Null));
        assert_eq!(outputs.get("global_vars"), Some(&Value::Null));
    }
}
