use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::{is_empty_value, PortType};

/// Gate: emits `data` iff `control` is non-empty (Merge's emptiness rules)
/// or `pass_on_empty` is set. When the gate is closed the `output` port is
/// simply absent.
pub struct PassThroughNode;

impl PassThroughNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PassThroughNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for PassThroughNode {
    fn node_type(&self) -> &str {
        "PassThrough"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::optional("data", PortType::Any),
            PortDefinition::optional("control", PortType::Any),
            PortDefinition::with_default("pass_on_empty", PortType::Boolean, json!(false)),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("output", PortType::Any)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let pass_on_empty = inputs
            .get("pass_on_empty")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let control_present = inputs
            .get("control")
            .map(|value| !is_empty_value(value))
            .unwrap_or(false);

        let mut outputs = HashMap::new();
        if pass_on_empty || control_present {
            if let Some(data) = inputs.get("data") {
                outputs.insert("output".to_string(), data.clone());
            }
        }

        Ok(outputs)
    }
}
