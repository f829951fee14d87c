use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::{is_empty_value, PortType};

const DEFAULT_INPUT_COUNT: usize = 2;

/// Emits the first non-empty input by ascending index. "Empty" means null
/// or absent, an empty array or object, or a whitespace-only string; zero
/// and `false` are values, not gaps.
pub struct MergeNode {
    input_count: usize,
}

impl MergeNode {
    pub fn new(input_count: usize) -> Self {
        Self { input_count }
    }

    pub fn from_params(params: &HashMap<String, Value>) -> Result<Self> {
        let input_count = match params.get("input_count") {
            Some(value) => match value.as_u64() {
                Some(count) if count >= 1 => count as usize,
                _ => bail!("Merge: input_count must be a positive integer, got {value}"),
            },
            None => DEFAULT_INPUT_COUNT,
        };

        Ok(Self { input_count })
    }
}

#[async_trait]
impl Node for MergeNode {
    fn node_type(&self) -> &str {
        "Merge"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        let mut ports = vec![PortDefinition::with_default(
            "input_count",
            PortType::Number,
            json!(self.input_count),
        )];
        for idx in 0..self.input_count {
            ports.push(PortDefinition::optional(
                &format!("input_{idx}"),
                PortType::Any,
            ));
        }
        ports
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::optional("output", PortType::Any),
            PortDefinition::required("selected_index", PortType::Number),
            PortDefinition::required("has_result", PortType::Boolean),
        ]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let selected = (0..self.input_count).find_map(|idx| {
            inputs
                .get(&format!("input_{idx}"))
                .filter(|value| !is_empty_value(value))
                .map(|value| (idx, value.clone()))
        });

        let mut outputs = HashMap::new();
        match selected {
            Some((idx, value)) => {
                outputs.insert("output".to_string(), value);
                outputs.insert("selected_index".to_string(), json!(idx));
                outputs.insert("has_result".to_string(), json!(true));
            }
            None => {
                outputs.insert("selected_index".to_string(), json!(-1));
                outputs.insert("has_result".to_string(), json!(false));
            }
        }

        Ok(outputs)
    }
}
