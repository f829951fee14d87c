use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::PortType;

/// Single typed constant. The `type` param drives the output port's type
/// so connection validation sees the real type before anything executes.
pub struct ConstantNode {
    port_type: PortType,
    value: Value,
}

impl ConstantNode {
    pub fn from_params(params: &HashMap<String, Value>) -> Result<Self> {
        let port_type = match params.get("type") {
            Some(raw) => serde_json::from_value::<PortType>(raw.clone()).map_err(|_| {
                anyhow::anyhow!(
                    "Constant: unsupported type {raw}, expected one of \
                     string|number|boolean|array|object|json|any"
                )
            })?,
            None => PortType::Any,
        };

        let value = params.get("value").cloned().unwrap_or(Value::Null);
        if !port_type.value_conforms(&value) {
            bail!("Constant: value {value} does not conform to declared type");
        }

        Ok(Self { port_type, value })
    }
}

#[async_trait]
impl Node for ConstantNode {
    fn node_type(&self) -> &str {
        "Constant"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::optional("value", self.port_type),
            PortDefinition::with_default(
                "type",
                PortType::String,
                serde_json::to_value(self.port_type).expect("port type should serialize"),
            ),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value", self.port_type)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let value = inputs
            .get("value")
            .cloned()
            .unwrap_or_else(|| self.value.clone());
        Ok(HashMap::from([("value".to_string(), value)]))
    }
}
