use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::PortType;

/// Binary arithmetic over two numbers. Integer inputs stay integers for
/// the closed operations; divide and power always produce floats.
pub struct MathOperationNode;

impl MathOperationNode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Node for MathOperationNode {
    fn node_type(&self) -> &str {
        "MathOperation"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("a", PortType::Number),
            PortDefinition::required("b", PortType::Number),
            PortDefinition::with_default("operation", PortType::String, json!("add"))
                .with_options(vec![
                    json!("add"),
                    json!("subtract"),
                    json!("multiply"),
                    json!("divide"),
                    json!("power"),
                    json!("modulo"),
                ]),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("result", PortType::Number)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let a = expect_number(inputs, "a")?;
        let b = expect_number(inputs, "b")?;
        let operation = inputs
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("add");

        let result = match (inputs["a"].as_i64(), inputs["b"].as_i64()) {
            (Some(x), Some(y)) => integer_op(operation, x, y)?,
            _ => float_op(operation, a, b)?,
        };

        Ok(HashMap::from([("result".to_string(), result)]))
    }
}

fn integer_op(operation: &str, a: i64, b: i64) -> Result<Value> {
    let result = match operation {
        "add" => a.checked_add(b).map(Value::from),
        "subtract" => a.checked_sub(b).map(Value::from),
        "multiply" => a.checked_mul(b).map(Value::from),
        "modulo" => {
            if b == 0 {
                bail!("MathOperation: modulo by zero");
            }
            a.checked_rem(b).map(Value::from)
        }
        // Division and exponentiation leave the integers.
        "divide" | "power" => return float_op(operation, a as f64, b as f64),
        other => bail!("MathOperation: unknown operation '{other}'"),
    };

    result.ok_or_else(|| anyhow::anyhow!("MathOperation: integer overflow in '{operation}'"))
}

fn float_op(operation: &str, a: f64, b: f64) -> Result<Value> {
    let result = match operation {
        "add" => a + b,
        "subtract" => a - b,
        "multiply" => a * b,
        "divide" => {
            if b == 0.0 {
                bail!("MathOperation: division by zero");
            }
            a / b
        }
        "power" => a.powf(b),
        "modulo" => {
            if b == 0.0 {
                bail!("MathOperation: modulo by zero");
            }
            a % b
        }
        other => bail!("MathOperation: unknown operation '{other}'"),
    };

    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| anyhow::anyhow!("MathOperation: non-finite result in '{operation}'"))
}

fn expect_number(inputs: &HashMap<String, Value>, name: &str) -> Result<f64> {
    match inputs.get(name).and_then(Value::as_f64) {
        Some(value) => Ok(value),
        None => bail!("MathOperation: input '{name}' must be a number"),
    }
}
