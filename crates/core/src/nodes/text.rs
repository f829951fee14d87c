use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::PortType;

// ─── TextInput ───────────────────────────────────────────────────────────────

/// Constant text source.
pub struct TextInputNode;

impl TextInputNode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Node for TextInputNode {
    fn node_type(&self) -> &str {
        "TextInput"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::with_default(
            "text",
            PortType::String,
            json!(""),
        )]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("text", PortType::String)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let text = expect_str(inputs, "text")?;
        Ok(HashMap::from([("text".to_string(), json!(text))]))
    }
}

// ─── TextStrip ───────────────────────────────────────────────────────────────

/// Trims leading and trailing whitespace.
pub struct TextStripNode;

impl TextStripNode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Node for TextStripNode {
    fn node_type(&self) -> &str {
        "TextStrip"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("text", PortType::String)]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("text", PortType::String)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let text = expect_str(inputs, "text")?;
        Ok(HashMap::from([("text".to_string(), json!(text.trim()))]))
    }
}

// ─── TextToList ──────────────────────────────────────────────────────────────

/// Splits text into an array of strings, either on a delimiter or on line
/// breaks.
pub struct TextToListNode;

impl TextToListNode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Node for TextToListNode {
    fn node_type(&self) -> &str {
        "TextToList"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("text", PortType::String),
            PortDefinition::with_default("format", PortType::String, json!("delimited"))
                .with_options(vec![json!("delimited"), json!("lines")]),
            PortDefinition::with_default("delimiter", PortType::String, json!(",")),
            PortDefinition::with_default("trim_items", PortType::Boolean, json!(true)),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("list", PortType::Array),
            PortDefinition::required("count", PortType::Number),
        ]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let text = expect_str(inputs, "text")?;
        let format = inputs
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("delimited");
        let trim_items = inputs
            .get("trim_items")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let parts: Vec<&str> = match format {
            "lines" => text.lines().collect(),
            "delimited" => {
                let delimiter = inputs
                    .get("delimiter")
                    .and_then(Value::as_str)
                    .unwrap_or(",");
                if delimiter.is_empty() {
                    bail!("TextToList: delimiter must not be empty");
                }
                text.split(delimiter).collect()
            }
            other => bail!("TextToList: unknown format '{other}'"),
        };

        let list: Vec<Value> = parts
            .into_iter()
            .map(|part| {
                if trim_items {
                    json!(part.trim())
                } else {
                    json!(part)
                }
            })
            .collect();

        let count = list.len();
        Ok(HashMap::from([
            ("list".to_string(), Value::Array(list)),
            ("count".to_string(), json!(count)),
        ]))
    }
}

// ─── TextTemplate ────────────────────────────────────────────────────────────

/// Renders `{name}` placeholders from an object of values. In strict mode
/// an unresolved placeholder is an error; otherwise it is kept verbatim.
pub struct TextTemplateNode;

impl TextTemplateNode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Node for TextTemplateNode {
    fn node_type(&self) -> &str {
        "TextTemplate"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::with_default("template", PortType::String, json!("")),
            PortDefinition::with_default("values", PortType::Object, json!({})),
            PortDefinition::with_default("strict", PortType::Boolean, json!(true)),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("text", PortType::String)]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let template = expect_str(inputs, "template")?;
        let strict = inputs
            .get("strict")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let empty = serde_json::Map::new();
        let values = inputs
            .get("values")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let rendered = render_template(&template, values, strict)?;
        Ok(HashMap::from([("text".to_string(), json!(rendered))]))
    }
}

fn render_template(
    template: &str,
    values: &serde_json::Map<String, Value>,
    strict: bool,
) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        result.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];

        let Some(close) = after_open.find('}') else {
            result.push_str(&rest[open..]);
            return Ok(result);
        };

        let token = &after_open[..close];
        match values.get(token) {
            Some(Value::String(value)) => result.push_str(value),
            Some(value) => result.push_str(&value.to_string()),
            None if strict => {
                bail!("TextTemplate: missing value for placeholder '{{{token}}}'")
            }
            None => {
                result.push('{');
                result.push_str(token);
                result.push('}');
            }
        }

        rest = &after_open[close + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn expect_str(inputs: &HashMap<String, Value>, name: &str) -> Result<String> {
    match inputs.get(name) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => bail!("input '{name}' must be a string, got {other}"),
        None => bail!("input '{name}' is required"),
    }
}
