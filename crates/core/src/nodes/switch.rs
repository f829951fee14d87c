use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::{is_empty_value, PortType};

const MODE_FIRST_MATCH: &str = "first_match";
const MODE_ALL_MATCHES: &str = "all_matches";

/// Routes `data` to one of `output_0 … output_{n-1}` (or `fallback`) based
/// on an ordered rule list. In `first_match` mode exactly one output
/// receives the data; in `all_matches` mode every matching rule's output
/// does. Rules with the same `output_index` resolve first-in-list-order.
pub struct SwitchNode {
    output_count: usize,
}

#[derive(Debug, Deserialize)]
struct SwitchRule {
    #[serde(default)]
    field: String,
    #[serde(alias = "op")]
    operator: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(alias = "out")]
    output_index: usize,
}

impl SwitchNode {
    pub fn new(output_count: usize) -> Self {
        Self { output_count }
    }

    pub fn from_params(params: &HashMap<String, Value>) -> Result<Self> {
        let output_count = match params.get("output_count") {
            Some(value) => match value.as_u64() {
                Some(count) if count >= 1 => count as usize,
                _ => bail!("Switch: output_count must be a positive integer, got {value}"),
            },
            None => 1,
        };

        Ok(Self { output_count })
    }
}

#[async_trait]
impl Node for SwitchNode {
    fn node_type(&self) -> &str {
        "Switch"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("data", PortType::Any),
            PortDefinition::with_default("rules", PortType::Array, json!([])),
            PortDefinition::with_default("mode", PortType::String, json!(MODE_FIRST_MATCH))
                .with_options(vec![json!(MODE_FIRST_MATCH), json!(MODE_ALL_MATCHES)]),
            PortDefinition::with_default("output_count", PortType::Number, json!(self.output_count)),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        let mut ports: Vec<PortDefinition> = (0..self.output_count)
            .map(|idx| PortDefinition::optional(&format!("output_{idx}"), PortType::Any))
            .collect();
        ports.push(PortDefinition::optional("fallback", PortType::Any));
        ports
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        _ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let data = inputs
            .get("data")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Switch: input 'data' is required"))?;

        let rules: Vec<SwitchRule> = match inputs.get("rules") {
            Some(raw) => serde_json::from_value(raw.clone())
                .context("Switch: 'rules' entries must be {field, operator, value, output_index}")?,
            None => vec![],
        };

        let mode = inputs
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or(MODE_FIRST_MATCH);

        let mut outputs = HashMap::new();
        let mut matched = false;

        for rule in &rules {
            if rule.output_index >= self.output_count {
                bail!(
                    "Switch: rule output_index {} out of range (output_count {})",
                    rule.output_index,
                    self.output_count
                );
            }

            if !rule_matches(rule, &data)? {
                continue;
            }

            matched = true;
            outputs
                .entry(format!("output_{}", rule.output_index))
                .or_insert_with(|| data.clone());

            if mode == MODE_FIRST_MATCH {
                break;
            }
        }

        if !matched {
            outputs.insert("fallback".to_string(), data);
        }

        Ok(outputs)
    }
}

/// Walk a dotted path into `data`; integer segments index into arrays. An
/// empty field selects the whole value; a path that walks off the data
/// resolves to `null`.
fn lookup_field<'a>(data: &'a Value, field: &str) -> &'a Value {
    if field.is_empty() {
        return data;
    }

    let mut current = data;
    for segment in field.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx))
                .unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    current
}

fn rule_matches(rule: &SwitchRule, data: &Value) -> Result<bool> {
    let field_value = lookup_field(data, &rule.field);
    let rule_value = rule.value.as_ref().unwrap_or(&Value::Null);

    let result = match rule.operator.as_str() {
        "equals" => json_equals(field_value, rule_value),
        "not_equals" => !json_equals(field_value, rule_value),
        "greater" => compare_numbers(field_value, rule_value, |a, b| a > b),
        "greater_equal" => compare_numbers(field_value, rule_value, |a, b| a >= b),
        "less" => compare_numbers(field_value, rule_value, |a, b| a < b),
        "less_equal" => compare_numbers(field_value, rule_value, |a, b| a <= b),
        "contains" => contains(field_value, rule_value),
        "not_contains" => !contains(field_value, rule_value),
        "starts_with" => match (field_value.as_str(), rule_value.as_str()) {
            (Some(haystack), Some(prefix)) => haystack.starts_with(prefix),
            _ => false,
        },
        "ends_with" => match (field_value.as_str(), rule_value.as_str()) {
            (Some(haystack), Some(suffix)) => haystack.ends_with(suffix),
            _ => false,
        },
        "regex" => {
            let pattern = rule_value
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("Switch: regex operator needs a string value"))?;
            let regex = Regex::new(pattern)
                .with_context(|| format!("Switch: invalid regex pattern '{pattern}'"))?;
            field_value
                .as_str()
                .map(|haystack| regex.is_match(haystack))
                .unwrap_or(false)
        }
        "is_empty" => is_empty_value(field_value),
        "is_not_empty" => !is_empty_value(field_value),
        other => bail!("Switch: unknown operator '{other}'"),
    };

    Ok(result)
}

/// Structural equality with numeric widening: `1` and `1.0` are equal.
fn json_equals(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_numbers(a: &Value, b: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle
            .as_str()
            .map(|sub| s.contains(sub))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| json_equals(item, needle)),
        Value::Object(map) => needle
            .as_str()
            .map(|key| map.contains_key(key))
            .unwrap_or(false),
        _ => false,
    }
}
