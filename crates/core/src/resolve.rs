use std::collections::HashMap;

use serde_json::Value;

use crate::error::EngineError;
use crate::graph::NodeSpec;
use crate::node::PortDefinition;
use crate::types::value_kind;

/// Compute a node's effective inputs just before dispatch.
///
/// Precedence per input port: inbound connection value (when the upstream
/// node produced that output port), then the node's constant
/// `input_values`, then the declared default. An unsatisfied optional port
/// is simply absent from the returned map; an unsatisfied required port
/// fails resolution.
///
/// This is a pure function over the node description and the current
/// result store; failures here are the node's failure, not a scheduler
/// bug.
pub fn resolve_effective_inputs(
    spec: &NodeSpec,
    ports: &[PortDefinition],
    inbound: Option<&HashMap<String, (String, String)>>,
    results: &HashMap<String, HashMap<String, Value>>,
) -> Result<HashMap<String, Value>, EngineError> {
    let mut effective = HashMap::new();

    for port in ports {
        let connected = inbound
            .and_then(|routes| routes.get(&port.name))
            .and_then(|(from_node, from_port)| {
                results.get(from_node).and_then(|outputs| outputs.get(from_port))
            });

        let value = match connected {
            Some(value) => value.clone(),
            None => match spec.input_values.get(&port.name) {
                Some(value) => value.clone(),
                None => match &port.default_value {
                    Some(default) => default.clone(),
                    None if port.required => {
                        return Err(EngineError::MissingRequiredInput {
                            node: spec.id.clone(),
                            port: port.name.clone(),
                        });
                    }
                    None => continue,
                },
            },
        };

        let value = conform_value(spec, port, value)?;
        effective.insert(port.name.clone(), value);
    }

    Ok(effective)
}

/// Type-check one resolved value against its port, applying the single
/// admissible coercion: a string feeding a `json`/`object` port is parsed
/// as JSON.
fn conform_value(
    spec: &NodeSpec,
    port: &PortDefinition,
    value: Value,
) -> Result<Value, EngineError> {
    let value = if port.port_type.is_object_like() && value.is_string() {
        let raw = value.as_str().expect("string value should expose str");
        serde_json::from_str::<Value>(raw).map_err(|e| EngineError::TypeCoercion {
            node: spec.id.clone(),
            port: port.name.clone(),
            message: format!("failed to parse string as JSON: {e}"),
        })?
    } else {
        value
    };

    if !port.port_type.value_conforms(&value) {
        return Err(EngineError::TypeMismatch {
            node: spec.id.clone(),
            port: port.name.clone(),
            message: format!(
                "expected {:?}, got {}",
                port.port_type,
                value_kind(&value)
            ),
        });
    }

    if let Some(options) = &port.options {
        if !value.is_null() && !options.contains(&value) {
            return Err(EngineError::TypeMismatch {
                node: spec.id.clone(),
                port: port.name.clone(),
                message: format!("value {value} is not one of the admissible options"),
            });
        }
    }

    Ok(value)
}
