use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;

use crate::node::{Node, PortDefinition};

type NodeFactory = dyn Fn(&HashMap<String, Value>) -> Result<Box<dyn Node>> + Send + Sync;

struct RegisteredType {
    category: String,
    factory: Box<NodeFactory>,
}

/// Maps a string node type to a factory producing fresh node instances.
///
/// Read-only after service start; shared around as `Arc<NodeRegistry>`.
pub struct NodeRegistry {
    types: HashMap<String, RegisteredType>,
}

/// Static node metadata served to UIs: category plus full port definitions.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDescriptor {
    pub node_type: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, node_type: &str, category: &str, factory: F)
    where
        F: Fn(&HashMap<String, Value>) -> Result<Box<dyn Node>> + Send + Sync + 'static,
    {
        self.types.insert(
            node_type.to_string(),
            RegisteredType {
                category: category.to_string(),
                factory: Box::new(factory),
            },
        );
    }

    pub fn create(&self, node_type: &str, params: &HashMap<String, Value>) -> Result<Box<dyn Node>> {
        let registered = self
            .types
            .get(node_type)
            .ok_or_else(|| anyhow!("unknown node type: {node_type}"))?;

        (registered.factory)(params)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.types.contains_key(node_type)
    }

    /// All registered `(category, node_type)` pairs, sorted for stable
    /// output.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .types
            .iter()
            .map(|(node_type, registered)| (registered.category.clone(), node_type.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Full port metadata per registered type, built by instantiating each
    /// factory with empty params so descriptors cannot drift from the
    /// runtime port declarations.
    pub fn descriptors(&self) -> Vec<NodeDescriptor> {
        let mut descriptors: Vec<NodeDescriptor> = self
            .types
            .iter()
            .filter_map(|(node_type, registered)| {
                let node = (registered.factory)(&HashMap::new()).ok()?;
                Some(NodeDescriptor {
                    node_type: node_type.clone(),
                    category: registered.category.clone(),
                    inputs: node.input_ports(),
                    outputs: node.output_ports(),
                })
            })
            .collect();
        descriptors.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        descriptors
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the built-in node library.
pub fn register_builtin_nodes(registry: &mut NodeRegistry) {
    use crate::nodes::constant::ConstantNode;
    use crate::nodes::foreach::ForEachNode;
    use crate::nodes::foreach_item::ForEachItemNode;
    use crate::nodes::http_request::HttpRequestNode;
    use crate::nodes::math::MathOperationNode;
    use crate::nodes::merge::MergeNode;
    use crate::nodes::pass_through::PassThroughNode;
    use crate::nodes::print::PrintNode;
    use crate::nodes::switch::SwitchNode;
    use crate::nodes::text::{TextInputNode, TextStripNode, TextTemplateNode, TextToListNode};

    registry.register("ForEach", "control", |_params| {
        Ok(Box::new(ForEachNode::new()))
    });
    registry.register("ForEachItem", "control", |_params| {
        Ok(Box::new(ForEachItemNode::new()))
    });
    registry.register("Switch", "control", |params| {
        Ok(Box::new(SwitchNode::from_params(params)?))
    });
    registry.register("Merge", "control", |params| {
        Ok(Box::new(MergeNode::from_params(params)?))
    });
    registry.register("PassThrough", "control", |_params| {
        Ok(Box::new(PassThroughNode::new()))
    });

    registry.register("TextInput", "text", |_params| {
        Ok(Box::new(TextInputNode::new()))
    });
    registry.register("TextStrip", "text", |_params| {
        Ok(Box::new(TextStripNode::new()))
    });
    registry.register("TextTemplate", "text", |_params| {
        Ok(Box::new(TextTemplateNode::new()))
    });
    registry.register("TextToList", "text", |_params| {
        Ok(Box::new(TextToListNode::new()))
    });

    registry.register("Constant", "number", |params| {
        Ok(Box::new(ConstantNode::from_params(params)?))
    });
    registry.register("MathOperation", "number", |_params| {
        Ok(Box::new(MathOperationNode::new()))
    });

    registry.register("HttpRequest", "network", |_params| {
        Ok(Box::new(HttpRequestNode::new()))
    });
    registry.register("Print", "utility", |_params| Ok(Box::new(PrintNode::new())));
}

pub fn build_default_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtin_nodes(&mut registry);
    registry
}
