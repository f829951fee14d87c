use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::EngineError;
use crate::node::PortDefinition;
use crate::nodes::foreach_item::FOREACH_ITEM_TYPE;
use crate::registry::NodeRegistry;

/// One node of a workflow description: a registry type name plus the
/// constant input values supplied at graph construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: String,
    pub node_type: String,
    pub input_values: HashMap<String, Value>,
}

/// Edge payload: which output port feeds which input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from_port: String,
    pub to_port: String,
}

/// Directed acyclic workflow graph: nodes keyed by id, connections routing
/// one output port to one input port.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: StableDiGraph<NodeSpec, Connection>,
    node_ids: HashMap<String, NodeIndex>,
}

/// Reverse route lookup, precomputed once per run:
/// `target node → (target port → (source node, source port))`.
#[derive(Debug, Default)]
pub struct RouteIndex {
    by_target: HashMap<String, HashMap<String, (String, String)>>,
}

impl RouteIndex {
    pub fn inbound(&self, node_id: &str) -> Option<&HashMap<String, (String, String)>> {
        self.by_target.get(node_id)
    }
}

/// Outcome of the UI-facing sub-workflow check.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_ids: HashMap::new(),
        }
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeIndex, EngineError> {
        if self.node_ids.contains_key(&spec.id) {
            return Err(EngineError::GraphValidation(format!(
                "duplicate node id: {}",
                spec.id
            )));
        }

        let node_id = spec.id.clone();
        let index = self.graph.add_node(spec);
        self.node_ids.insert(node_id, index);
        Ok(index)
    }

    /// Add a connection. Exact duplicates (same 4-tuple) are deduplicated;
    /// two different sources feeding the same target port are caught by
    /// `validate`.
    pub fn add_connection(
        &mut self,
        from_id: &str,
        connection: Connection,
        to_id: &str,
    ) -> Result<(), EngineError> {
        let from_idx = self.index_of(from_id).ok_or_else(|| {
            EngineError::GraphValidation(format!("unknown source node id: {from_id}"))
        })?;
        let to_idx = self.index_of(to_id).ok_or_else(|| {
            EngineError::GraphValidation(format!("unknown target node id: {to_id}"))
        })?;

        let duplicate = self
            .graph
            .edges_connecting(from_idx, to_idx)
            .any(|edge| *edge.weight() == connection);
        if duplicate {
            return Ok(());
        }

        self.graph.add_edge(from_idx, to_idx, connection);
        Ok(())
    }

    pub fn index_of(&self, node_id: &str) -> Option<NodeIndex> {
        self.node_ids.get(node_id).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &NodeSpec {
        self.graph
            .node_weight(idx)
            .expect("node index should be valid")
    }

    pub fn node_by_id(&self, node_id: &str) -> Option<&NodeSpec> {
        self.index_of(node_id).map(|idx| self.node(idx))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.graph.node_weights()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut NodeSpec> {
        self.graph.node_weights_mut()
    }

    pub fn connections_to(&self, idx: NodeIndex) -> Vec<(NodeIndex, &Connection)> {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| (edge.source(), edge.weight()))
            .collect()
    }

    pub fn connections_from(&self, idx: NodeIndex) -> Vec<(NodeIndex, &Connection)> {
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| (edge.target(), edge.weight()))
            .collect()
    }

    /// Incoming edge count per node. A node is dispatched once every one of
    /// these edges has delivered.
    pub fn in_degrees(&self) -> HashMap<NodeIndex, usize> {
        self.graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph.edges_directed(idx, Direction::Incoming).count(),
                )
            })
            .collect()
    }

    pub fn source_nodes(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .edges_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    pub fn execution_order(&self) -> Result<Vec<NodeIndex>, EngineError> {
        toposort(&self.graph, None).map_err(|_| EngineError::CyclicGraph {
            nodes: self.cycle_members(),
        })
    }

    /// Nodes left over after a Kahn peel: every node that participates in
    /// (or is downstream of) a cycle.
    fn cycle_members(&self) -> Vec<String> {
        let mut in_degrees = self.in_degrees();
        let mut queue: VecDeque<NodeIndex> = in_degrees
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| *idx)
            .collect();

        while let Some(idx) = queue.pop_front() {
            for (successor, _) in self.connections_from(idx) {
                let degree = in_degrees
                    .get_mut(&successor)
                    .expect("successor should have an in-degree entry");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
            in_degrees.remove(&idx);
        }

        let mut members: Vec<String> = in_degrees
            .keys()
            .map(|idx| self.node(*idx).id.clone())
            .collect();
        members.sort();
        members
    }

    /// Precompute the reverse route index for O(1) lookup during port
    /// resolution.
    pub fn route_index(&self) -> RouteIndex {
        let mut by_target: HashMap<String, HashMap<String, (String, String)>> = HashMap::new();

        for edge in self.graph.edge_references() {
            let source = self.node(edge.source());
            let target = self.node(edge.target());
            let connection = edge.weight();

            by_target.entry(target.id.clone()).or_default().insert(
                connection.to_port.clone(),
                (source.id.clone(), connection.from_port.clone()),
            );
        }

        RouteIndex { by_target }
    }

    /// Check all graph invariants: endpoints exist and point the right way,
    /// at most one connection per target port, port types are compatible,
    /// every required input is satisfiable, and the graph is acyclic.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<(), EngineError> {
        let definitions = self.collect_port_definitions(registry)?;

        let mut seen_targets: HashSet<(NodeIndex, &str)> = HashSet::new();
        for edge in self.graph.edge_references() {
            let connection = edge.weight();
            if !seen_targets.insert((edge.target(), connection.to_port.as_str())) {
                let target = self.node(edge.target());
                return Err(EngineError::GraphValidation(format!(
                    "multiple connections target '{}.{}'",
                    target.id, connection.to_port
                )));
            }
        }

        for edge in self.graph.edge_references() {
            let source_node = self.node(edge.source());
            let target_node = self.node(edge.target());
            let connection = edge.weight();

            let (_, source_outputs) = definitions
                .get(&edge.source())
                .expect("source node should be present");
            let (target_inputs, _) = definitions
                .get(&edge.target())
                .expect("target node should be present");

            let source_port = source_outputs
                .iter()
                .find(|port| port.name == connection.from_port)
                .ok_or_else(|| {
                    EngineError::GraphValidation(format!(
                        "node '{}' has no output port '{}'",
                        source_node.id, connection.from_port
                    ))
                })?;

            let target_port = target_inputs
                .iter()
                .find(|port| port.name == connection.to_port)
                .ok_or_else(|| {
                    EngineError::GraphValidation(format!(
                        "node '{}' has no input port '{}'",
                        target_node.id, connection.to_port
                    ))
                })?;

            if !target_port.port_type.accepts_from(source_port.port_type) {
                return Err(EngineError::GraphValidation(format!(
                    "incompatible port types: '{}:{}' ({:?}) -> '{}:{}' ({:?})",
                    source_node.id,
                    connection.from_port,
                    source_port.port_type,
                    target_node.id,
                    connection.to_port,
                    target_port.port_type
                )));
            }
        }

        for (idx, (input_ports, _)) in &definitions {
            let connected_inputs: HashSet<&str> = self
                .connections_to(*idx)
                .into_iter()
                .map(|(_, connection)| connection.to_port.as_str())
                .collect();

            let spec = self.node(*idx);
            for port in input_ports {
                if port.required
                    && port.default_value.is_none()
                    && !connected_inputs.contains(port.name.as_str())
                    && !spec.input_values.contains_key(&port.name)
                {
                    return Err(EngineError::MissingRequiredInput {
                        node: spec.id.clone(),
                        port: port.name.clone(),
                    });
                }
            }
        }

        self.execution_order()?;
        Ok(())
    }

    fn collect_port_definitions(
        &self,
        registry: &NodeRegistry,
    ) -> Result<HashMap<NodeIndex, (Vec<PortDefinition>, Vec<PortDefinition>)>, EngineError> {
        let mut definitions = HashMap::new();

        for idx in self.graph.node_indices() {
            let spec = self.node(idx);
            if !registry.contains(&spec.node_type) {
                return Err(EngineError::UnknownNodeType(spec.node_type.clone()));
            }

            let node = registry
                .create(&spec.node_type, &spec.input_values)
                .map_err(|e| {
                    EngineError::GraphValidation(format!(
                        "failed to instantiate node '{}' of type '{}': {e:#}",
                        spec.id, spec.node_type
                    ))
                })?;

            definitions.insert(idx, (node.input_ports(), node.output_ports()));
        }

        Ok(definitions)
    }

    /// Node ids reachable by following connections forward from `start`.
    fn reachable_from(&self, start: NodeIndex) -> HashSet<NodeIndex> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(idx) = queue.pop_front() {
            for (successor, _) in self.connections_from(idx) {
                if seen.insert(successor) {
                    queue.push_back(successor);
                }
            }
        }

        seen
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a ForEach sub-workflow description for a UI, collecting every
/// problem instead of stopping at the first.
pub fn validate_sub_workflow(
    graph: &WorkflowGraph,
    result_node_id: Option<&str>,
    result_port_name: Option<&str>,
    registry: &NodeRegistry,
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for spec in graph.nodes() {
        if !registry.contains(&spec.node_type) {
            errors.push(format!(
                "node '{}' has unknown type '{}'",
                spec.id, spec.node_type
            ));
        }
    }

    let item_nodes: Vec<&NodeSpec> = graph
        .nodes()
        .filter(|spec| spec.node_type == FOREACH_ITEM_TYPE)
        .collect();
    if item_nodes.is_empty() {
        errors.push(format!(
            "sub-workflow has no {FOREACH_ITEM_TYPE} entry node"
        ));
    }

    if let Err(EngineError::CyclicGraph { nodes }) = graph.execution_order() {
        errors.push(format!("cycle detected involving nodes {nodes:?}"));
    }

    match result_node_id {
        None => errors.push("result_node_id is required".to_string()),
        Some(result_id) => match graph.node_by_id(result_id) {
            None => errors.push(format!("result node '{result_id}' not found in sub-workflow")),
            Some(result_spec) => {
                if let Some(port_name) = result_port_name {
                    if registry.contains(&result_spec.node_type) {
                        match registry.create(&result_spec.node_type, &result_spec.input_values) {
                            Ok(node) => {
                                if !node.output_ports().iter().any(|p| p.name == port_name) {
                                    errors.push(format!(
                                        "result node '{result_id}' declares no output port '{port_name}'"
                                    ));
                                }
                            }
                            Err(e) => errors.push(format!(
                                "failed to instantiate result node '{result_id}': {e:#}"
                            )),
                        }
                    }
                } else {
                    errors.push("result_port_name is required".to_string());
                }

                if let (Some(result_idx), Some(item_spec)) =
                    (graph.index_of(result_id), item_nodes.first())
                {
                    let item_idx = graph
                        .index_of(&item_spec.id)
                        .expect("item node id should resolve");
                    if !graph.reachable_from(item_idx).contains(&result_idx) {
                        warnings.push(format!(
                            "result node '{result_id}' is not downstream of '{}'",
                            item_spec.id
                        ));
                    }
                }
            }
        },
    }

    if graph.node_count() > 1 {
        for idx in graph.node_indices() {
            if graph.connections_to(idx).is_empty() && graph.connections_from(idx).is_empty() {
                warnings.push(format!("node '{}' is not connected", graph.node(idx).id));
            }
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

// ─── Wire format ─────────────────────────────────────────────────────────────
//
// {
//   "nodes": { "<id>": { "type": "...", "inputs": { "<port>": <value> } } },
//   "connections": [ { "from_node", "from_port", "to_node", "to_port" } ]
// }
//
// `input_values` is accepted as an alias of `inputs` for interoperability
// with existing saved files.

#[derive(Serialize, Deserialize)]
struct WorkflowGraphSerde {
    nodes: BTreeMap<String, NodeSpecSerde>,
    #[serde(default)]
    connections: Vec<ConnectionSerde>,
}

#[derive(Serialize, Deserialize)]
struct NodeSpecSerde {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default, alias = "input_values")]
    inputs: HashMap<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct ConnectionSerde {
    from_node: String,
    from_port: String,
    to_node: String,
    to_port: String,
}

impl Serialize for WorkflowGraph {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let nodes: BTreeMap<String, NodeSpecSerde> = self
            .nodes()
            .map(|spec| {
                (
                    spec.id.clone(),
                    NodeSpecSerde {
                        node_type: spec.node_type.clone(),
                        inputs: spec.input_values.clone(),
                    },
                )
            })
            .collect();

        let mut connections: Vec<ConnectionSerde> = self
            .graph
            .edge_references()
            .map(|edge| ConnectionSerde {
                from_node: self.node(edge.source()).id.clone(),
                from_port: edge.weight().from_port.clone(),
                to_node: self.node(edge.target()).id.clone(),
                to_port: edge.weight().to_port.clone(),
            })
            .collect();

        connections.sort_by(|a, b| {
            a.from_node
                .cmp(&b.from_node)
                .then_with(|| a.from_port.cmp(&b.from_port))
                .then_with(|| a.to_node.cmp(&b.to_node))
                .then_with(|| a.to_port.cmp(&b.to_port))
        });

        WorkflowGraphSerde { nodes, connections }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let serialized = WorkflowGraphSerde::deserialize(deserializer)?;
        let mut graph = WorkflowGraph::new();

        for (id, node) in serialized.nodes {
            graph
                .add_node(NodeSpec {
                    id,
                    node_type: node.node_type,
                    input_values: node.inputs,
                })
                .map_err(D::Error::custom)?;
        }

        for connection in serialized.connections {
            graph
                .add_connection(
                    &connection.from_node,
                    Connection {
                        from_port: connection.from_port,
                        to_port: connection.to_port,
                    },
                    &connection.to_node,
                )
                .map_err(D::Error::custom)?;
        }

        Ok(graph)
    }
}
