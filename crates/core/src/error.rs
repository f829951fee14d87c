use thiserror::Error;

/// Engine-level failures surfaced by graph validation, port resolution,
/// the scheduler, and the ForEach engine. Node bodies report failures as
/// `anyhow::Error`; the executor wraps those into [`EngineError::NodeProcess`]
/// so callers can always match on the failure kind.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("graph validation failed: {0}")]
    GraphValidation(String),

    #[error("cycle detected in workflow graph: {nodes:?}")]
    CyclicGraph { nodes: Vec<String> },

    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("node '{node}' is missing required input '{port}'")]
    MissingRequiredInput { node: String, port: String },

    #[error("node '{node}' input '{port}': {message}")]
    TypeMismatch {
        node: String,
        port: String,
        message: String,
    },

    #[error("node '{node}' input '{port}': {message}")]
    TypeCoercion {
        node: String,
        port: String,
        message: String,
    },

    #[error("node '{node}' failed: {source:#}")]
    NodeProcess {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("foreach 'items' must be an array, got {0}")]
    InvalidItems(String),

    #[error("invalid sub-workflow: {0}")]
    InvalidSubWorkflow(String),

    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// The node id this failure is attributed to, when there is one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EngineError::MissingRequiredInput { node, .. }
            | EngineError::TypeMismatch { node, .. }
            | EngineError::TypeCoercion { node, .. }
            | EngineError::NodeProcess { node, .. } => Some(node),
            _ => None,
        }
    }
}
