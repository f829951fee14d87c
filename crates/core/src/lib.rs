pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod logging;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod resolve;
pub mod run;
pub mod server;
pub mod types;

pub use error::EngineError;
pub use executor::{execute, ExecutorOptions};
pub use graph::{Connection, NodeSpec, ValidationReport, WorkflowGraph};
pub use node::{Node, PortDefinition, ProcessContext};
pub use registry::{build_default_registry, NodeRegistry};
pub use run::{NodeStatus, RunReport, RunStatus};
pub use types::PortType;
