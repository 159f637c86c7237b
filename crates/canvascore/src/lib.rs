//! Core model of the canvas engine
//!
//! Node type registry, graph editing, connection and cycle checks,
//! whole-graph validation, templates and the execution event types.
//! Nothing here performs I/O beyond loading template files.

mod arena;
pub mod config;
pub mod cycle;
mod error;
pub mod events;
pub mod expr;
mod graph;
pub mod registry;
pub mod template;
pub mod validation;
mod validator;
mod value;

pub use config::NodeConfig;
pub use cycle::{cycle_groups, has_cycle};
pub use error::{
    ConnectionRejection, ExprError, FlowError, GraphError, IssueKind, NodeError, WorkflowError,
    WorkflowIssue,
};
pub use events::*;
pub use expr::{Bindings, Expression};
pub use graph::{
    Connection, ConnectionId, Graph, GraphDocument, Node, NodeDocument, NodeId, PortRef, Position,
};
pub use registry::{
    CapabilityContract, NodeKind, NodeType, NodeTypeRegistry, PropertySchema, PropertyType,
};
pub use template::{TemplateStore, WorkflowTemplate};
pub use validation::{validate, ValidationReport, ValidationWarning};
pub use validator::ConnectionValidator;
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
