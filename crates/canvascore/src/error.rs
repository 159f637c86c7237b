use crate::graph::{ConnectionId, NodeId, PortRef};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by editing operations on a [`crate::Graph`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Node {node} has no property '{key}'")]
    UnknownProperty { node: NodeId, key: String },

    #[error("Invalid value for property '{key}' on {node}: {reason}")]
    InvalidProperty {
        node: NodeId,
        key: String,
        reason: String,
    },

    #[error("Document uses id 0 for a {0}; ids start at 1")]
    ZeroId(&'static str),

    #[error("Document repeats {kind} id {id}")]
    DuplicateId { kind: &'static str, id: u32 },

    #[error("No ids left in this graph")]
    IdsExhausted,

    #[error("Template references unknown node '{0}'")]
    UnknownTemplateNode(String),

    #[error("Connection rejected: {0}")]
    Rejected(#[from] ConnectionRejection),
}

/// Reasons the connection validator refuses a proposed edge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionRejection {
    #[error("{node} cannot be connected to itself")]
    SelfConnection { node: NodeId },

    #[error("{node} has no port named '{port}'")]
    UnknownPort { node: NodeId, port: String },

    #[error("{from} -> {to} must join exactly one output port to one input port")]
    PortDirection { from: PortRef, to: PortRef },

    #[error("{from} -> {to} already exists")]
    Duplicate { from: PortRef, to: PortRef },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Structural,
    Schema,
    Cycle,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::Structural => write!(f, "structural"),
            IssueKind::Schema => write!(f, "schema"),
            IssueKind::Cycle => write!(f, "cycle"),
        }
    }
}

/// A problem that prevents a graph from running.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{kind} error: {message}")]
pub struct WorkflowIssue {
    pub kind: IssueKind,
    pub nodes: Vec<NodeId>,
    pub message: String,
}

impl WorkflowIssue {
    pub fn structural(nodes: Vec<NodeId>, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Structural,
            nodes,
            message: message.into(),
        }
    }

    pub fn schema(node: NodeId, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Schema,
            nodes: vec![node],
            message: message.into(),
        }
    }

    pub fn cycle(nodes: Vec<NodeId>) -> Self {
        let names: Vec<String> = nodes.iter().map(ToString::to_string).collect();
        Self {
            kind: IssueKind::Cycle,
            message: format!("cycle through {}", names.join(", ")),
            nodes,
        }
    }

    pub fn involves(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow is invalid ({} error(s))", .0.len())]
    Invalid(Vec<WorkflowIssue>),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template '{name}' is malformed: {source}")]
    Template {
        name: String,
        #[source]
        source: GraphError,
    },
}

impl WorkflowError {
    /// Issues carried by an `Invalid` error; empty for the other variants.
    pub fn issues(&self) -> &[WorkflowIssue] {
        match self {
            WorkflowError::Invalid(issues) => issues,
            _ => &[],
        }
    }
}

/// Runtime failure of a single node. Localised to that node's downstream subgraph.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No capability provider registered for '{0}'")]
    ProviderNotFound(String),

    #[error("Provider '{provider_id}' failed: {message}")]
    Provider {
        provider_id: String,
        message: String,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Errors from parsing or evaluating a transform / predicate expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("{0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

impl From<ExprError> for NodeError {
    fn from(e: ExprError) -> Self {
        NodeError::Expression(e.to_string())
    }
}
