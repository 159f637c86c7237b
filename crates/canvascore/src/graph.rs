use crate::arena::Arena;
use crate::registry::{NodeKind, NodeType, NodeTypeRegistry};
use crate::validator::ConnectionValidator;
use crate::{GraphError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Opaque handle to a node within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Opaque handle to a connection within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A named port on a specific node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRef {
    pub node_id: NodeId,
    pub port: String,
}

impl PortRef {
    pub fn new(node_id: NodeId, port: impl Into<String>) -> Self {
        Self {
            node_id,
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.port)
    }
}

/// Node position on the canvas. Has no effect on execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub from: PortRef,
    pub to: PortRef,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub node_type: String,
    pub kind: NodeKind,
    pub properties: BTreeMap<String, Value>,
    pub position: Position,
    inputs: BTreeMap<String, Vec<ConnectionId>>,
    outputs: BTreeMap<String, Vec<ConnectionId>>,
}

impl Node {
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Connection bound to an input port, if any.
    pub fn input_binding(&self, port: &str) -> Option<ConnectionId> {
        self.inputs.get(port).and_then(|ids| ids.first()).copied()
    }

    /// Connections fanning out of an output port.
    pub fn output_bindings(&self, port: &str) -> &[ConnectionId] {
        self.outputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every connection touching this node.
    pub fn bound_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.inputs.values().flatten().copied().collect();
        ids.extend(self.outputs.values().flatten().copied());
        ids.sort();
        ids.dedup();
        ids
    }
}

/// A workflow graph: nodes and connections in arena storage.
///
/// Execution only ever reads a graph; `run` works on a private clone.
#[derive(Debug, Clone)]
pub struct Graph {
    registry: Arc<NodeTypeRegistry>,
    nodes: Arena<Node>,
    connections: Arena<Connection>,
}

impl Graph {
    pub fn new(registry: Arc<NodeTypeRegistry>) -> Self {
        Self {
            registry,
            nodes: Arena::new(),
            connections: Arena::new(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeTypeRegistry> {
        &self.registry
    }

    pub fn node_type_of(&self, node: &Node) -> Result<&NodeType, GraphError> {
        self.registry.get_node_type(&node.node_type)
    }

    /// Place a new node seeded with its schema defaults.
    pub fn add_node(&mut self, node_type: &str, position: Position) -> Result<NodeId, GraphError> {
        let ty = self.registry.get_node_type(node_type)?;
        let raw = self
            .nodes
            .push_with(|raw| Node {
                id: NodeId(raw),
                node_type: ty.id.clone(),
                kind: ty.kind,
                properties: ty.default_properties(),
                position,
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
            })
            .ok_or(GraphError::IdsExhausted)?;
        let id = NodeId(raw);
        tracing::debug!("Added {} ({})", id, node_type);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn require_node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.node(id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Nodes in declaration (id) order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|(_, node)| node)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|(id, _)| NodeId(id)).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    /// Connections in id order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().map(|(_, c)| c)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn inbound(&self, node: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections().filter(move |c| c.to.node_id == node)
    }

    pub fn outbound(&self, node: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections().filter(move |c| c.from.node_id == node)
    }

    pub fn outbound_from_port<'a>(
        &'a self,
        node: NodeId,
        port: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.outbound(node).filter(move |c| c.from.port == port)
    }

    /// Set a property after checking it against the node type's schema.
    pub fn set_property(
        &mut self,
        id: NodeId,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let value = value.into();
        let node = self.nodes.get(id.0).ok_or(GraphError::NodeNotFound(id))?;
        let ty = self.registry.get_node_type(&node.node_type)?;
        let schema = ty.properties.get(key).ok_or_else(|| GraphError::UnknownProperty {
            node: id,
            key: key.to_string(),
        })?;
        schema.check(&value).map_err(|reason| GraphError::InvalidProperty {
            node: id,
            key: key.to_string(),
            reason,
        })?;

        if let Some(node) = self.nodes.get_mut(id.0) {
            node.properties.insert(key.to_string(), value);
        }
        Ok(())
    }

    pub fn set_position(&mut self, id: NodeId, x: f32, y: f32) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(id.0).ok_or(GraphError::NodeNotFound(id))?;
        node.position = Position { x, y };
        Ok(())
    }

    /// Delete a node together with every connection bound to its ports.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        let bound = self.require_node(id)?.bound_connections();
        for conn_id in bound {
            self.detach(conn_id);
        }
        let node = self.nodes.remove(id.0).ok_or(GraphError::NodeNotFound(id))?;
        tracing::debug!("Removed {} and its connections", id);
        Ok(node)
    }

    /// Propose a connection. The validator normalises the endpoint order and
    /// rejects self, direction and duplicate violations; an existing binding
    /// on the target input port is replaced.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<ConnectionId, GraphError> {
        let (from, to) = ConnectionValidator::validate(&from, &to, self)?;

        let replaced = self
            .node(to.node_id)
            .and_then(|node| node.input_binding(&to.port));
        if let Some(old) = replaced {
            tracing::debug!("Replacing {} on {}", old, to);
            self.detach(old);
        }

        let raw = self
            .connections
            .push_with(|raw| Connection {
                id: ConnectionId(raw),
                from: from.clone(),
                to: to.clone(),
            })
            .ok_or(GraphError::IdsExhausted)?;
        let id = ConnectionId(raw);
        self.bind(id, &from, &to);
        Ok(id)
    }

    pub fn disconnect(&mut self, id: ConnectionId) -> Result<Connection, GraphError> {
        self.detach(id).ok_or(GraphError::ConnectionNotFound(id))
    }

    fn bind(&mut self, id: ConnectionId, from: &PortRef, to: &PortRef) {
        if let Some(node) = self.nodes.get_mut(from.node_id.0) {
            node.outputs.entry(from.port.clone()).or_default().push(id);
        }
        if let Some(node) = self.nodes.get_mut(to.node_id.0) {
            node.inputs.entry(to.port.clone()).or_default().push(id);
        }
    }

    fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(id.0)?;
        if let Some(node) = self.nodes.get_mut(conn.from.node_id.0) {
            if let Some(ids) = node.outputs.get_mut(&conn.from.port) {
                ids.retain(|c| *c != id);
                if ids.is_empty() {
                    node.outputs.remove(&conn.from.port);
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(conn.to.node_id.0) {
            if let Some(ids) = node.inputs.get_mut(&conn.to.port) {
                ids.retain(|c| *c != id);
                if ids.is_empty() {
                    node.inputs.remove(&conn.to.port);
                }
            }
        }
        Some(conn)
    }

    /// Immutable serialisable snapshot of the current graph.
    pub fn save(&self) -> GraphDocument {
        GraphDocument {
            nodes: self
                .nodes()
                .map(|node| NodeDocument {
                    id: node.id,
                    node_type: node.node_type.clone(),
                    x: node.position.x,
                    y: node.position.y,
                    properties: node.properties.clone(),
                })
                .collect(),
            connections: self.connections().cloned().collect(),
        }
    }

    /// Load a saved snapshot, keeping its ids.
    ///
    /// Property values and connections are taken as-is so that `validate`
    /// can report what is wrong with them. Unknown node types, id 0 and
    /// repeated ids fail here.
    pub fn from_document(
        document: &GraphDocument,
        registry: Arc<NodeTypeRegistry>,
    ) -> Result<Self, GraphError> {
        let mut graph = Graph::new(registry);
        for doc in &document.nodes {
            let ty = graph.registry.get_node_type(&doc.node_type)?;
            let mut properties = ty.default_properties();
            properties.extend(doc.properties.clone());
            let node = Node {
                id: doc.id,
                node_type: ty.id.clone(),
                kind: ty.kind,
                properties,
                position: Position { x: doc.x, y: doc.y },
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
            };
            if graph.nodes.insert_at(doc.id.0, node).is_err() {
                return Err(Self::id_error("node", doc.id.0));
            }
        }
        for conn in &document.connections {
            if graph.connections.insert_at(conn.id.0, conn.clone()).is_err() {
                return Err(Self::id_error("connection", conn.id.0));
            }
            graph.bind(conn.id, &conn.from, &conn.to);
        }
        Ok(graph)
    }

    fn id_error(kind: &'static str, id: u32) -> GraphError {
        if id == 0 {
            GraphError::ZeroId(kind)
        } else {
            GraphError::DuplicateId { kind, id }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Saved form of a [`Graph`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub nodes: Vec<NodeDocument>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}
