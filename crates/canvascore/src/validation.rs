//! Whole-graph validation backing the host `validate` command and the
//! pre-flight check of `run`.

use crate::config::NodeConfig;
use crate::cycle::cycle_groups;
use crate::graph::{Graph, Node, NodeId};
use crate::registry::{NodeKind, NodeType};
use crate::{IssueKind, WorkflowIssue};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Advisory finding; never blocks execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationWarning {
    pub node_id: Option<NodeId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<WorkflowIssue>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn errors_of(&self, kind: IssueKind) -> impl Iterator<Item = &WorkflowIssue> {
        self.errors.iter().filter(move |issue| issue.kind == kind)
    }

    /// Append further errors (e.g. from the host) and refresh `is_valid`.
    pub fn extend_errors(&mut self, issues: impl IntoIterator<Item = WorkflowIssue>) {
        self.errors.extend(issues);
        self.is_valid = self.errors.is_empty();
    }
}

/// Validate a graph, reporting every problem found.
///
/// Nodes and connections are visited in id order, so validating an
/// unchanged graph twice yields identical reports.
pub fn validate(graph: &Graph) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_connections(graph, &mut errors);
    check_properties(graph, &mut errors);
    for group in cycle_groups(graph) {
        errors.push(WorkflowIssue::cycle(group));
    }

    warn_unconnected_inputs(graph, &mut warnings);
    warn_unreachable(graph, &mut warnings);
    warn_shared_trigger(graph, &mut warnings);

    if !errors.is_empty() {
        tracing::debug!("Graph validation found {} error(s)", errors.len());
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_connections(graph: &Graph, errors: &mut Vec<WorkflowIssue>) {
    let mut seen = BTreeSet::new();
    let mut inbound: BTreeMap<(NodeId, &str), Vec<String>> = BTreeMap::new();

    for conn in graph.connections() {
        let from = graph.node(conn.from.node_id);
        let to = graph.node(conn.to.node_id);

        let mut dangling = Vec::new();
        if from.is_none() {
            dangling.push(conn.from.node_id);
        }
        if to.is_none() {
            dangling.push(conn.to.node_id);
        }
        if !dangling.is_empty() {
            let names: Vec<String> = dangling.iter().map(ToString::to_string).collect();
            errors.push(WorkflowIssue::structural(
                dangling,
                format!("{} references missing node {}", conn.id, names.join(", ")),
            ));
            continue;
        }
        let (Some(from), Some(to)) = (from, to) else {
            continue;
        };

        if from.id == to.id {
            errors.push(WorkflowIssue::structural(
                vec![from.id],
                format!("{} connects {} to itself", conn.id, from.id),
            ));
        }

        if let Ok(ty) = graph.node_type_of(from) {
            if !ty.has_active_output(&conn.from.port, &from.properties) {
                errors.push(WorkflowIssue::structural(
                    vec![from.id],
                    format!("{} starts at {}, which is not an output port", conn.id, conn.from),
                ));
            }
        }
        if let Ok(ty) = graph.node_type_of(to) {
            if !ty.has_input(&conn.to.port) {
                errors.push(WorkflowIssue::structural(
                    vec![to.id],
                    format!("{} ends at {}, which is not an input port", conn.id, conn.to),
                ));
            }
        }

        if !seen.insert((&conn.from, &conn.to)) {
            errors.push(WorkflowIssue::structural(
                vec![from.id, to.id],
                format!("{} duplicates {} -> {}", conn.id, conn.from, conn.to),
            ));
        }
        inbound
            .entry((to.id, conn.to.port.as_str()))
            .or_default()
            .push(conn.id.to_string());
    }

    for ((node, port), conns) in inbound {
        if conns.len() > 1 {
            errors.push(WorkflowIssue::structural(
                vec![node],
                format!(
                    "input port {}.{} has {} inbound connections ({})",
                    node,
                    port,
                    conns.len(),
                    conns.join(", ")
                ),
            ));
        }
    }
}

fn check_properties(graph: &Graph, errors: &mut Vec<WorkflowIssue>) {
    let mut output_names: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();

    for node in graph.nodes() {
        let Ok(ty) = graph.node_type_of(node) else {
            errors.push(WorkflowIssue::schema(
                node.id,
                format!("{} has unknown type '{}'", node.id, node.node_type),
            ));
            continue;
        };

        let before = errors.len();
        check_schema(node, ty, errors);
        if errors.len() == before {
            match NodeConfig::from_node(node) {
                Ok(NodeConfig::Output { output_name }) => {
                    output_names.entry(output_name).or_default().push(node.id);
                }
                Ok(_) => {}
                Err(problems) => {
                    for problem in problems {
                        errors.push(WorkflowIssue::schema(
                            node.id,
                            format!("{}: {}", node.id, problem),
                        ));
                    }
                }
            }
        }
    }

    for (name, nodes) in output_names {
        if nodes.len() > 1 {
            let names: Vec<String> = nodes.iter().map(ToString::to_string).collect();
            errors.push(WorkflowIssue {
                kind: IssueKind::Schema,
                message: format!(
                    "output name '{}' is written by several nodes: {}",
                    name,
                    names.join(", ")
                ),
                nodes,
            });
        }
    }
}

fn check_schema(node: &Node, ty: &NodeType, errors: &mut Vec<WorkflowIssue>) {
    for key in node.properties.keys() {
        if !ty.properties.contains_key(key) {
            errors.push(WorkflowIssue::schema(
                node.id,
                format!("{} has unknown property '{}'", node.id, key),
            ));
        }
    }
    for (key, schema) in &ty.properties {
        let value = node.properties.get(key);
        match value {
            Some(value) if !value.is_empty() => {
                if let Err(reason) = schema.check(value) {
                    errors.push(WorkflowIssue::schema(
                        node.id,
                        format!("{}: property '{}' {}", node.id, key, reason),
                    ));
                }
            }
            _ if schema.required => {
                errors.push(WorkflowIssue::schema(
                    node.id,
                    format!("{}: required property '{}' is empty", node.id, key),
                ));
            }
            _ => {}
        }
    }
}

fn warn_unconnected_inputs(graph: &Graph, warnings: &mut Vec<ValidationWarning>) {
    for node in graph.nodes() {
        let unconnected = match node.kind {
            NodeKind::Output | NodeKind::Decision | NodeKind::Transform | NodeKind::Parallel => {
                node.input_binding("input").is_none()
            }
            NodeKind::Loop => {
                node.input_binding("input").is_none() && node.input_binding("iterator").is_none()
            }
            NodeKind::Input | NodeKind::CapabilityCall => false,
        };
        if unconnected {
            warnings.push(ValidationWarning {
                node_id: Some(node.id),
                message: format!("{} ({}) has no inbound connection", node.id, node.kind),
            });
        }
    }
}

fn warn_unreachable(graph: &Graph, warnings: &mut Vec<ValidationWarning>) {
    let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for conn in graph.connections() {
        successors
            .entry(conn.from.node_id)
            .or_default()
            .push(conn.to.node_id);
    }

    let mut reached: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = graph
        .nodes()
        .filter(|n| n.kind == NodeKind::Input)
        .map(|n| n.id)
        .collect();
    while let Some(id) = queue.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        if let Some(next) = successors.get(&id) {
            queue.extend(next.iter().copied());
        }
    }

    for node in graph.nodes() {
        if !reached.contains(&node.id) {
            warnings.push(ValidationWarning {
                node_id: Some(node.id),
                message: format!("{} is unreachable from any input node", node.id),
            });
        }
    }
}

fn warn_shared_trigger(graph: &Graph, warnings: &mut Vec<ValidationWarning>) {
    let inputs: Vec<&Node> = graph.nodes().filter(|n| n.kind == NodeKind::Input).collect();
    if inputs.len() > 1 {
        warnings.push(ValidationWarning {
            node_id: Some(inputs[0].id),
            message: format!(
                "{} input nodes; an unnamed trigger value binds to {}",
                inputs.len(),
                inputs[0].id
            ),
        });
    }
}
