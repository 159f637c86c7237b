//! Cycle detection over the directed graph induced by connections.

use crate::graph::{Graph, NodeId};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};

fn adjacency(graph: &Graph) -> BTreeMap<NodeId, Vec<NodeId>> {
    let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> =
        graph.node_ids().into_iter().map(|id| (id, Vec::new())).collect();
    for conn in graph.connections() {
        if !adjacency.contains_key(&conn.to.node_id) {
            continue;
        }
        if let Some(targets) = adjacency.get_mut(&conn.from.node_id) {
            targets.push(conn.to.node_id);
        }
    }
    adjacency
}

/// True iff some non-empty closed walk of connections exists.
///
/// Iterative DFS from every unexplored node, tracking the nodes currently
/// on the stack and the nodes fully explored. O(V + E).
pub fn has_cycle(graph: &Graph) -> bool {
    let adjacency = adjacency(graph);
    let mut on_stack: HashSet<NodeId> = HashSet::new();
    let mut explored: HashSet<NodeId> = HashSet::new();

    for &root in adjacency.keys() {
        if explored.contains(&root) {
            continue;
        }
        // (node, index of the next successor to visit)
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        on_stack.insert(root);

        while let Some(&(node, next)) = stack.last() {
            match adjacency[&node].get(next).copied() {
                Some(succ) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    if on_stack.contains(&succ) {
                        return true;
                    }
                    if !explored.contains(&succ) {
                        on_stack.insert(succ);
                        stack.push((succ, 0));
                    }
                }
                None => {
                    stack.pop();
                    on_stack.remove(&node);
                    explored.insert(node);
                }
            }
        }
    }
    false
}

/// Groups of nodes that lie on a common cycle, each sorted by id.
pub fn cycle_groups(graph: &Graph) -> Vec<Vec<NodeId>> {
    let adjacency = adjacency(graph);
    let mut digraph: DiGraph<NodeId, ()> = DiGraph::new();
    let mut index = HashMap::new();
    for &id in adjacency.keys() {
        index.insert(id, digraph.add_node(id));
    }
    for (from, targets) in &adjacency {
        for to in targets {
            digraph.add_edge(index[from], index[to], ());
        }
    }

    let mut groups: Vec<Vec<NodeId>> = tarjan_scc(&digraph)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .map(|&n| digraph.contains_edge(n, n))
                    .unwrap_or(false)
        })
        .map(|component| {
            let mut ids: Vec<NodeId> = component.into_iter().map(|ix| digraph[ix]).collect();
            ids.sort();
            ids
        })
        .collect();
    groups.sort();
    groups
}
