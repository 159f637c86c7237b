use canvascore::{
    cycle_groups, has_cycle, Connection, ConnectionId, Graph, GraphDocument, NodeDocument, NodeId,
    NodeTypeRegistry, PortRef,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Transform-only graph with raw edges, bypassing the connection validator.
fn chain(node_count: usize, edges: &[(usize, usize)]) -> Graph {
    let nodes = (1..=node_count as u32)
        .map(|i| NodeDocument {
            id: NodeId::new(i),
            node_type: "transform".to_string(),
            x: 0.0,
            y: 0.0,
            properties: BTreeMap::new(),
        })
        .collect();
    let connections = edges
        .iter()
        .enumerate()
        .map(|(k, &(from, to))| Connection {
            id: ConnectionId::new(k as u32 + 1),
            from: PortRef::new(NodeId::new(from as u32 + 1), "output"),
            to: PortRef::new(NodeId::new(to as u32 + 1), "input"),
        })
        .collect();
    let doc = GraphDocument { nodes, connections };
    Graph::from_document(&doc, Arc::new(NodeTypeRegistry::builtin())).unwrap()
}

#[test]
fn test_two_node_cycle() {
    let g = chain(2, &[(0, 1), (1, 0)]);
    assert!(has_cycle(&g));
    assert_eq!(
        cycle_groups(&g),
        vec![vec![NodeId::new(1), NodeId::new(2)]]
    );
}

#[test]
fn test_self_edge_is_a_cycle() {
    let g = chain(1, &[(0, 0)]);
    assert!(has_cycle(&g));
    assert_eq!(cycle_groups(&g), vec![vec![NodeId::new(1)]]);
}

#[test]
fn test_diamond_is_acyclic() {
    let g = chain(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
    assert!(!has_cycle(&g));
    assert!(cycle_groups(&g).is_empty());
}

#[test]
fn test_separate_cycles_are_grouped() {
    let g = chain(6, &[(0, 1), (1, 0), (2, 3), (3, 4), (4, 2), (4, 5)]);
    let groups = cycle_groups(&g);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0], vec![NodeId::new(1), NodeId::new(2)]);
    assert_eq!(
        groups[1],
        vec![NodeId::new(3), NodeId::new(4), NodeId::new(5)]
    );
}

fn edges(max_nodes: usize) -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2..max_nodes).prop_flat_map(|n| {
        let edge = (0..n, 0..n);
        (Just(n), prop::collection::vec(edge, 0..(n * 2)))
    })
}

proptest! {
    #[test]
    fn forward_edges_never_cycle((n, raw) in edges(12)) {
        let forward: Vec<(usize, usize)> = raw
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect();
        prop_assert!(!has_cycle(&chain(n, &forward)));
    }

    #[test]
    fn reversing_a_path_edge_closes_a_cycle((n, raw) in edges(12)) {
        let mut forward: Vec<(usize, usize)> = raw
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect();
        forward.push((0, n - 1));
        forward.push((n - 1, 0));
        prop_assert!(has_cycle(&chain(n, &forward)));
    }

    #[test]
    fn dfs_agrees_with_scc((n, raw) in edges(10)) {
        let g = chain(n, &raw);
        prop_assert_eq!(has_cycle(&g), !cycle_groups(&g).is_empty());
    }
}
