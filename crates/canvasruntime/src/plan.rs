//! Static analysis of a graph snapshot before it runs: which nodes belong
//! to the regions of loop and parallel nodes, and what each node waits on.

use canvascore::{Graph, NodeId, NodeKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Region behind each owner port, e.g. `(loop, "item")`.
    port_regions: HashMap<(NodeId, String), BTreeSet<NodeId>>,
    /// Union of an owner's port regions.
    owner_regions: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// Nodes outside an owner's region that feed into it.
    region_feeds: HashMap<NodeId, BTreeSet<NodeId>>,
    /// Nodes with no outbound connection.
    sinks: BTreeSet<NodeId>,
}

impl Plan {
    pub fn build(graph: &Graph) -> Self {
        let mut digraph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        for id in graph.node_ids() {
            index.insert(id, digraph.add_node(id));
        }
        for conn in graph.connections() {
            if let (Some(&a), Some(&b)) = (index.get(&conn.from.node_id), index.get(&conn.to.node_id))
            {
                digraph.add_edge(a, b, ());
            }
        }

        let mut plan = Plan::default();
        for node in graph.nodes() {
            if graph.outbound(node.id).next().is_none() {
                plan.sinks.insert(node.id);
            }
            if !node.kind.owns_region() {
                continue;
            }
            let ports: Vec<String> = match node.kind {
                NodeKind::Loop => vec!["item".to_string()],
                _ => graph
                    .node_type_of(node)
                    .map(|ty| {
                        ty.active_outputs(&node.properties)
                            .into_iter()
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            };

            let mut union = BTreeSet::new();
            for port in ports {
                let mut region = BTreeSet::new();
                for conn in graph.outbound_from_port(node.id, &port) {
                    let Some(&start) = index.get(&conn.to.node_id) else {
                        continue;
                    };
                    let mut dfs = Dfs::new(&digraph, start);
                    while let Some(ix) = dfs.next(&digraph) {
                        region.insert(digraph[ix]);
                    }
                }
                union.extend(region.iter().copied());
                plan.port_regions.insert((node.id, port), region);
            }

            let feeds: BTreeSet<NodeId> = graph
                .connections()
                .filter(|c| union.contains(&c.to.node_id))
                .map(|c| c.from.node_id)
                .filter(|from| *from != node.id && !union.contains(from))
                .collect();
            plan.region_feeds.insert(node.id, feeds);
            plan.owner_regions.insert(node.id, union);
        }
        plan
    }

    pub fn port_region(&self, owner: NodeId, port: &str) -> Option<&BTreeSet<NodeId>> {
        self.port_regions.get(&(owner, port.to_string()))
    }

    pub fn owner_region(&self, owner: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.owner_regions.get(&owner)
    }

    pub fn region_feeds(&self, owner: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.region_feeds.get(&owner)
    }

    /// Members of `scope` run by some other member's sub-executions rather
    /// than by the scope itself.
    pub fn delegated(&self, scope: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        self.owner_regions
            .iter()
            .filter(|(owner, _)| scope.contains(owner))
            .flat_map(|(_, region)| region.iter().copied())
            .collect()
    }

    pub fn is_sink(&self, node: NodeId) -> bool {
        self.sinks.contains(&node)
    }
}
