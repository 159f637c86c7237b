use canvascore::{ExecutionId, NodeError, NodeId, SkipReason, Value};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    Skipped { reason: SkipReason },
}

impl NodeStatus {
    /// Precedence when one node settles several times (loop bodies,
    /// branches sharing a node): a failure outranks a completion, which
    /// outranks a skip.
    fn rank(&self) -> u8 {
        match self {
            NodeStatus::Skipped { .. } => 0,
            NodeStatus::Completed => 1,
            NodeStatus::Failed => 2,
        }
    }

    pub(crate) fn merge_into(self, statuses: &mut BTreeMap<NodeId, NodeStatus>, node: NodeId) {
        match statuses.get(&node) {
            Some(current) if current.rank() >= self.rank() => {}
            _ => {
                statuses.insert(node, self);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub error: NodeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Succeeded,
    Failed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchOutcome {
    pub branch: String,
    pub status: BranchStatus,
}

/// Per-node detail for loop and parallel nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeReport {
    Loop {
        iterations: u32,
        halted_by_predicate: bool,
    },
    Parallel {
        branches: Vec<BranchOutcome>,
    },
}

/// Outcome of one `run`.
///
/// A run that started always produces a result, even when nodes failed;
/// failures are listed per node and Output values recorded elsewhere in
/// the graph are kept.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub outputs: BTreeMap<String, Value>,
    pub failures: Vec<NodeFailure>,
    pub statuses: BTreeMap<NodeId, NodeStatus>,
    pub reports: BTreeMap<NodeId, NodeReport>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub fn status(&self, node: NodeId) -> Option<&NodeStatus> {
        self.statuses.get(&node)
    }

    pub fn failure(&self, node: NodeId) -> Option<&NodeError> {
        self.failures
            .iter()
            .find(|f| f.node_id == node)
            .map(|f| &f.error)
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Nodes that actually ran, successfully or not.
    pub fn executed_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, NodeStatus::Completed | NodeStatus::Failed))
            .count()
    }
}
