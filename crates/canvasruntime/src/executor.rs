use crate::plan::Plan;
use crate::provider::{CapabilityRequest, ProviderRegistry};
use crate::result::{
    BranchOutcome, BranchStatus, ExecutionResult, NodeFailure, NodeReport, NodeStatus,
};
use crate::semantics;
use canvascore::{
    Bindings, EventBus, ExecutionEvent, ExecutionId, Expression, Graph, Node, NodeConfig,
    NodeError, NodeId, NodeKind, SkipReason, Value,
};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Values fired on a node's output ports, by port name.
type Fired = BTreeMap<String, Value>;

/// Executes validated graphs as an event-driven walk over their
/// connections, running ready nodes concurrently.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    max_parallel: usize,
}

impl ExecutionEngine {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Run a graph snapshot to completion. The graph must already have
    /// passed validation; runtime failures are reported per node in the
    /// returned result rather than as an error.
    pub async fn execute(
        &self,
        graph: Arc<Graph>,
        providers: Arc<ProviderRegistry>,
        event_bus: &EventBus,
        initial: BTreeMap<String, Value>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();

        event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            node_count: graph.node_count(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Starting execution {} ({} nodes)",
            execution_id,
            graph.node_count()
        );

        let configs = graph
            .nodes()
            .map(|node| {
                let config = NodeConfig::from_node(node).map_err(|problems| problems.join("; "));
                (node.id, config)
            })
            .collect();
        let trigger_node = graph
            .nodes()
            .find(|n| n.kind == NodeKind::Input)
            .map(|n| n.id);
        let members: BTreeSet<NodeId> = graph.node_ids().into_iter().collect();

        let ctx = Arc::new(RunContext {
            plan: Plan::build(&graph),
            graph,
            configs,
            providers,
            bus: event_bus.clone(),
            execution_id,
            initial,
            trigger_node,
            cancel,
            max_parallel: self.max_parallel,
        });

        let outcome = execute_scope(ctx, members, Arc::new(Snapshot::default())).await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let result = ExecutionResult {
            execution_id,
            outputs: outcome.outputs,
            failures: outcome.failures,
            statuses: outcome.statuses,
            reports: outcome.reports,
            cancelled: outcome.cancelled,
            duration_ms,
        };

        event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            success: result.is_success(),
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Execution {} finished in {}ms: {} failure(s){}",
            execution_id,
            duration_ms,
            result.failures.len(),
            if result.cancelled { ", cancelled" } else { "" }
        );

        result
    }
}

/// Shared, read-only state of one execution.
struct RunContext {
    graph: Arc<Graph>,
    configs: HashMap<NodeId, Result<NodeConfig, String>>,
    plan: Plan,
    providers: Arc<ProviderRegistry>,
    bus: EventBus,
    execution_id: ExecutionId,
    initial: BTreeMap<String, Value>,
    trigger_node: Option<NodeId>,
    cancel: CancellationToken,
    max_parallel: usize,
}

impl RunContext {
    /// Value an input node starts from: an initial value under its own
    /// name, then the `trigger` value for the first input node, then its
    /// configured literal.
    fn bind_input(&self, id: NodeId, name: &str, configured: &Value) -> Value {
        if let Some(value) = self.initial.get(name) {
            return value.clone();
        }
        if self.trigger_node == Some(id) {
            if let Some(value) = self.initial.get("trigger") {
                return value.clone();
            }
        }
        configured.clone()
    }
}

/// What an enclosing scope had produced when a sub-execution started.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    fired: HashMap<NodeId, Fired>,
    statuses: BTreeMap<NodeId, NodeStatus>,
}

#[derive(Debug, Default)]
struct ScopeOutcome {
    fired: HashMap<NodeId, Fired>,
    statuses: BTreeMap<NodeId, NodeStatus>,
    failures: Vec<NodeFailure>,
    outputs: BTreeMap<String, Value>,
    /// Values recorded by Output nodes, by node.
    recorded: HashMap<NodeId, Value>,
    reports: BTreeMap<NodeId, NodeReport>,
    /// Nodes in the order they completed.
    completion: Vec<NodeId>,
    cancelled: bool,
}

impl ScopeOutcome {
    fn absorb(&mut self, inner: ScopeOutcome) {
        for (node, status) in inner.statuses {
            status.merge_into(&mut self.statuses, node);
        }
        self.fired.extend(inner.fired);
        self.failures.extend(inner.failures);
        self.outputs.extend(inner.outputs);
        self.recorded.extend(inner.recorded);
        self.reports.extend(inner.reports);
        self.completion.extend(inner.completion);
        self.cancelled |= inner.cancelled;
    }
}

/// Result of running a single node.
#[derive(Debug, Default)]
struct NodeRun {
    fired: Fired,
    recorded: Option<(String, Value)>,
    inner: Option<ScopeOutcome>,
    report: Option<NodeReport>,
    /// Set when the node stopped on an error after part of its work had
    /// settled. `inner` and `report` still describe that part.
    failed: Option<NodeError>,
}

impl NodeRun {
    fn fire(port: &str, value: Value) -> Self {
        let mut fired = Fired::new();
        fired.insert(port.to_string(), value);
        Self {
            fired,
            ..Self::default()
        }
    }
}

type Settled = (NodeId, Result<NodeRun, NodeError>, u64);

/// Run `members` as one scope. Loop and parallel nodes call back into
/// this for their regions, hence the boxed future.
fn execute_scope(
    ctx: Arc<RunContext>,
    members: BTreeSet<NodeId>,
    outer: Arc<Snapshot>,
) -> BoxFuture<'static, ScopeOutcome> {
    Box::pin(async move { Scope::new(ctx, members, outer).run().await })
}

struct Scope {
    ctx: Arc<RunContext>,
    outer: Arc<Snapshot>,
    /// Runnable members and the members each one waits on.
    deps: BTreeMap<NodeId, BTreeSet<NodeId>>,
    settled: HashSet<NodeId>,
    outcome: ScopeOutcome,
}

impl Scope {
    fn new(ctx: Arc<RunContext>, members: BTreeSet<NodeId>, outer: Arc<Snapshot>) -> Self {
        let delegated = ctx.plan.delegated(&members);
        let runnable: BTreeSet<NodeId> = members.difference(&delegated).copied().collect();

        let deps = runnable
            .iter()
            .map(|&id| {
                let mut deps: BTreeSet<NodeId> =
                    ctx.graph.inbound(id).map(|c| c.from.node_id).collect();
                if let Some(feeds) = ctx.plan.region_feeds(id) {
                    deps.extend(feeds.iter().copied());
                }
                deps.retain(|dep| *dep != id && runnable.contains(dep));
                (id, deps)
            })
            .collect();

        Self {
            ctx,
            outer,
            deps,
            settled: HashSet::new(),
            outcome: ScopeOutcome::default(),
        }
    }

    async fn run(mut self) -> ScopeOutcome {
        let mut pending: BTreeSet<NodeId> = self.deps.keys().copied().collect();
        let mut running = FuturesUnordered::new();
        let mut in_flight: BTreeSet<NodeId> = BTreeSet::new();

        loop {
            let mut progressed = false;
            let ready: Vec<NodeId> = pending
                .iter()
                .copied()
                .filter(|id| self.is_ready(*id))
                .collect();

            for id in ready {
                if running.len() >= self.ctx.max_parallel {
                    break;
                }
                pending.remove(&id);
                progressed = true;

                if self.ctx.cancel.is_cancelled() {
                    self.outcome.cancelled = true;
                    self.skip(id, SkipReason::Cancelled);
                    continue;
                }
                match self.gather_inputs(id) {
                    Ok(inputs) => {
                        in_flight.insert(id);
                        running.push(self.spawn(id, inputs));
                    }
                    Err(reason) => self.skip(id, reason),
                }
            }

            if running.is_empty() {
                if progressed {
                    continue;
                }
                if !pending.is_empty() {
                    tracing::warn!("{} node(s) never became ready", pending.len());
                    for id in std::mem::take(&mut pending) {
                        self.skip(id, SkipReason::UpstreamFailed);
                    }
                }
                break;
            }

            let next = tokio::select! {
                biased;
                Some(settled) = running.next() => Some(settled),
                _ = self.ctx.cancel.cancelled() => None,
            };
            match next {
                Some((id, result, duration_ms)) => {
                    in_flight.remove(&id);
                    self.finish(id, result, duration_ms);
                }
                None => {
                    tracing::warn!(
                        "Execution {} cancelled with {} node(s) in flight",
                        self.ctx.execution_id,
                        in_flight.len()
                    );
                    self.outcome.cancelled = true;
                    // Dropping the join handles detaches the tasks.
                    running = FuturesUnordered::new();
                    for id in std::mem::take(&mut in_flight) {
                        self.skip(id, SkipReason::Cancelled);
                    }
                }
            }
        }

        self.outcome
    }

    fn is_ready(&self, id: NodeId) -> bool {
        self.deps
            .get(&id)
            .map(|deps| deps.iter().all(|dep| self.settled.contains(dep)))
            .unwrap_or(true)
    }

    fn fired_value(&self, node: NodeId, port: &str) -> Option<&Value> {
        self.outcome
            .fired
            .get(&node)
            .or_else(|| self.outer.fired.get(&node))
            .and_then(|ports| ports.get(port))
    }

    fn status_of(&self, node: NodeId) -> Option<&NodeStatus> {
        self.outcome
            .statuses
            .get(&node)
            .or_else(|| self.outer.statuses.get(&node))
    }

    /// Values on every inbound connection, or why the node cannot run.
    fn gather_inputs(&self, id: NodeId) -> Result<Fired, SkipReason> {
        let mut inputs = Fired::new();
        let mut reason: Option<SkipReason> = None;

        for conn in self.ctx.graph.inbound(id) {
            match self.fired_value(conn.from.node_id, &conn.from.port) {
                Some(value) => {
                    inputs.insert(conn.to.port.clone(), value.clone());
                }
                None => {
                    let missing = match self.status_of(conn.from.node_id) {
                        Some(NodeStatus::Failed)
                        | Some(NodeStatus::Skipped {
                            reason: SkipReason::UpstreamFailed,
                        }) => SkipReason::UpstreamFailed,
                        Some(NodeStatus::Skipped { reason }) => *reason,
                        _ => SkipReason::BranchNotTaken,
                    };
                    reason = Some(match reason {
                        Some(current) if severity(current) >= severity(missing) => current,
                        _ => missing,
                    });
                }
            }
        }

        match reason {
            Some(reason) => Err(reason),
            None => Ok(inputs),
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = (*self.outer).clone();
        snapshot
            .fired
            .extend(self.outcome.fired.iter().map(|(k, v)| (*k, v.clone())));
        snapshot
            .statuses
            .extend(self.outcome.statuses.iter().map(|(k, v)| (*k, v.clone())));
        snapshot
    }

    fn spawn(
        &self,
        id: NodeId,
        inputs: Fired,
    ) -> impl Future<Output = Settled> + Send + 'static {
        let kind = self.ctx.graph.node(id).map(|n| n.kind);
        let snapshot = kind
            .filter(NodeKind::owns_region)
            .map(|_| Arc::new(self.snapshot()));

        if let Some(kind) = kind {
            tracing::debug!("Dispatching {} ({})", id, kind);
            self.ctx.bus.emit(ExecutionEvent::NodeStarted {
                execution_id: self.ctx.execution_id,
                node_id: id,
                kind,
                timestamp: Utc::now(),
            });
        }

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let result = run_node(ctx, id, inputs, snapshot).await;
            (result, start.elapsed().as_millis() as u64)
        });

        async move {
            match handle.await {
                Ok((result, duration_ms)) => (id, result, duration_ms),
                Err(e) => {
                    let message = if e.is_panic() {
                        let payload = e.into_panic();
                        let detail = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown cause".to_string());
                        format!("node panicked: {}", detail)
                    } else {
                        format!("node task ended: {}", e)
                    };
                    (id, Err(NodeError::ExecutionFailed(message)), 0)
                }
            }
        }
    }

    fn finish(&mut self, id: NodeId, result: Result<NodeRun, NodeError>, duration_ms: u64) {
        self.settled.insert(id);
        let execution_id = self.ctx.execution_id;

        match result {
            Ok(NodeRun {
                failed: Some(error),
                inner,
                report,
                ..
            }) => {
                if let Some(report) = report {
                    self.outcome.reports.insert(id, report);
                }
                if let Some(inner) = inner {
                    self.outcome.absorb(inner);
                }
                self.fail(id, error);
            }
            Ok(run) => {
                let mut outputs = run.fired.clone();
                if let Some((name, value)) = &run.recorded {
                    outputs.insert(name.clone(), value.clone());
                }
                tracing::info!("Node {} completed in {}ms", id, duration_ms);
                self.ctx.bus.emit(ExecutionEvent::NodeCompleted {
                    execution_id,
                    node_id: id,
                    outputs,
                    duration_ms,
                    timestamp: Utc::now(),
                });

                NodeStatus::Completed.merge_into(&mut self.outcome.statuses, id);
                if let Some((name, value)) = run.recorded {
                    self.outcome.outputs.insert(name, value.clone());
                    self.outcome.recorded.insert(id, value);
                }
                if let Some(report) = run.report {
                    self.outcome.reports.insert(id, report);
                }
                if let Some(inner) = run.inner {
                    self.outcome.absorb(inner);
                }
                self.outcome.completion.push(id);
                self.outcome.fired.insert(id, run.fired);
                self.fill_region(id, SkipReason::BranchNotTaken);
            }
            Err(error) => self.fail(id, error),
        }
    }

    fn fail(&mut self, id: NodeId, error: NodeError) {
        tracing::error!("Node {} failed: {}", id, error);
        self.ctx.bus.emit(ExecutionEvent::NodeFailed {
            execution_id: self.ctx.execution_id,
            node_id: id,
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        NodeStatus::Failed.merge_into(&mut self.outcome.statuses, id);
        self.outcome.failures.push(NodeFailure { node_id: id, error });
        self.fill_region(id, SkipReason::UpstreamFailed);
    }

    fn skip(&mut self, id: NodeId, reason: SkipReason) {
        self.settled.insert(id);
        self.mark_skipped(id, reason);
        self.fill_region(id, reason);
    }

    fn mark_skipped(&mut self, id: NodeId, reason: SkipReason) {
        tracing::debug!("Skipping {} ({})", id, reason);
        NodeStatus::Skipped { reason }.merge_into(&mut self.outcome.statuses, id);
        self.ctx.bus.emit(ExecutionEvent::NodeSkipped {
            execution_id: self.ctx.execution_id,
            node_id: id,
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Give every region node of `owner` that never settled a skip status.
    fn fill_region(&mut self, owner: NodeId, reason: SkipReason) {
        let ctx = self.ctx.clone();
        if let Some(region) = ctx.plan.owner_region(owner) {
            for &node in region {
                if !self.outcome.statuses.contains_key(&node) {
                    self.mark_skipped(node, reason);
                }
            }
        }
    }
}

fn severity(reason: SkipReason) -> u8 {
    match reason {
        SkipReason::BranchNotTaken => 0,
        SkipReason::Discarded => 1,
        SkipReason::Cancelled => 2,
        SkipReason::UpstreamFailed => 3,
    }
}

async fn run_node(
    ctx: Arc<RunContext>,
    id: NodeId,
    inputs: Fired,
    snapshot: Option<Arc<Snapshot>>,
) -> Result<NodeRun, NodeError> {
    let node = ctx
        .graph
        .node(id)
        .ok_or_else(|| NodeError::ExecutionFailed(format!("{} is not in the graph", id)))?;
    let config = match ctx.configs.get(&id) {
        Some(Ok(config)) => config,
        Some(Err(problems)) => return Err(NodeError::Configuration(problems.clone())),
        None => return Err(NodeError::Configuration(format!("{} has no configuration", id))),
    };
    let input = inputs.get("input").cloned().unwrap_or_default();

    match config {
        NodeConfig::Input {
            name,
            input_type,
            value,
        } => {
            let raw = ctx.bind_input(id, name, value);
            let value = semantics::coerce_input(raw, *input_type, name)?;
            Ok(NodeRun::fire("output", value))
        }
        NodeConfig::Output { output_name } => Ok(NodeRun {
            recorded: Some((output_name.clone(), input)),
            ..NodeRun::default()
        }),
        NodeConfig::CapabilityCall { provider_id, .. } => {
            call_capability(&ctx, node, provider_id, inputs).await
        }
        NodeConfig::Decision {
            operator,
            threshold,
            case_sensitive,
            field,
        } => {
            let subject = match field {
                Some(path) => input.get_path(path),
                None => input.clone(),
            };
            let verdict = semantics::decide(&subject, *operator, threshold, *case_sensitive)?;
            tracing::debug!("Decision {} took the {} branch", id, verdict);
            Ok(NodeRun::fire(if verdict { "true" } else { "false" }, input))
        }
        NodeConfig::Transform {
            operation,
            expression,
            seed,
        } => {
            let value = semantics::transform(&input, *operation, expression, seed.as_ref())?;
            Ok(NodeRun::fire("output", value))
        }
        NodeConfig::Loop {
            max_iterations,
            break_condition,
        } => {
            run_loop(
                ctx.clone(),
                id,
                &inputs,
                *max_iterations,
                break_condition.as_ref(),
                snapshot.unwrap_or_default(),
            )
            .await
        }
        NodeConfig::Parallel { wait_for_all, .. } => {
            run_parallel(
                ctx.clone(),
                node,
                input,
                *wait_for_all,
                snapshot.unwrap_or_default(),
            )
            .await
        }
    }
}

async fn call_capability(
    ctx: &RunContext,
    node: &Node,
    provider_id: &str,
    inputs: Fired,
) -> Result<NodeRun, NodeError> {
    let provider = ctx
        .providers
        .get(provider_id)
        .ok_or_else(|| NodeError::ProviderNotFound(provider_id.to_string()))?;
    let node_type = ctx
        .graph
        .node_type_of(node)
        .map_err(|e| NodeError::Configuration(e.to_string()))?;

    let events = ctx.bus.create_emitter(ctx.execution_id, node.id);
    let request = CapabilityRequest {
        node_id: node.id,
        node_type: node.node_type.clone(),
        inputs,
        properties: node.properties.clone(),
        events: events.clone(),
        cancellation: ctx.cancel.child_token(),
    };

    tracing::debug!("Invoking provider '{}' for {}", provider_id, node.id);
    let response = provider
        .invoke(&node.node_type, request)
        .await
        .map_err(|e| NodeError::Provider {
            provider_id: provider_id.to_string(),
            message: e.to_string(),
        })?;

    let ports = node_type.active_outputs(&node.properties);
    let (fired, missing) = semantics::map_response(&ports, response.outputs);
    for port in missing {
        tracing::warn!(
            "Provider '{}' returned no '{}' field for {}",
            provider_id,
            port,
            node.id
        );
        events.warn(format!("response has no '{}' field; port set to null", port));
    }

    Ok(NodeRun {
        fired,
        ..NodeRun::default()
    })
}

/// First completed sink of a loop body: an Output node's recorded value,
/// otherwise the sink's first fired port.
fn iteration_result(ctx: &RunContext, body: &BTreeSet<NodeId>, outcome: &ScopeOutcome) -> Value {
    for node in &outcome.completion {
        if !body.contains(node) || !ctx.plan.is_sink(*node) {
            continue;
        }
        if let Some(value) = outcome.recorded.get(node) {
            return value.clone();
        }
        let Some(fired) = outcome.fired.get(node) else {
            continue;
        };
        let ports = ctx
            .graph
            .node(*node)
            .and_then(|n| ctx.graph.node_type_of(n).ok())
            .map(|ty| ty.outputs.clone())
            .unwrap_or_default();
        if let Some(value) = ports.iter().find_map(|port| fired.get(port)) {
            return value.clone();
        }
    }
    Value::Null
}

async fn run_loop(
    ctx: Arc<RunContext>,
    id: NodeId,
    inputs: &Fired,
    max_iterations: u32,
    break_condition: Option<&Expression>,
    snapshot: Arc<Snapshot>,
) -> Result<NodeRun, NodeError> {
    let collection = inputs
        .get("iterator")
        .or_else(|| inputs.get("input"))
        .cloned()
        .unwrap_or_default();
    let items = collection.as_array().map(<[Value]>::to_vec);
    let body = ctx.plan.port_region(id, "item").cloned().unwrap_or_default();

    let mut next_item = match &items {
        Some(items) => items.first().cloned(),
        None => Some(collection.clone()),
    };
    let mut results = Vec::new();
    let mut aggregate = ScopeOutcome::default();
    let mut per_output: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut per_node: HashMap<NodeId, Vec<Value>> = HashMap::new();
    let mut halted = false;
    let mut failed = None;

    for i in 0..max_iterations {
        let Some(item) = next_item.take() else {
            break;
        };
        if ctx.cancel.is_cancelled() {
            aggregate.cancelled = true;
            break;
        }

        let result = if body.is_empty() {
            item.clone()
        } else {
            let mut scope = (*snapshot).clone();
            let mut seed = Fired::new();
            seed.insert("item".to_string(), item.clone());
            scope.fired.insert(id, seed);

            let outcome = execute_scope(ctx.clone(), body.clone(), Arc::new(scope)).await;
            let result = iteration_result(&ctx, &body, &outcome);
            for (name, value) in &outcome.outputs {
                per_output.entry(name.clone()).or_default().push(value.clone());
            }
            for (node, value) in &outcome.recorded {
                per_node.entry(*node).or_default().push(value.clone());
            }
            aggregate.absorb(outcome);
            result
        };
        results.push(result.clone());

        if let Some(condition) = break_condition {
            let mut bindings = Bindings::new();
            bindings.insert("x", result.clone());
            bindings.insert("item", item);
            bindings.insert("i", Value::from(i));
            match condition.evaluate(&bindings) {
                Ok(verdict) if verdict.is_truthy() => {
                    halted = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("break_condition of {} failed on iteration {}: {}", id, i, e);
                    failed = Some(NodeError::from(e));
                    break;
                }
            }
        }

        next_item = match &items {
            Some(items) => items.get(i as usize + 1).cloned(),
            None => Some(result),
        };
    }

    let iterations = results.len() as u32;
    tracing::debug!(
        "Loop {} ran {} iteration(s){}",
        id,
        iterations,
        if halted { ", halted by break_condition" } else { "" }
    );

    aggregate.outputs = per_output
        .into_iter()
        .map(|(name, values)| (name, Value::Array(values)))
        .collect();
    aggregate.recorded = per_node
        .into_iter()
        .map(|(node, values)| (node, Value::Array(values)))
        .collect();

    Ok(NodeRun {
        fired: NodeRun::fire("complete", Value::Array(results)).fired,
        recorded: None,
        inner: Some(aggregate),
        report: Some(NodeReport::Loop {
            iterations,
            halted_by_predicate: halted,
        }),
        failed,
    })
}

async fn run_parallel(
    ctx: Arc<RunContext>,
    node: &Node,
    input: Value,
    wait_for_all: bool,
    snapshot: Arc<Snapshot>,
) -> Result<NodeRun, NodeError> {
    let id = node.id;
    let ports: Vec<String> = ctx
        .graph
        .node_type_of(node)
        .map_err(|e| NodeError::Configuration(e.to_string()))?
        .active_outputs(&node.properties)
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut fired = Fired::new();
    let mut tasks = FuturesUnordered::new();
    let mut regions: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
    for port in ports {
        fired.insert(port.clone(), input.clone());
        if ctx.graph.outbound_from_port(id, &port).next().is_none() {
            continue;
        }
        let region = ctx.plan.port_region(id, &port).cloned().unwrap_or_default();

        let mut scope = (*snapshot).clone();
        let mut seed = Fired::new();
        seed.insert(port.clone(), input.clone());
        scope.fired.insert(id, seed);

        let handle = tokio::spawn(execute_scope(ctx.clone(), region.clone(), Arc::new(scope)));
        regions.insert(port.clone(), region);
        tasks.push(async move { (port, handle.await) });
    }

    let mut inner = ScopeOutcome::default();
    let mut statuses: BTreeMap<String, BranchStatus> = BTreeMap::new();
    let settle = |port: &str, joined: Result<ScopeOutcome, tokio::task::JoinError>, inner: &mut ScopeOutcome| {
        match joined {
            Ok(outcome) => {
                let status = if outcome.failures.is_empty() {
                    BranchStatus::Succeeded
                } else {
                    BranchStatus::Failed
                };
                inner.absorb(outcome);
                status
            }
            Err(e) => {
                tracing::error!("Branch {} of {} did not finish: {}", port, id, e);
                BranchStatus::Failed
            }
        }
    };

    if wait_for_all {
        while let Some((port, joined)) = tasks.next().await {
            let status = settle(&port, joined, &mut inner);
            statuses.insert(port, status);
        }
    } else if let Some((winner, joined)) = tasks.next().await {
        let status = settle(&winner, joined, &mut inner);
        tracing::info!("Branch {} of {} settled first", winner, id);
        // The other branches keep running detached; their results are dropped.
        drop(tasks);

        let kept = regions.get(&winner).cloned().unwrap_or_default();
        for (port, region) in &regions {
            if *port == winner {
                continue;
            }
            statuses.insert(port.clone(), BranchStatus::Discarded);
            for &member in region.difference(&kept) {
                if inner.statuses.contains_key(&member) {
                    continue;
                }
                inner.statuses.insert(
                    member,
                    NodeStatus::Skipped {
                        reason: SkipReason::Discarded,
                    },
                );
                ctx.bus.emit(ExecutionEvent::NodeSkipped {
                    execution_id: ctx.execution_id,
                    node_id: member,
                    reason: SkipReason::Discarded,
                    timestamp: Utc::now(),
                });
            }
        }
        statuses.insert(winner, status);
    }

    let branches = statuses
        .into_iter()
        .map(|(branch, status)| BranchOutcome { branch, status })
        .collect();

    Ok(NodeRun {
        fired,
        recorded: None,
        inner: Some(inner),
        report: Some(NodeReport::Parallel { branches }),
        ..NodeRun::default()
    })
}
