use async_trait::async_trait;
use canvascore::{
    ExecutionEvent, Graph, IssueKind, NodeError, NodeId, PortRef, Position, SkipReason, Value,
    WorkflowError,
};
use canvasruntime::{
    BranchOutcome, BranchStatus, CancellationToken, CapabilityError, CapabilityProvider,
    CapabilityRequest, CapabilityResponse, FlowRuntime, NodeReport, NodeStatus, ProviderRegistry,
    RuntimeConfig,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Returns the same outputs for every call and remembers the inputs it saw.
struct Fixed {
    id: &'static str,
    outputs: BTreeMap<String, Value>,
    seen: Mutex<Vec<BTreeMap<String, Value>>>,
}

impl Fixed {
    fn new(id: &'static str, outputs: &[(&str, Value)]) -> Arc<Self> {
        Arc::new(Self {
            id,
            outputs: outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CapabilityProvider for Fixed {
    fn provider_id(&self) -> &str {
        self.id
    }

    async fn invoke(
        &self,
        _node_type: &str,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.seen.lock().unwrap().push(request.inputs.clone());
        Ok(CapabilityResponse {
            outputs: self.outputs.clone(),
        })
    }
}

/// Echoes its input on `output` after a delay.
/// Echoes its input after a delay and notes when it got that far.
struct Slow {
    id: &'static str,
    delay_ms: u64,
    finished: AtomicBool,
}

impl Slow {
    fn new(id: &'static str, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            delay_ms,
            finished: AtomicBool::new(false),
        })
    }

    fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityProvider for Slow {
    fn provider_id(&self) -> &str {
        self.id
    }

    async fn invoke(
        &self,
        _node_type: &str,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.finished.store(true, Ordering::SeqCst);
        let input = request.input("input").cloned().unwrap_or_default();
        Ok(CapabilityResponse::new().with_output("output", input))
    }
}

struct Broken;

#[async_trait]
impl CapabilityProvider for Broken {
    fn provider_id(&self) -> &str {
        "broken"
    }

    async fn invoke(
        &self,
        _node_type: &str,
        _request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        Err(CapabilityError::Failed("backend down".to_string()))
    }
}

struct Panicking;

#[async_trait]
impl CapabilityProvider for Panicking {
    fn provider_id(&self) -> &str {
        "panicking"
    }

    async fn invoke(
        &self,
        _node_type: &str,
        _request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        panic!("provider exploded");
    }
}

fn runtime(providers: Vec<Arc<dyn CapabilityProvider>>) -> FlowRuntime {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider);
    }
    FlowRuntime::with_registry(
        Arc::new(canvascore::NodeTypeRegistry::builtin()),
        Arc::new(registry),
        RuntimeConfig::default(),
    )
}

fn standard() -> FlowRuntime {
    runtime(vec![
        Fixed::new("ok", &[("status", Value::from("done"))]),
        Arc::new(Broken),
        Arc::new(Panicking),
        Slow::new("slow", 400),
        Slow::new("fast", 0),
    ])
}

fn add(graph: &mut Graph, node_type: &str, properties: &[(&str, Value)]) -> NodeId {
    let id = graph.add_node(node_type, Position::default()).unwrap();
    for (key, value) in properties {
        graph.set_property(id, key, value.clone()).unwrap();
    }
    id
}

fn link(graph: &mut Graph, from: NodeId, from_port: &str, to: NodeId, to_port: &str) {
    graph
        .connect(PortRef::new(from, from_port), PortRef::new(to, to_port))
        .unwrap();
}

fn output(graph: &mut Graph, name: &str) -> NodeId {
    add(graph, "output", &[("output_name", Value::from(name))])
}

fn numbers(values: &[f64]) -> Value {
    Value::Array(values.iter().copied().map(Value::Number).collect())
}

fn json_input(graph: &mut Graph, value: Value) -> NodeId {
    add(
        graph,
        "input",
        &[("input_type", Value::from("json")), ("value", value)],
    )
}

fn skipped(reason: SkipReason) -> NodeStatus {
    NodeStatus::Skipped { reason }
}

#[tokio::test]
async fn test_brand_analysis_template() {
    let agent = Fixed::new("brand-agent", &[("analysis", Value::from("ok"))]);
    let runtime = runtime(vec![agent.clone()]);
    let graph = runtime.graph_from_template("brand-analysis").unwrap();

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    assert!(result.is_success(), "{:?}", result.failures);
    assert_eq!(
        result.output("result").unwrap().get_path("analysis"),
        Value::from("ok")
    );
    let seen = agent.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("input"), Some(&Value::from("Acme")));
}

#[tokio::test]
async fn test_cycle_runs_nothing() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let a = add(&mut graph, "transform", &[]);
    let b = add(&mut graph, "transform", &[]);
    link(&mut graph, a, "output", b, "input");
    link(&mut graph, b, "output", a, "input");

    let mut events = runtime.subscribe_events();
    let err = runtime.run(&graph, BTreeMap::new()).await.unwrap_err();

    let WorkflowError::Invalid(issues) = err else {
        panic!("expected validation failure");
    };
    let cycle = issues.iter().find(|i| i.kind == IssueKind::Cycle).unwrap();
    assert!(cycle.involves(a) && cycle.involves(b));
    assert!(events.try_recv().is_err(), "no node may start");
}

#[tokio::test]
async fn test_filter_transform() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = json_input(&mut graph, numbers(&[1.0, 2.0, 3.0, 4.0]));
    let filter = add(
        &mut graph,
        "transform",
        &[
            ("type", Value::from("filter")),
            ("expression", Value::from("x > 2")),
        ],
    );
    let out = output(&mut graph, "result");
    link(&mut graph, input, "output", filter, "input");
    link(&mut graph, filter, "output", out, "input");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();
    assert_eq!(result.output("result"), Some(&numbers(&[3.0, 4.0])));
}

#[tokio::test]
async fn test_reduce_of_empty_list_from_null_seed() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = json_input(&mut graph, Value::Array(Vec::new()));
    let reduce = add(
        &mut graph,
        "transform",
        &[
            ("type", Value::from("reduce")),
            ("expression", Value::from("acc + x")),
            ("seed", Value::Null),
        ],
    );
    let out = output(&mut graph, "total");
    link(&mut graph, input, "output", reduce, "input");
    link(&mut graph, reduce, "output", out, "input");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();
    assert_eq!(result.output("total"), Some(&Value::Null));
}

fn decision_graph(runtime: &FlowRuntime, case_sensitive: bool) -> (Graph, NodeId, NodeId) {
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[("value", Value::from("Foo"))]);
    let decision = add(
        &mut graph,
        "decision",
        &[
            ("operator", Value::from("equals")),
            ("threshold", Value::from("foo")),
            ("case_sensitive", Value::Bool(case_sensitive)),
        ],
    );
    let yes = output(&mut graph, "yes");
    let no = output(&mut graph, "no");
    link(&mut graph, input, "output", decision, "input");
    link(&mut graph, decision, "true", yes, "input");
    link(&mut graph, decision, "false", no, "input");
    (graph, yes, no)
}

#[tokio::test]
async fn test_decision_case_insensitive_equals() {
    let runtime = standard();

    let (graph, yes, no) = decision_graph(&runtime, false);
    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();
    assert_eq!(result.output("yes"), Some(&Value::from("Foo")));
    assert_eq!(result.output("no"), None);
    assert_eq!(result.status(yes), Some(&NodeStatus::Completed));
    assert_eq!(result.status(no), Some(&skipped(SkipReason::BranchNotTaken)));

    let (graph, _, _) = decision_graph(&runtime, true);
    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();
    assert_eq!(result.output("no"), Some(&Value::from("Foo")));
    assert_eq!(result.output("yes"), None);
}

#[tokio::test]
async fn test_decision_type_mismatch_fails_the_node() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[("value", Value::from("lots"))]);
    let decision = add(
        &mut graph,
        "decision",
        &[
            ("operator", Value::from("greater_than")),
            ("threshold", Value::Number(3.0)),
        ],
    );
    let out = output(&mut graph, "big");
    link(&mut graph, input, "output", decision, "input");
    link(&mut graph, decision, "true", out, "input");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();
    assert!(matches!(
        result.failure(decision),
        Some(NodeError::TypeMismatch(_))
    ));
    assert_eq!(result.status(out), Some(&skipped(SkipReason::UpstreamFailed)));
}

/// input -> loop; item -> transform -> output("trace"); complete -> output("all")
fn counting_loop(
    runtime: &FlowRuntime,
    start: Value,
    max_iterations: i64,
    break_condition: Option<&str>,
    expression: &str,
) -> (Graph, NodeId) {
    let mut graph = runtime.new_graph();
    let input = json_input(&mut graph, start);
    let mut props = vec![("max_iterations", Value::from(max_iterations))];
    if let Some(condition) = break_condition {
        props.push(("break_condition", Value::from(condition)));
    }
    let looped = add(&mut graph, "loop", &props);
    let step = add(
        &mut graph,
        "transform",
        &[("expression", Value::from(expression))],
    );
    let trace = output(&mut graph, "trace");
    let all = output(&mut graph, "all");
    link(&mut graph, input, "output", looped, "input");
    link(&mut graph, looped, "item", step, "input");
    link(&mut graph, step, "output", trace, "input");
    link(&mut graph, looped, "complete", all, "input");
    (graph, looped)
}

#[tokio::test]
async fn test_loop_runs_exactly_max_iterations() {
    let runtime = standard();
    let (graph, looped) = counting_loop(&runtime, Value::Number(0.0), 5, None, "x + 1");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    let expected = numbers(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(result.output("all"), Some(&expected));
    assert_eq!(result.output("trace"), Some(&expected));
    assert_eq!(
        result.reports.get(&looped),
        Some(&NodeReport::Loop {
            iterations: 5,
            halted_by_predicate: false
        })
    );
}

#[tokio::test]
async fn test_loop_break_condition() {
    let runtime = standard();
    let (graph, looped) =
        counting_loop(&runtime, Value::Number(0.0), 10, Some("x >= 3"), "x + 1");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    assert_eq!(result.output("all"), Some(&numbers(&[1.0, 2.0, 3.0])));
    assert_eq!(
        result.reports.get(&looped),
        Some(&NodeReport::Loop {
            iterations: 3,
            halted_by_predicate: true
        })
    );
}

#[tokio::test]
async fn test_loop_break_condition_error_keeps_finished_iterations() {
    let runtime = standard();
    let (graph, looped) = counting_loop(
        &runtime,
        Value::Number(0.0),
        10,
        Some("x > 2 && x.a"),
        "x + 1",
    );
    let step = graph
        .nodes()
        .find(|node| node.node_type == "transform")
        .map(|node| node.id)
        .unwrap();
    let all = graph
        .nodes()
        .find(|node| node.property("output_name") == Some(&Value::from("all")))
        .map(|node| node.id)
        .unwrap();

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    assert!(matches!(
        result.failure(looped),
        Some(NodeError::Expression(_))
    ));
    assert_eq!(result.status(looped), Some(&NodeStatus::Failed));
    assert_eq!(result.output("trace"), Some(&numbers(&[1.0, 2.0, 3.0])));
    assert_eq!(result.status(step), Some(&NodeStatus::Completed));
    assert_eq!(result.status(all), Some(&skipped(SkipReason::UpstreamFailed)));
    assert_eq!(
        result.reports.get(&looped),
        Some(&NodeReport::Loop {
            iterations: 3,
            halted_by_predicate: false
        })
    );
}

#[tokio::test]
async fn test_loop_over_array_stops_when_exhausted() {
    let runtime = standard();
    let (graph, _) = counting_loop(&runtime, numbers(&[10.0, 20.0, 30.0]), 10, None, "x * 2");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();
    assert_eq!(result.output("all"), Some(&numbers(&[20.0, 40.0, 60.0])));
}

fn capability(graph: &mut Graph, provider_id: &str) -> NodeId {
    add(
        graph,
        "capability-call",
        &[("provider_id", Value::from(provider_id))],
    )
}

#[tokio::test]
async fn test_parallel_keeps_successes_beside_a_failure() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[("value", Value::from("go"))]);
    let parallel = add(&mut graph, "parallel", &[("branch_count", Value::from(3))]);
    link(&mut graph, input, "output", parallel, "input");

    let mut sinks = Vec::new();
    for (branch, provider, name) in [
        ("branch1", "ok", "a"),
        ("branch2", "fast", "b"),
        ("branch3", "broken", "c"),
    ] {
        let call = capability(&mut graph, provider);
        let out = output(&mut graph, name);
        link(&mut graph, parallel, branch, call, "input");
        link(&mut graph, call, "output", out, "input");
        sinks.push(out);
    }

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    assert_eq!(
        result.output("a").unwrap().get_path("status"),
        Value::from("done")
    );
    assert_eq!(result.output("b"), Some(&Value::from("go")));
    assert_eq!(result.output("c"), None);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.status(sinks[2]), Some(&skipped(SkipReason::UpstreamFailed)));
    assert_eq!(
        result.reports.get(&parallel),
        Some(&NodeReport::Parallel {
            branches: vec![
                BranchOutcome {
                    branch: "branch1".to_string(),
                    status: BranchStatus::Succeeded
                },
                BranchOutcome {
                    branch: "branch2".to_string(),
                    status: BranchStatus::Succeeded
                },
                BranchOutcome {
                    branch: "branch3".to_string(),
                    status: BranchStatus::Failed
                },
            ]
        })
    );
}

#[tokio::test]
async fn test_parallel_race_records_one_winner() {
    let slow_provider = Slow::new("slow", 400);
    let runtime = runtime(vec![slow_provider.clone(), Slow::new("fast", 0)]);
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[("value", Value::from("go"))]);
    let parallel = add(
        &mut graph,
        "parallel",
        &[("wait_for_all", Value::Bool(false))],
    );
    let slow = capability(&mut graph, "slow");
    let slow_out = output(&mut graph, "slow");
    let fast = capability(&mut graph, "fast");
    let fast_out = output(&mut graph, "fast");
    link(&mut graph, input, "output", parallel, "input");
    link(&mut graph, parallel, "branch1", slow, "input");
    link(&mut graph, slow, "output", slow_out, "input");
    link(&mut graph, parallel, "branch2", fast, "input");
    link(&mut graph, fast, "output", fast_out, "input");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    assert_eq!(result.output("fast"), Some(&Value::from("go")));
    assert_eq!(result.output("slow"), None);
    assert_eq!(result.status(slow_out), Some(&skipped(SkipReason::Discarded)));
    let Some(NodeReport::Parallel { branches }) = result.reports.get(&parallel) else {
        panic!("parallel report missing");
    };
    assert_eq!(branches[0].status, BranchStatus::Discarded);
    assert_eq!(branches[1].status, BranchStatus::Succeeded);

    // The losing branch is left to run, not cancelled.
    assert!(!slow_provider.finished());
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(slow_provider.finished());
    assert_eq!(result.output("slow"), None);
}

#[tokio::test]
async fn test_failure_is_localised() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[("value", Value::from("x"))]);
    let call = capability(&mut graph, "broken");
    let lost = output(&mut graph, "lost");
    let kept = output(&mut graph, "kept");
    link(&mut graph, input, "output", call, "input");
    link(&mut graph, call, "output", lost, "input");
    link(&mut graph, input, "output", kept, "input");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    assert_eq!(result.output("kept"), Some(&Value::from("x")));
    assert_eq!(result.status(lost), Some(&skipped(SkipReason::UpstreamFailed)));
    assert!(matches!(
        result.failure(call),
        Some(NodeError::Provider { provider_id, .. }) if provider_id == "broken"
    ));
    assert!(!result.is_success());
}

#[tokio::test]
async fn test_provider_panic_becomes_node_failure() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[]);
    let call = capability(&mut graph, "panicking");
    link(&mut graph, input, "output", call, "input");

    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    match result.failure(call) {
        Some(NodeError::ExecutionFailed(message)) => {
            assert!(message.contains("provider exploded"), "{}", message)
        }
        other => panic!("unexpected failure: {:?}", other),
    }
}

#[tokio::test]
async fn test_unregistered_provider_is_a_schema_error() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[]);
    let call = capability(&mut graph, "nobody");
    link(&mut graph, input, "output", call, "input");

    let report = runtime.validate(&graph);
    assert!(!report.is_valid);
    assert!(report
        .errors_of(IssueKind::Schema)
        .any(|issue| issue.involves(call) && issue.message.contains("nobody")));
}

#[tokio::test]
async fn test_input_binding() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let first = add(&mut graph, "input", &[("name", Value::from("a"))]);
    let second = add(&mut graph, "input", &[("name", Value::from("b"))]);
    let third = add(
        &mut graph,
        "input",
        &[("name", Value::from("c")), ("value", Value::from("default"))],
    );
    for (node, name) in [(first, "out_a"), (second, "out_b"), (third, "out_c")] {
        let out = output(&mut graph, name);
        link(&mut graph, node, "output", out, "input");
    }

    let mut initial = BTreeMap::new();
    initial.insert("trigger".to_string(), Value::from("T"));
    initial.insert("b".to_string(), Value::from("B"));
    let result = runtime.run(&graph, initial).await.unwrap();

    assert_eq!(result.output("out_a"), Some(&Value::from("T")));
    assert_eq!(result.output("out_b"), Some(&Value::from("B")));
    assert_eq!(result.output("out_c"), Some(&Value::from("default")));
}

#[tokio::test]
async fn test_cancellation_skips_remaining_nodes() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[("value", Value::from("x"))]);
    let call = capability(&mut graph, "slow");
    let out = output(&mut graph, "result");
    link(&mut graph, input, "output", call, "input");
    link(&mut graph, call, "output", out, "input");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = runtime
        .run_with_cancellation(&graph, BTreeMap::new(), cancel)
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(result.status(input), Some(&NodeStatus::Completed));
    assert_eq!(result.status(call), Some(&skipped(SkipReason::Cancelled)));
    assert_eq!(result.status(out), Some(&skipped(SkipReason::Cancelled)));
    assert!(result.outputs.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[]);
    let out = output(&mut graph, "result");
    link(&mut graph, input, "output", out, "input");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = runtime
        .run_with_cancellation(&graph, BTreeMap::new(), cancel)
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(result.executed_count(), 0);
}

#[tokio::test]
async fn test_events_follow_the_run() {
    let runtime = standard();
    let mut graph = runtime.new_graph();
    let input = add(&mut graph, "input", &[("value", Value::from("hi"))]);
    let call = capability(&mut graph, "fast");
    let out = output(&mut graph, "result");
    link(&mut graph, input, "output", call, "input");
    link(&mut graph, call, "output", out, "input");

    let mut events = runtime.subscribe_events();
    let result = runtime.run(&graph, BTreeMap::new()).await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(received
        .iter()
        .all(|e| e.execution_id() == result.execution_id));
    assert!(matches!(
        received.first(),
        Some(ExecutionEvent::WorkflowStarted { node_count: 3, .. })
    ));
    assert!(matches!(
        received.last(),
        Some(ExecutionEvent::WorkflowCompleted { success: true, .. })
    ));
    let completed = received
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
}
