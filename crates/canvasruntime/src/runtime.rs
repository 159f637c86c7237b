use crate::executor::ExecutionEngine;
use crate::provider::ProviderRegistry;
use crate::result::ExecutionResult;
use canvascore::{
    validate, EventBus, ExecutionEvent, Graph, GraphDocument, GraphError, NodeKind,
    NodeTypeRegistry, TemplateStore, ValidationReport, Value, WorkflowError, WorkflowIssue,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Host-facing entry point: validates and runs graphs against a fixed set
/// of node types, capability providers and templates.
pub struct FlowRuntime {
    registry: Arc<NodeTypeRegistry>,
    providers: Arc<ProviderRegistry>,
    templates: Arc<TemplateStore>,
    engine: ExecutionEngine,
    event_bus: EventBus,
}

impl FlowRuntime {
    /// Built-in node types and templates, no providers, default settings.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(
            Arc::new(NodeTypeRegistry::builtin()),
            Arc::new(ProviderRegistry::new()),
            config,
        )
    }

    pub fn with_registry(
        registry: Arc<NodeTypeRegistry>,
        providers: Arc<ProviderRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            providers,
            templates: Arc::new(TemplateStore::builtin()),
            engine: ExecutionEngine::new(config.max_parallel_nodes),
            event_bus: EventBus::new(config.event_buffer_size),
        }
    }

    pub fn with_templates(mut self, templates: TemplateStore) -> Self {
        self.templates = Arc::new(templates);
        self
    }

    pub fn registry(&self) -> &Arc<NodeTypeRegistry> {
        &self.registry
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn new_graph(&self) -> Graph {
        Graph::new(self.registry.clone())
    }

    pub fn graph_from_template(&self, name: &str) -> Result<Graph, WorkflowError> {
        self.templates.instantiate(name, self.registry.clone())
    }

    pub fn load_document(&self, document: &GraphDocument) -> Result<Graph, GraphError> {
        Graph::from_document(document, self.registry.clone())
    }

    /// Full validation, including capability nodes whose provider is not
    /// registered with this runtime.
    pub fn validate(&self, graph: &Graph) -> ValidationReport {
        let mut report = validate(graph);
        let unregistered: Vec<WorkflowIssue> = graph
            .nodes()
            .filter(|node| node.kind == NodeKind::CapabilityCall)
            .filter_map(|node| {
                let provider_id = node.property("provider_id")?.as_str()?;
                if provider_id.trim().is_empty() || self.providers.contains(provider_id) {
                    return None;
                }
                Some(WorkflowIssue::schema(
                    node.id,
                    format!(
                        "{}: no capability provider registered for '{}'",
                        node.id, provider_id
                    ),
                ))
            })
            .collect();
        report.extend_errors(unregistered);
        report
    }

    /// Validate, then execute a private snapshot of `graph`. An invalid
    /// graph is rejected before any node runs.
    pub async fn run(
        &self,
        graph: &Graph,
        initial: BTreeMap<String, Value>,
    ) -> Result<ExecutionResult, WorkflowError> {
        self.run_with_cancellation(graph, initial, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancellation(
        &self,
        graph: &Graph,
        initial: BTreeMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, WorkflowError> {
        let report = self.validate(graph);
        if !report.is_valid {
            tracing::warn!(
                "Refusing to run graph with {} validation error(s)",
                report.errors.len()
            );
            return Err(WorkflowError::Invalid(report.errors));
        }

        let snapshot = Arc::new(graph.clone());
        Ok(self
            .engine
            .execute(
                snapshot,
                self.providers.clone(),
                &self.event_bus,
                initial,
                cancel,
            )
            .await)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on concurrently running nodes within one scope.
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
        }
    }
}
