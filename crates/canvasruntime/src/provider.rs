use async_trait::async_trait;
use canvascore::{EventEmitter, NodeId, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// Everything a provider gets for one capability-call node.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub node_id: NodeId,
    /// Node type id the call was made from.
    pub node_type: String,
    /// Values on every bound input port, by port name.
    pub inputs: BTreeMap<String, Value>,
    /// The node's full property map.
    pub properties: BTreeMap<String, Value>,
    pub events: EventEmitter,
    pub cancellation: CancellationToken,
}

impl CapabilityRequest {
    pub fn input(&self, port: &str) -> Option<&Value> {
        self.inputs.get(port)
    }

    /// Entry of the `parameters` object property.
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.properties.get("parameters").and_then(|p| p.get(key))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityResponse {
    pub outputs: BTreeMap<String, Value>,
}

impl CapabilityResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// External capability behind capability-call nodes.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Key matched against a node's `provider_id` property.
    fn provider_id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn invoke(
        &self,
        node_type: &str,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError>;
}

/// Providers available to an execution, keyed by provider id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CapabilityProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn CapabilityProvider>) {
        let id = provider.provider_id().to_string();
        tracing::info!("Registering capability provider: {}", id);
        self.providers.insert(id, provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Registered provider ids, sorted.
    pub fn list_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
