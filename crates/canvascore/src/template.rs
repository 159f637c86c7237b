use crate::graph::{Graph, NodeId, PortRef, Position};
use crate::registry::NodeTypeRegistry;
use crate::{FlowError, GraphError, Value, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

const BUILTIN: [&str; 3] = [
    include_str!("../templates/brand-analysis.json"),
    include_str!("../templates/campaign-router.json"),
    include_str!("../templates/channel-analytics.json"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePort {
    pub node_id: String,
    pub port: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConnection {
    pub from: TemplatePort,
    pub to: TemplatePort,
}

/// Named, serialisable starting graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<TemplateNode>,
    #[serde(default)]
    pub connections: Vec<TemplateConnection>,
}

impl WorkflowTemplate {
    /// Build a fresh graph from this template.
    ///
    /// Node ids are assigned by list position (first node is id 1) and
    /// connection ids likewise, so loading is deterministic. Properties go
    /// through the schema-checked setter and connections through the
    /// connection validator.
    pub fn instantiate(&self, registry: Arc<NodeTypeRegistry>) -> Result<Graph, GraphError> {
        let mut graph = Graph::new(registry);
        let mut ids: HashMap<&str, NodeId> = HashMap::new();

        for spec in &self.nodes {
            let id = graph.add_node(&spec.node_type, Position { x: spec.x, y: spec.y })?;
            for (key, value) in &spec.properties {
                graph.set_property(id, key, value.clone())?;
            }
            ids.insert(spec.id.as_str(), id);
        }

        let resolve = |port: &TemplatePort| -> Result<PortRef, GraphError> {
            let node = ids
                .get(port.node_id.as_str())
                .copied()
                .ok_or_else(|| GraphError::UnknownTemplateNode(port.node_id.clone()))?;
            Ok(PortRef::new(node, port.port.clone()))
        };
        for conn in &self.connections {
            let from = resolve(&conn.from)?;
            let to = resolve(&conn.to)?;
            graph.connect(from, to)?;
        }
        Ok(graph)
    }
}

/// Named templates available to seed new graphs.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the templates shipped with the engine.
    pub fn builtin() -> Self {
        let mut store = Self::new();
        for source in BUILTIN {
            match serde_json::from_str::<WorkflowTemplate>(source) {
                Ok(template) => store.insert(template),
                Err(e) => tracing::error!("Skipping malformed built-in template: {}", e),
            }
        }
        store
    }

    pub fn insert(&mut self, template: WorkflowTemplate) {
        tracing::debug!("Registering template: {}", template.name);
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    /// Templates ordered by name.
    pub fn list(&self) -> impl Iterator<Item = &WorkflowTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Load every `*.json` template in a directory. Returns how many were added.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, FlowError> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension() == Some("json".as_ref()) {
                let template: WorkflowTemplate =
                    serde_json::from_reader(std::fs::File::open(&path)?)?;
                tracing::info!("Loaded template '{}' from {}", template.name, path.display());
                self.insert(template);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn instantiate(
        &self,
        name: &str,
        registry: Arc<NodeTypeRegistry>,
    ) -> Result<Graph, WorkflowError> {
        let template = self
            .get(name)
            .ok_or_else(|| WorkflowError::TemplateNotFound(name.to_string()))?;
        template
            .instantiate(registry)
            .map_err(|source| WorkflowError::Template {
                name: name.to_string(),
                source,
            })
    }
}
