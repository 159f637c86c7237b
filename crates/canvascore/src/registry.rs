//! Node type registry: the static catalogue of node kinds, their ports and
//! their property schemas.

use crate::{GraphError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MIN_BRANCHES: u8 = 2;
pub const MAX_BRANCHES: u8 = 5;

/// The closed set of node kinds the engine knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Input,
    Output,
    CapabilityCall,
    Decision,
    Loop,
    Parallel,
    Transform,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Output => "output",
            NodeKind::CapabilityCall => "capability-call",
            NodeKind::Decision => "decision",
            NodeKind::Loop => "loop",
            NodeKind::Parallel => "parallel",
            NodeKind::Transform => "transform",
        }
    }

    /// Loop and parallel nodes run the nodes behind some of their ports as sub-executions.
    pub fn owns_region(&self) -> bool {
        matches!(self, NodeKind::Loop | NodeKind::Parallel)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Text,
    Number,
    Integer,
    Boolean,
    Json,
    Choice,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub ty: PropertyType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub constraints: Constraints,
}

impl PropertySchema {
    pub fn new(ty: PropertyType) -> Self {
        Self {
            ty,
            required: false,
            default: None,
            constraints: Constraints::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: Option<f64>) -> Self {
        self.constraints.min = Some(min);
        self.constraints.max = max;
        self
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.constraints.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    /// Type-check a value against this schema. `null` is always accepted
    /// here; emptiness of required properties is checked at validation time.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }
        match self.ty {
            PropertyType::Text => {
                value
                    .as_str()
                    .ok_or_else(|| format!("expected text, got {}", value.type_name()))?;
            }
            PropertyType::Boolean => {
                value
                    .as_bool()
                    .ok_or_else(|| format!("expected boolean, got {}", value.type_name()))?;
            }
            PropertyType::Number | PropertyType::Integer => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| format!("expected number, got {}", value.type_name()))?;
                if self.ty == PropertyType::Integer && n.fract() != 0.0 {
                    return Err(format!("expected an integer, got {}", n));
                }
                if let Some(min) = self.constraints.min {
                    if n < min {
                        return Err(format!("{} is below the minimum of {}", n, min));
                    }
                }
                if let Some(max) = self.constraints.max {
                    if n > max {
                        return Err(format!("{} is above the maximum of {}", n, max));
                    }
                }
            }
            PropertyType::Choice => {
                let choice = value
                    .as_str()
                    .ok_or_else(|| format!("expected one of {:?}", self.constraints.options))?;
                if !self.constraints.options.iter().any(|o| o == choice) {
                    return Err(format!(
                        "'{}' is not one of {:?}",
                        choice, self.constraints.options
                    ));
                }
            }
            PropertyType::Json => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeType {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    pub description: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub properties: BTreeMap<String, PropertySchema>,
}

impl NodeType {
    fn new(id: &str, kind: NodeKind, label: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            label: label.to_string(),
            description: description.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    fn ports(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|p| p.to_string()).collect();
        self.outputs = outputs.iter().map(|p| p.to_string()).collect();
        self
    }

    fn property(mut self, key: &str, schema: PropertySchema) -> Self {
        self.properties.insert(key.to_string(), schema);
        self
    }

    pub fn has_input(&self, port: &str) -> bool {
        self.inputs.iter().any(|p| p == port)
    }

    /// Output ports active for a node with the given property values.
    /// Parallel nodes only expose `branch1..branchN` for `N = branch_count`.
    pub fn active_outputs<'a>(&'a self, properties: &BTreeMap<String, Value>) -> Vec<&'a str> {
        if self.kind != NodeKind::Parallel {
            return self.outputs.iter().map(String::as_str).collect();
        }
        let count = properties
            .get("branch_count")
            .and_then(Value::as_f64)
            .map(|n| n.clamp(MIN_BRANCHES as f64, MAX_BRANCHES as f64) as usize)
            .unwrap_or(MIN_BRANCHES as usize);
        self.outputs.iter().take(count).map(String::as_str).collect()
    }

    pub fn has_active_output(&self, port: &str, properties: &BTreeMap<String, Value>) -> bool {
        self.active_outputs(properties).contains(&port)
    }

    /// Property values a freshly placed node starts with.
    pub fn default_properties(&self) -> BTreeMap<String, Value> {
        self.properties
            .iter()
            .filter_map(|(key, schema)| schema.default.clone().map(|v| (key.clone(), v)))
            .collect()
    }
}

/// Port contract of an external capability provider, turned into a
/// capability-call node type of the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityContract {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_ports_in")]
    pub inputs: Vec<String>,
    #[serde(default = "default_ports_out")]
    pub outputs: Vec<String>,
}

fn default_ports_in() -> Vec<String> {
    vec!["input".to_string()]
}

fn default_ports_out() -> Vec<String> {
    vec!["output".to_string()]
}

/// Catalogue of node types. Built once, then shared read-only.
#[derive(Debug, Clone)]
pub struct NodeTypeRegistry {
    types: BTreeMap<String, NodeType>,
}

impl NodeTypeRegistry {
    /// Registry holding the seven built-in kinds.
    pub fn builtin() -> Self {
        let mut types = BTreeMap::new();
        for node_type in builtin_types() {
            types.insert(node_type.id.clone(), node_type);
        }
        Self { types }
    }

    /// Add a capability-call node type described by a provider contract.
    pub fn with_capability(mut self, contract: CapabilityContract) -> Self {
        let label = if contract.label.is_empty() {
            contract.id.clone()
        } else {
            contract.label.clone()
        };
        let mut node_type = NodeType::new(
            &contract.id,
            NodeKind::CapabilityCall,
            &label,
            &contract.description,
        )
        .property(
            "provider_id",
            PropertySchema::new(PropertyType::Text)
                .required()
                .with_default(contract.id.as_str()),
        )
        .property(
            "parameters",
            PropertySchema::new(PropertyType::Json).with_default(Value::Object(BTreeMap::new())),
        );
        node_type.inputs = contract.inputs;
        node_type.outputs = contract.outputs;
        tracing::debug!("Registering capability node type: {}", node_type.id);
        self.types.insert(node_type.id.clone(), node_type);
        self
    }

    pub fn get_node_type(&self, id: &str) -> Result<&NodeType, GraphError> {
        self.types
            .get(id)
            .ok_or_else(|| GraphError::UnknownNodeType(id.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &NodeType> {
        self.types.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.contains_key(id)
    }
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_types() -> Vec<NodeType> {
    use PropertyType::*;

    let branches: Vec<String> = (1..=MAX_BRANCHES).map(|i| format!("branch{}", i)).collect();
    let branch_ports: Vec<&str> = branches.iter().map(String::as_str).collect();

    vec![
        NodeType::new("input", NodeKind::Input, "Input", "Emits a typed literal or trigger value")
            .ports(&[], &["output"])
            .property("name", PropertySchema::new(Text).required().with_default("input"))
            .property(
                "input_type",
                PropertySchema::new(Choice)
                    .with_options(&["text", "number", "boolean", "json"])
                    .with_default("text"),
            )
            .property("value", PropertySchema::new(Json)),
        NodeType::new("output", NodeKind::Output, "Output", "Records a value under a result name")
            .ports(&["input"], &[])
            .property(
                "output_name",
                PropertySchema::new(Text).required().with_default("result"),
            ),
        NodeType::new(
            "capability-call",
            NodeKind::CapabilityCall,
            "Capability call",
            "Calls an external capability provider",
        )
        .ports(&["input"], &["output"])
        .property("provider_id", PropertySchema::new(Text).required())
        .property(
            "parameters",
            PropertySchema::new(Json).with_default(Value::Object(BTreeMap::new())),
        ),
        NodeType::new("decision", NodeKind::Decision, "Decision", "Routes the input to true or false")
            .ports(&["input"], &["true", "false"])
            .property(
                "operator",
                PropertySchema::new(Choice)
                    .required()
                    .with_options(&["equals", "contains", "greater_than", "less_than"])
                    .with_default("equals"),
            )
            .property("threshold", PropertySchema::new(Json).required())
            .property("case_sensitive", PropertySchema::new(Boolean).with_default(true))
            .property("field", PropertySchema::new(Text)),
        NodeType::new("loop", NodeKind::Loop, "Loop", "Repeats its item subgraph up to a bound")
            .ports(&["input", "iterator"], &["item", "complete"])
            .property(
                "max_iterations",
                PropertySchema::new(Integer)
                    .required()
                    .with_range(1.0, None)
                    .with_default(10),
            )
            .property("break_condition", PropertySchema::new(Text)),
        NodeType::new("parallel", NodeKind::Parallel, "Parallel", "Fans the input out to branches")
            .ports(&["input"], &branch_ports)
            .property(
                "branch_count",
                PropertySchema::new(Integer)
                    .required()
                    .with_range(MIN_BRANCHES as f64, Some(MAX_BRANCHES as f64))
                    .with_default(MIN_BRANCHES as i64),
            )
            .property("wait_for_all", PropertySchema::new(Boolean).with_default(true)),
        NodeType::new("transform", NodeKind::Transform, "Transform", "Map, filter or reduce data")
            .ports(&["input"], &["output"])
            .property(
                "type",
                PropertySchema::new(Choice)
                    .required()
                    .with_options(&["map", "filter", "reduce"])
                    .with_default("map"),
            )
            .property("expression", PropertySchema::new(Text).required().with_default("x"))
            .property("seed", PropertySchema::new(Json)),
    ]
}
