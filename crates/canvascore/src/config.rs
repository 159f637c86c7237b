use crate::expr::Expression;
use crate::graph::Node;
use crate::registry::NodeKind;
use crate::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Text,
    Number,
    Boolean,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOperator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOp {
    Map,
    Filter,
    Reduce,
}

/// Typed view of a node's properties, one variant per node kind.
#[derive(Debug, Clone)]
pub enum NodeConfig {
    Input {
        name: String,
        input_type: InputType,
        value: Value,
    },
    Output {
        output_name: String,
    },
    CapabilityCall {
        provider_id: String,
        parameters: Value,
    },
    Decision {
        operator: DecisionOperator,
        threshold: Value,
        case_sensitive: bool,
        field: Option<String>,
    },
    Loop {
        max_iterations: u32,
        break_condition: Option<Expression>,
    },
    Parallel {
        branch_count: u8,
        wait_for_all: bool,
    },
    Transform {
        operation: TransformOp,
        expression: Expression,
        seed: Option<Value>,
    },
}

struct Props<'a> {
    values: &'a BTreeMap<String, Value>,
    problems: Vec<String>,
}

impl<'a> Props<'a> {
    fn text(&mut self, key: &str) -> Option<String> {
        match self.values.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                self.problems
                    .push(format!("'{}' must be text, got {}", key, other.type_name()));
                None
            }
        }
    }

    fn required_text(&mut self, key: &str) -> String {
        self.text(key).unwrap_or_else(|| {
            self.problems.push(format!("'{}' is required", key));
            String::new()
        })
    }

    fn bool_or(&mut self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            None | Some(Value::Null) => default,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                self.problems
                    .push(format!("'{}' must be a boolean, got {}", key, other.type_name()));
                default
            }
        }
    }

    fn integer(&mut self, key: &str, min: i64, max: i64) -> Option<i64> {
        match self.values.get(key) {
            None | Some(Value::Null) => {
                self.problems.push(format!("'{}' is required", key));
                None
            }
            Some(Value::Number(n)) if n.fract() == 0.0 && (min as f64..=max as f64).contains(n) => {
                Some(*n as i64)
            }
            Some(other) => {
                self.problems.push(format!(
                    "'{}' must be an integer between {} and {}, got {}",
                    key, min, max, other
                ));
                None
            }
        }
    }

    fn expression(&mut self, key: &str, source: &str) -> Option<Expression> {
        match Expression::parse(source) {
            Ok(expr) => Some(expr),
            Err(e) => {
                self.problems.push(format!("'{}' is not a valid expression: {}", key, e));
                None
            }
        }
    }
}

impl NodeConfig {
    /// Parse a node's properties into its typed configuration, collecting
    /// every problem rather than stopping at the first.
    pub fn from_node(node: &Node) -> Result<Self, Vec<String>> {
        let mut props = Props {
            values: &node.properties,
            problems: Vec::new(),
        };

        let config = match node.kind {
            NodeKind::Input => {
                let name = props.required_text("name");
                let input_type = match props.text("input_type").as_deref() {
                    None | Some("text") => InputType::Text,
                    Some("number") => InputType::Number,
                    Some("boolean") => InputType::Boolean,
                    Some("json") => InputType::Json,
                    Some(other) => {
                        props.problems.push(format!("unknown input_type '{}'", other));
                        InputType::Text
                    }
                };
                let value = node.property("value").cloned().unwrap_or_default();
                NodeConfig::Input {
                    name,
                    input_type,
                    value,
                }
            }
            NodeKind::Output => NodeConfig::Output {
                output_name: props.required_text("output_name"),
            },
            NodeKind::CapabilityCall => NodeConfig::CapabilityCall {
                provider_id: props.required_text("provider_id"),
                parameters: node.property("parameters").cloned().unwrap_or_default(),
            },
            NodeKind::Decision => {
                let operator = match props.required_text("operator").as_str() {
                    "equals" => DecisionOperator::Equals,
                    "contains" => DecisionOperator::Contains,
                    "greater_than" => DecisionOperator::GreaterThan,
                    "less_than" => DecisionOperator::LessThan,
                    "" => DecisionOperator::Equals,
                    other => {
                        props.problems.push(format!("unknown operator '{}'", other));
                        DecisionOperator::Equals
                    }
                };
                let threshold = node.property("threshold").cloned().unwrap_or_default();
                if threshold.is_empty() {
                    props.problems.push("'threshold' is required".to_string());
                }
                NodeConfig::Decision {
                    operator,
                    threshold,
                    case_sensitive: props.bool_or("case_sensitive", true),
                    field: props.text("field"),
                }
            }
            NodeKind::Loop => {
                let max_iterations = props
                    .integer("max_iterations", 1, u32::MAX as i64)
                    .unwrap_or(1) as u32;
                let break_condition = props
                    .text("break_condition")
                    .and_then(|source| props.expression("break_condition", &source));
                NodeConfig::Loop {
                    max_iterations,
                    break_condition,
                }
            }
            NodeKind::Parallel => NodeConfig::Parallel {
                branch_count: props.integer("branch_count", 2, 5).unwrap_or(2) as u8,
                wait_for_all: props.bool_or("wait_for_all", true),
            },
            NodeKind::Transform => {
                let operation = match props.required_text("type").as_str() {
                    "map" | "" => TransformOp::Map,
                    "filter" => TransformOp::Filter,
                    "reduce" => TransformOp::Reduce,
                    other => {
                        props.problems.push(format!("unknown transform type '{}'", other));
                        TransformOp::Map
                    }
                };
                let source = props.required_text("expression");
                let expression = if source.is_empty() {
                    None
                } else {
                    props.expression("expression", &source)
                };
                // An explicit null seed is allowed; a missing one is not.
                let seed = node.property("seed").cloned();
                if operation == TransformOp::Reduce && seed.is_none() {
                    props.problems.push("reduce requires a 'seed' property".to_string());
                }
                match expression {
                    Some(expression) => NodeConfig::Transform {
                        operation,
                        expression,
                        seed,
                    },
                    None => return Err(props.problems),
                }
            }
        };

        if props.problems.is_empty() {
            Ok(config)
        } else {
            Err(props.problems)
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Input { .. } => NodeKind::Input,
            NodeConfig::Output { .. } => NodeKind::Output,
            NodeConfig::CapabilityCall { .. } => NodeKind::CapabilityCall,
            NodeConfig::Decision { .. } => NodeKind::Decision,
            NodeConfig::Loop { .. } => NodeKind::Loop,
            NodeConfig::Parallel { .. } => NodeKind::Parallel,
            NodeConfig::Transform { .. } => NodeKind::Transform,
        }
    }
}
