//! Value-level behaviour of the built-in node kinds, kept free of
//! scheduling so it can be tested on its own.

use canvascore::config::{DecisionOperator, InputType, TransformOp};
use canvascore::{Bindings, Expression, NodeError, Value};
use std::collections::BTreeMap;

/// Coerce an input node's value to its declared `input_type`.
pub(crate) fn coerce_input(value: Value, input_type: InputType, name: &str) -> Result<Value, NodeError> {
    let mismatch = |expected: &str, actual: &Value| NodeError::InvalidInputType {
        field: name.to_string(),
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    };

    match (input_type, value) {
        (_, Value::Null) => Ok(Value::Null),
        (InputType::Text, Value::String(s)) => Ok(Value::String(s)),
        (InputType::Text, v @ (Value::Number(_) | Value::Bool(_))) => Ok(Value::String(v.to_text())),
        (InputType::Text, v) => Err(mismatch("text", &v)),
        (InputType::Number, Value::Number(n)) => Ok(Value::Number(n)),
        (InputType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| mismatch("number", &Value::String(s))),
        (InputType::Number, v) => Err(mismatch("number", &v)),
        (InputType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (InputType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch("boolean", &Value::String(s))),
        },
        (InputType::Boolean, v) => Err(mismatch("boolean", &v)),
        (InputType::Json, Value::String(s)) => {
            serde_json::from_str::<Value>(&s).map_err(|e| NodeError::InvalidInputType {
                field: name.to_string(),
                expected: "json".to_string(),
                actual: format!("text that is not JSON ({})", e),
            })
        }
        (InputType::Json, v) => Ok(v),
    }
}

fn text_eq(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.to_lowercase() == b.to_lowercase()
    }
}

fn loosely_equal(a: &Value, b: &Value, case_sensitive: bool) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => text_eq(x, y, case_sensitive),
        (Value::Number(_), _) | (_, Value::Number(_)) => match (a.coerce_f64(), b.coerce_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

fn ordered(value: &Value, threshold: &Value, operator: &str) -> Result<(f64, f64), NodeError> {
    match (value.coerce_f64(), threshold.coerce_f64()) {
        (Some(v), Some(t)) => Ok((v, t)),
        _ => Err(NodeError::TypeMismatch(format!(
            "'{}' compares numbers, got {} and {}",
            operator,
            value.type_name(),
            threshold.type_name()
        ))),
    }
}

/// Evaluate a decision node's condition.
pub(crate) fn decide(
    value: &Value,
    operator: DecisionOperator,
    threshold: &Value,
    case_sensitive: bool,
) -> Result<bool, NodeError> {
    match operator {
        DecisionOperator::Equals => Ok(loosely_equal(value, threshold, case_sensitive)),
        DecisionOperator::Contains => match value {
            Value::String(s) => {
                let needle = threshold.to_text();
                Ok(if case_sensitive {
                    s.contains(&needle)
                } else {
                    s.to_lowercase().contains(&needle.to_lowercase())
                })
            }
            Value::Array(items) => Ok(items
                .iter()
                .any(|item| loosely_equal(item, threshold, case_sensitive))),
            Value::Object(map) => Ok(map.contains_key(&threshold.to_text())),
            other => Err(NodeError::TypeMismatch(format!(
                "'contains' needs text, an array or an object, got {}",
                other.type_name()
            ))),
        },
        DecisionOperator::GreaterThan => {
            let (v, t) = ordered(value, threshold, "greater_than")?;
            Ok(v > t)
        }
        DecisionOperator::LessThan => {
            let (v, t) = ordered(value, threshold, "less_than")?;
            Ok(v < t)
        }
    }
}

fn bind(x: &Value, i: usize, acc: Option<&Value>) -> Bindings {
    let mut bindings = Bindings::new();
    bindings.insert("x", x.clone());
    bindings.insert("i", Value::from(i));
    if let Some(acc) = acc {
        bindings.insert("acc", acc.clone());
    }
    bindings
}

/// Apply a transform node. Arrays are processed per element, anything
/// else once as a single element.
pub(crate) fn transform(
    input: &Value,
    operation: TransformOp,
    expression: &Expression,
    seed: Option<&Value>,
) -> Result<Value, NodeError> {
    let single = std::slice::from_ref(input);
    let items = input.as_array().unwrap_or(single);

    match operation {
        TransformOp::Map => {
            let mapped = items
                .iter()
                .enumerate()
                .map(|(i, x)| expression.evaluate(&bind(x, i, None)))
                .collect::<Result<Vec<_>, _>>()?;
            if input.as_array().is_some() {
                Ok(Value::Array(mapped))
            } else {
                Ok(mapped.into_iter().next().unwrap_or_default())
            }
        }
        TransformOp::Filter => {
            let mut kept = Vec::new();
            for (i, x) in items.iter().enumerate() {
                if expression.evaluate(&bind(x, i, None))?.is_truthy() {
                    kept.push(x.clone());
                }
            }
            if input.as_array().is_some() {
                Ok(Value::Array(kept))
            } else {
                Ok(kept.into_iter().next().unwrap_or_default())
            }
        }
        TransformOp::Reduce => {
            let mut acc = seed.cloned().unwrap_or_default();
            for (i, x) in items.iter().enumerate() {
                acc = expression.evaluate(&bind(x, i, Some(&acc)))?;
            }
            Ok(acc)
        }
    }
}

/// Map a provider response onto a capability node's output ports.
///
/// `output` carries the whole response unless the response has its own
/// `output` field. Returns the fired ports and the names of ports the
/// response did not cover.
pub(crate) fn map_response(
    ports: &[&str],
    response: BTreeMap<String, Value>,
) -> (BTreeMap<String, Value>, Vec<String>) {
    let mut fired = BTreeMap::new();
    let mut missing = Vec::new();
    for port in ports {
        let value = match response.get(*port) {
            Some(value) => value.clone(),
            None if *port == "output" => Value::Object(response.clone()),
            None => {
                missing.push(port.to_string());
                Value::Null
            }
        };
        fired.insert(port.to_string(), value);
    }
    (fired, missing)
}
