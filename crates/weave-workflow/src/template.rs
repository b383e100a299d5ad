//! Parameter templates for data flow between steps.
//!
//! String parameters may reference the execution context with `{{path}}`,
//! using the same dotted path syntax as condition rules:
//!
//! - `"{{step_init_result.summary}}"`: the whole string is one template, so
//!   the referenced JSON value is passed through with its type intact
//! - `"Patient {{patient_id}}: {{step_init_result.summary}}"`: mixed text,
//!   every template is stringified and spliced in

use std::collections::HashMap;

use serde_json::Value;

use crate::condition::{Resolved, resolve_path};
use crate::error::{Result, WorkflowError};

/// Resolve every template in a step's parameters.
pub fn resolve_parameters(
    params: &HashMap<String, Value>,
    context: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>> {
    params
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, context)?)))
        .collect()
}

/// Resolve templates in a JSON value tree.
pub fn resolve_value(value: &Value, context: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, context),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_value(v, context)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, context: &HashMap<String, Value>) -> Result<Value> {
    let expressions = parse_template_expressions(s);
    if expressions.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    if let [only] = expressions.as_slice()
        && only.full_match == s
    {
        return lookup(&only.path, context).cloned();
    }

    let mut result = s.to_string();
    for expr in &expressions {
        let replacement = value_to_string(lookup(&expr.path, context)?);
        result = result.replace(&expr.full_match, &replacement);
    }
    Ok(Value::String(result))
}

fn lookup<'a>(path: &str, context: &'a HashMap<String, Value>) -> Result<&'a Value> {
    match resolve_path(context, path) {
        Resolved::Present(value) => Ok(value),
        Resolved::Absent => Err(WorkflowError::Template(format!(
            "'{{{{{}}}}}' does not resolve in the execution context",
            path
        ))),
    }
}

/// A parsed `{{expression}}` occurrence in a string.
#[derive(Debug)]
struct TemplateExpression {
    full_match: String,
    path: String,
}

/// Find all `{{...}}` expressions in a string. An unclosed `{{` ends parsing.
fn parse_template_expressions(s: &str) -> Vec<TemplateExpression> {
    let mut results = Vec::new();
    let mut remaining = s;

    while let Some(start) = remaining.find("{{") {
        let Some(end) = remaining[start..].find("}}") else {
            break;
        };
        let full_end = start + end + 2;
        let inner = remaining[start + 2..start + end].trim();
        if !inner.is_empty() {
            results.push(TemplateExpression {
                full_match: remaining[start..full_end].to_string(),
                path: inner.to_string(),
            });
        }
        remaining = &remaining[full_end..];
    }

    results
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> HashMap<String, Value> {
        HashMap::from([
            ("patient_id".to_string(), json!("p-42")),
            (
                "step_init_result".to_string(),
                json!({"summary": "stable", "score": 7, "tags": ["a", "b"]}),
            ),
        ])
    }

    #[test]
    fn test_whole_string_preserves_type() {
        let ctx = context();
        assert_eq!(
            resolve_value(&json!("{{step_init_result.score}}"), &ctx).unwrap(),
            json!(7)
        );
        assert_eq!(
            resolve_value(&json!("{{ step_init_result.tags }}"), &ctx).unwrap(),
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_mixed_text() {
        let ctx = context();
        assert_eq!(
            resolve_value(
                &json!("Patient {{patient_id}} is {{step_init_result.summary}} ({{step_init_result.score}})"),
                &ctx
            )
            .unwrap(),
            json!("Patient p-42 is stable (7)")
        );
    }

    #[test]
    fn test_nested_parameters() {
        let ctx = context();
        let params = HashMap::from([
            ("plain".to_string(), json!(1)),
            (
                "nested".to_string(),
                json!({"who": "{{patient_id}}", "list": ["{{step_init_result.score}}"]}),
            ),
        ]);
        let resolved = resolve_parameters(&params, &ctx).unwrap();
        assert_eq!(resolved["plain"], json!(1));
        assert_eq!(resolved["nested"]["who"], json!("p-42"));
        assert_eq!(resolved["nested"]["list"][0], json!(7));
    }

    #[test]
    fn test_unresolved_template_errors() {
        let ctx = context();
        let err = resolve_value(&json!("{{missing.path}}"), &ctx).unwrap_err();
        assert!(err.to_string().contains("missing.path"));
    }

    #[test]
    fn test_unclosed_brace_is_literal() {
        let ctx = context();
        assert_eq!(
            resolve_value(&json!("open {{ but no close"), &ctx).unwrap(),
            json!("open {{ but no close")
        );
    }
}
