//! Condition rule evaluation against the execution context.
//!
//! # Path Syntax
//!
//! - `severity`: top-level context key
//! - `step_init_result.severity`: nested field access via dot notation
//! - `step_init_result.items[0].name`: array index access
//!
//! A key containing dots that exists verbatim at the top level wins over
//! nested navigation. A path that does not resolve is `Absent`, which is
//! distinct from a present JSON `null`.

use std::collections::HashMap;

use serde_json::Value;

use crate::definition::{ConditionOperator, ConditionRule};

/// The result of resolving a path against the context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved<'a> {
    /// No value at that path.
    Absent,
    /// The value found at that path (possibly `null`).
    Present(&'a Value),
}

/// Outcome of evaluating a rule, with any anomaly noticed along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub matched: bool,
    /// Set when the comparison degraded to `false` because of operand types.
    pub warning: Option<String>,
}

impl ConditionOutcome {
    fn matched(matched: bool) -> Self {
        Self {
            matched,
            warning: None,
        }
    }

    fn mismatch(warning: String) -> Self {
        Self {
            matched: false,
            warning: Some(warning),
        }
    }
}

/// Evaluate a rule against the context.
pub fn evaluate(rule: &ConditionRule, context: &HashMap<String, Value>) -> bool {
    evaluate_detailed(rule, context).matched
}

/// Evaluate a rule, reporting type mismatches instead of failing.
pub fn evaluate_detailed(rule: &ConditionRule, context: &HashMap<String, Value>) -> ConditionOutcome {
    let resolved = resolve_path(context, &rule.field);
    let operand = &rule.value;

    match rule.operator {
        ConditionOperator::Equals => ConditionOutcome::matched(values_equal(resolved, operand)),
        ConditionOperator::NotEquals => {
            ConditionOutcome::matched(!values_equal(resolved, operand))
        }
        ConditionOperator::GreaterThan
        | ConditionOperator::LessThan
        | ConditionOperator::GreaterOrEqual
        | ConditionOperator::LessOrEqual => {
            let (Resolved::Present(left), Some(right)) = (resolved, operand.as_f64()) else {
                return ConditionOutcome::mismatch(numeric_warning(rule, resolved));
            };
            let Some(left) = left.as_f64() else {
                return ConditionOutcome::mismatch(numeric_warning(rule, resolved));
            };
            let matched = match rule.operator {
                ConditionOperator::GreaterThan => left > right,
                ConditionOperator::LessThan => left < right,
                ConditionOperator::GreaterOrEqual => left >= right,
                _ => left <= right,
            };
            ConditionOutcome::matched(matched)
        }
        ConditionOperator::Contains => match resolved {
            Resolved::Present(Value::Array(items)) => ConditionOutcome::matched(
                items
                    .iter()
                    .any(|item| values_equal(Resolved::Present(item), operand)),
            ),
            Resolved::Present(Value::String(haystack)) => match operand {
                Value::String(needle) => ConditionOutcome::matched(haystack.contains(needle.as_str())),
                other => ConditionOutcome::mismatch(format!(
                    "condition on '{}': cannot search a string for non-string operand {}",
                    rule.field, other
                )),
            },
            other => ConditionOutcome::mismatch(format!(
                "condition on '{}': '{}' requires a list or string, found {}",
                rule.field,
                rule.operator,
                describe(other)
            )),
        },
    }
}

/// Structural equality; numbers compare by value so `6` equals `6.0`.
fn values_equal(resolved: Resolved<'_>, operand: &Value) -> bool {
    match resolved {
        Resolved::Absent => false,
        Resolved::Present(value) => match (value.as_f64(), operand.as_f64()) {
            (Some(a), Some(b)) if value.is_number() && operand.is_number() => a == b,
            _ => value == operand,
        },
    }
}

fn numeric_warning(rule: &ConditionRule, resolved: Resolved<'_>) -> String {
    format!(
        "condition on '{}': '{}' requires numeric operands, found {} and {}",
        rule.field,
        rule.operator,
        describe(resolved),
        rule.value
    )
}

fn describe(resolved: Resolved<'_>) -> String {
    match resolved {
        Resolved::Absent => "<absent>".to_string(),
        Resolved::Present(v) => v.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Path navigation
// ---------------------------------------------------------------------------

/// A segment of a dot-separated path, optionally with an array index.
#[derive(Debug)]
struct PathSegment<'p> {
    name: &'p str,
    index: SegmentIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentIndex {
    /// No brackets.
    Whole,
    At(usize),
    /// Brackets around something that is not an index; never matches.
    Invalid,
}

impl SegmentIndex {
    fn select<'a>(self, value: &'a Value) -> Option<&'a Value> {
        match self {
            Self::Whole => Some(value),
            Self::At(i) => value.get(i),
            Self::Invalid => None,
        }
    }
}

/// Parse a dot-separated path into segments, handling array indices.
///
/// `"a.items[0].name"` → `[("a", Whole), ("items", At(0)), ("name", Whole)]`
fn parse_path_segments(path: &str) -> Vec<PathSegment<'_>> {
    path.split('.')
        .map(|part| {
            if let Some(bracket_start) = part.find('[')
                && let Some(bracket_end) = part.find(']')
                && bracket_end > bracket_start
            {
                let index = match part[bracket_start + 1..bracket_end].parse::<usize>() {
                    Ok(i) => SegmentIndex::At(i),
                    Err(_) => SegmentIndex::Invalid,
                };
                return PathSegment {
                    name: &part[..bracket_start],
                    index,
                };
            }
            PathSegment {
                name: part,
                index: SegmentIndex::Whole,
            }
        })
        .collect()
}

/// Navigate one segment of a path through a JSON value.
fn navigate_segment<'a>(value: &'a Value, segment: &PathSegment<'_>) -> Option<&'a Value> {
    let field = if segment.name.is_empty() {
        value
    } else if let Value::Array(items) = value {
        // Bare numeric segments index into arrays: `items.0`
        items.get(segment.name.parse::<usize>().ok()?)?
    } else {
        value.get(segment.name)?
    };

    segment.index.select(field)
}

/// Resolve a dotted path against the context.
pub fn resolve_path<'a>(context: &'a HashMap<String, Value>, path: &str) -> Resolved<'a> {
    if let Some(value) = context.get(path) {
        return Resolved::Present(value);
    }

    let segments = parse_path_segments(path);
    let Some((root, rest)) = segments.split_first() else {
        return Resolved::Absent;
    };

    let Some(root_value) = context.get(root.name) else {
        return Resolved::Absent;
    };
    let Some(mut current) = root.index.select(root_value) else {
        return Resolved::Absent;
    };

    for segment in rest {
        match navigate_segment(current, segment) {
            Some(next) => current = next,
            None => return Resolved::Absent,
        }
    }

    Resolved::Present(current)
}
