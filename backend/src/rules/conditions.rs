// Rule conditions - dot-path navigation and the comparison operators

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::services::{LifecycleAction, LifecycleEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    In,
    NotIn,
}

/// One AND-combined condition of a business rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dot-separated navigation into the ticket context, e.g. `priority`,
    /// `variant.category`.
    pub field_path: String,
    pub operator: RuleOperator,
    pub value: Value,
}

impl RuleCondition {
    pub fn new(field_path: &str, operator: RuleOperator, value: Value) -> Self {
        Self {
            field_path: field_path.to_string(),
            operator,
            value,
        }
    }

    pub fn evaluate(&self, context: &Value) -> CoreResult<bool> {
        let field = resolve_path(context, &self.field_path)?;
        Ok(match self.operator {
            RuleOperator::Equals => loose_eq(field, &self.value),
            RuleOperator::NotEquals => !loose_eq(field, &self.value),
            RuleOperator::Contains => contains(field, &self.value),
            RuleOperator::NotContains => !contains(field, &self.value),
            RuleOperator::GreaterThan => {
                matches!(numeric_pair(field, &self.value), Some((a, b)) if a > b)
            }
            RuleOperator::LessThan => {
                matches!(numeric_pair(field, &self.value), Some((a, b)) if a < b)
            }
            RuleOperator::In => in_list(field, &self.value),
            RuleOperator::NotIn => !in_list(field, &self.value),
        })
    }
}

/// Navigate a dot-separated path through the context tree. Paths that do
/// not exist in the payload schema are a validation failure, not a silent
/// non-match.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> CoreResult<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment).ok_or_else(|| {
            CoreError::validation(
                "field_path",
                format!("'{}' does not exist in the ticket payload", path),
            )
        })?;
    }
    Ok(current)
}

/// The evaluation context for one lifecycle event: the canonical ticket
/// tree (including the table-variant payload) plus the event action.
pub fn rule_context(event: &LifecycleEvent) -> Value {
    let mut context = serde_json::to_value(&event.ticket).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut context {
        let action = match event.action {
            LifecycleAction::Created => "created",
            LifecycleAction::Updated => "updated",
            LifecycleAction::Assigned => "assigned",
        };
        map.insert("event".to_string(), Value::String(action.to_string()));
    }
    context
}

fn loose_eq(field: &Value, expected: &Value) -> bool {
    if field == expected {
        return true;
    }
    match (as_string(field), as_string(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn contains(field: &Value, needle: &Value) -> bool {
    match (field, needle) {
        (Value::String(haystack), Value::String(needle)) => {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }
        (Value::Array(items), needle) => items.iter().any(|item| loose_eq(item, needle)),
        _ => false,
    }
}

fn in_list(field: &Value, list: &Value) -> bool {
    match list {
        Value::Array(items) => items.iter().any(|item| loose_eq(field, item)),
        _ => false,
    }
}

fn numeric_pair(field: &Value, expected: &Value) -> Option<(f64, f64)> {
    Some((as_number(field)?, as_number(expected)?))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "sys_id": "a".repeat(32),
            "priority": 2,
            "state": "2",
            "short_description": "VPN tunnel flapping",
            "assignment_group": "Network Ops",
            "variant": {"category": "network", "impact": "1"},
            "event": "created"
        })
    }

    #[test]
    fn test_equals_with_mixed_encodings() {
        // Numeric field against string expectation still matches.
        let c = RuleCondition::new("priority", RuleOperator::Equals, json!("2"));
        assert!(c.evaluate(&context()).unwrap());

        let c = RuleCondition::new("state", RuleOperator::Equals, json!("2"));
        assert!(c.evaluate(&context()).unwrap());

        let c = RuleCondition::new("state", RuleOperator::NotEquals, json!("7"));
        assert!(c.evaluate(&context()).unwrap());
    }

    #[test]
    fn test_contains() {
        let c = RuleCondition::new("short_description", RuleOperator::Contains, json!("vpn"));
        assert!(c.evaluate(&context()).unwrap());

        let c = RuleCondition::new("short_description", RuleOperator::NotContains, json!("email"));
        assert!(c.evaluate(&context()).unwrap());
    }

    #[test]
    fn test_numeric_comparisons() {
        let c = RuleCondition::new("priority", RuleOperator::LessThan, json!(3));
        assert!(c.evaluate(&context()).unwrap());

        let c = RuleCondition::new("priority", RuleOperator::GreaterThan, json!(1));
        assert!(c.evaluate(&context()).unwrap());

        // String-encoded numbers compare numerically.
        let c = RuleCondition::new("variant.impact", RuleOperator::LessThan, json!(2));
        assert!(c.evaluate(&context()).unwrap());
    }

    #[test]
    fn test_in_operators() {
        let c = RuleCondition::new("priority", RuleOperator::In, json!([1, 2]));
        assert!(c.evaluate(&context()).unwrap());

        let c = RuleCondition::new("assignment_group", RuleOperator::NotIn, json!(["Service Desk"]));
        assert!(c.evaluate(&context()).unwrap());
    }

    #[test]
    fn test_nested_path() {
        let c = RuleCondition::new("variant.category", RuleOperator::Equals, json!("network"));
        assert!(c.evaluate(&context()).unwrap());
    }

    #[test]
    fn test_unknown_path_is_validation_error() {
        let c = RuleCondition::new("no.such.path", RuleOperator::Equals, json!(1));
        let err = c.evaluate(&context()).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("no.such.path"));
    }
}
