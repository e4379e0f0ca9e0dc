use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    In,
    Exists,
}

/// One auto-approve rule evaluated against a job's config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoApproveCondition {
    /// Dot path into the job config, e.g. `metrics.accuracy` or `stages.0.name`
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Resolve a dot path. Numeric segments index into arrays.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Numbers compare numerically, strings lexically; anything else is incomparable
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl AutoApproveCondition {
    pub fn matches(&self, config: &Value) -> bool {
        let Some(actual) = lookup_path(config, &self.field).filter(|v| !v.is_null()) else {
            // `exists` with `value: false` asserts absence
            return self.operator == ConditionOperator::Exists && self.value.as_bool() == Some(false);
        };
        let expected = &self.value;

        match self.operator {
            ConditionOperator::Equals => loosely_equal(actual, expected),
            ConditionOperator::NotEquals => !loosely_equal(actual, expected),
            ConditionOperator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
            ConditionOperator::GreaterThanOrEqual => matches!(
                compare(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ConditionOperator::LessThan => compare(actual, expected) == Some(Ordering::Less),
            ConditionOperator::LessThanOrEqual => matches!(
                compare(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ConditionOperator::Contains => match (actual, expected) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
                _ => false,
            },
            ConditionOperator::In => expected
                .as_array()
                .is_some_and(|options| options.iter().any(|option| loosely_equal(actual, option))),
            ConditionOperator::Exists => self.value.as_bool().unwrap_or(true),
        }
    }
}

/// True only for a non-empty list whose conditions all hold
pub fn all_match(conditions: &[AutoApproveCondition], config: &Value) -> bool {
    !conditions.is_empty() && conditions.iter().all(|c| c.matches(config))
}
