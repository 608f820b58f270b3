// Workflow Conditions - eligibility predicates evaluated before scheduling

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use reviewflow_shared::{Business, Customer};

/// One eligibility predicate from a workflow's condition map
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    HasEmail(bool),
    HasPhone(bool),
    ServiceTypes(Vec<String>),
    Industries(Vec<String>),
    /// Inclusive hour-of-day window; wraps midnight when `start > end`
    ExecutionHours { start: u32, end: u32 },
    MinDaysSinceCreated(i64),
    NoRecentRequests(i64),
    EventProperties(Map<String, Value>),
    /// Recognised key with a value of the wrong shape; always fails
    Invalid { key: String, reason: String },
    /// Unrecognised key; always passes
    Unknown { key: String },
}

impl Condition {
    pub fn parse(key: &str, value: &Value) -> Self {
        let invalid = |reason: &str| Condition::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        match key {
            "has_email" => value
                .as_bool()
                .map(Condition::HasEmail)
                .unwrap_or_else(|| invalid("expected a boolean")),
            "has_phone" => value
                .as_bool()
                .map(Condition::HasPhone)
                .unwrap_or_else(|| invalid("expected a boolean")),
            "service_types" => string_list(value)
                .map(Condition::ServiceTypes)
                .unwrap_or_else(|| invalid("expected a list of strings")),
            "industries" => string_list(value)
                .map(Condition::Industries)
                .unwrap_or_else(|| invalid("expected a list of strings")),
            "execution_hours" => {
                let start = value.get("start").and_then(Value::as_u64);
                let end = value.get("end").and_then(Value::as_u64);
                match (start, end) {
                    (Some(start), Some(end)) if start <= 23 && end <= 23 => Condition::ExecutionHours {
                        start: start as u32,
                        end: end as u32,
                    },
                    _ => invalid("expected {start, end} hours between 0 and 23"),
                }
            }
            "min_days_since_created" => match value.as_i64() {
                Some(days) if days >= 0 => Condition::MinDaysSinceCreated(days),
                _ => invalid("expected a non-negative integer"),
            },
            "no_recent_requests" => match value.as_i64() {
                Some(days) if days >= 0 && Duration::try_days(days).is_some() => {
                    Condition::NoRecentRequests(days)
                }
                Some(days) if days >= 0 => invalid("lookback window out of range"),
                _ => invalid("expected a non-negative integer"),
            },
            "event_properties" => match value {
                Value::Object(map) => Condition::EventProperties(map.clone()),
                _ => invalid("expected an object"),
            },
            other => Condition::Unknown {
                key: other.to_string(),
            },
        }
    }

    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        match self {
            Condition::HasEmail(required) => !required || ctx.customer.has_email(),
            Condition::HasPhone(required) => !required || ctx.customer.has_phone(),
            Condition::ServiceTypes(types) => {
                types.is_empty()
                    || ctx
                        .customer
                        .service_type
                        .as_ref()
                        .is_some_and(|st| types.iter().any(|t| t == st))
            }
            Condition::Industries(industries) => {
                industries.is_empty()
                    || ctx
                        .business
                        .and_then(|b| b.industry.as_ref())
                        .is_some_and(|ind| industries.iter().any(|i| i == ind))
            }
            Condition::ExecutionHours { start, end } => {
                let hour = ctx.now.hour();
                if start <= end {
                    hour >= *start && hour <= *end
                } else {
                    hour >= *start || hour <= *end
                }
            }
            Condition::MinDaysSinceCreated(days) => ctx.customer.age_in_days(ctx.now) >= *days,
            Condition::NoRecentRequests(days) => match ctx.last_request_at {
                Some(last) => Duration::try_days(*days)
                    .and_then(|window| ctx.now.checked_sub_signed(window))
                    .is_some_and(|cutoff| last < cutoff),
                None => true,
            },
            Condition::EventProperties(expected) => expected
                .iter()
                .all(|(key, value)| ctx.event_data.get(key) == Some(value)),
            Condition::Invalid { key, reason } => {
                warn!(condition = %key, "Malformed condition treated as failed: {}", reason);
                false
            }
            Condition::Unknown { key } => {
                debug!(condition = %key, "Ignoring unknown condition key");
                true
            }
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value.as_array().and_then(|items| {
        items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
    })
}

/// Everything a condition may look at
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    pub customer: &'a Customer,
    pub business: Option<&'a Business>,
    pub event_data: &'a Map<String, Value>,
    pub now: DateTime<Utc>,
    /// Most recent review request for the customer, excluding the one that
    /// produced the event
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Parsed condition map; all conditions must pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct ConditionSet {
    conditions: Vec<Condition>,
    raw: Value,
}

impl From<Value> for ConditionSet {
    fn from(value: Value) -> Self {
        let conditions = match &value {
            Value::Object(map) => map.iter().map(|(k, v)| Condition::parse(k, v)).collect(),
            Value::Null => Vec::new(),
            _ => vec![Condition::Invalid {
                key: "conditions".to_string(),
                reason: "expected an object".to_string(),
            }],
        };
        Self { conditions, raw: value }
    }
}

impl From<ConditionSet> for Value {
    fn from(set: ConditionSet) -> Self {
        match set.raw {
            Value::Null => Value::Object(Map::new()),
            other => other,
        }
    }
}

impl ConditionSet {
    pub fn new(raw: Value) -> Self {
        Self::from(raw)
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether evaluation needs the customer's review request history
    pub fn needs_request_history(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| matches!(c, Condition::NoRecentRequests(_)))
    }

    pub fn invalid_keys(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .filter_map(|c| match c {
                Condition::Invalid { key, .. } => Some(key.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        self.conditions.iter().all(|c| c.evaluate(ctx))
    }
}

/// Gate for a single workflow
pub fn eligible(workflow_id: Uuid, conditions: &ConditionSet, ctx: &EvaluationContext<'_>) -> bool {
    if conditions.is_empty() {
        return true;
    }

    let passed = conditions.evaluate(ctx);
    if !passed {
        debug!(%workflow_id, customer_id = %ctx.customer.id, "Workflow conditions not met");
    }
    passed
}
