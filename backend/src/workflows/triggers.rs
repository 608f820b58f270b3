// Workflow Triggers - trigger configuration and lifecycle events

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

pub use reviewflow_shared::TriggerType;

/// Key(s) a WEBHOOK workflow listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WebhookKeys {
    Single(String),
    Many(Vec<String>),
}

impl WebhookKeys {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Single(k) => k == key,
            Self::Many(keys) => keys.iter().any(|k| k == key),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(k) => k.trim().is_empty(),
            Self::Many(keys) => keys.iter().all(|k| k.trim().is_empty()),
        }
    }
}

/// Longest delay a trigger config may request
pub const MAX_DELAY_DAYS: i64 = 3650;

/// Parsed `trigger_config` of a workflow.
///
/// Built leniently from stored JSON: delay values that are negative, not
/// integers, or beyond `MAX_DELAY_DAYS` in total are dropped (and logged)
/// rather than rejected, so a bad value never blocks scheduling. The
/// original JSON is kept for round-tripping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct TriggerConfig {
    pub delay_days: Option<i64>,
    pub delay_hours: Option<i64>,
    pub delay_minutes: Option<i64>,
    pub business_hours_only: bool,
    pub webhook_keys: Option<WebhookKeys>,
    /// Problems found while parsing
    pub issues: Vec<String>,
    raw: Map<String, Value>,
}

fn parse_delay(raw: &Map<String, Value>, key: &str, issues: &mut Vec<String>) -> Option<i64> {
    let value = raw.get(key)?;
    if value.is_null() {
        return None;
    }

    let parsed = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()));

    match parsed {
        Some(n) if n >= 0 => Some(n),
        _ => {
            issues.push(format!("{} must be a non-negative integer, got {}", key, value));
            None
        }
    }
}

/// Sum of the delay parts, `None` on overflow or past `MAX_DELAY_DAYS`
fn checked_delay(days: i64, hours: i64, minutes: i64) -> Option<Duration> {
    let total = Duration::try_days(days)?
        .checked_add(&Duration::try_hours(hours)?)?
        .checked_add(&Duration::try_minutes(minutes)?)?;
    (total <= Duration::try_days(MAX_DELAY_DAYS)?).then_some(total)
}

impl From<Value> for TriggerConfig {
    fn from(value: Value) -> Self {
        let raw = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Self {
                    issues: vec![format!("trigger_config must be an object, got {}", other)],
                    ..Default::default()
                };
            }
        };

        let mut issues = Vec::new();
        let mut delay_days = parse_delay(&raw, "delay_days", &mut issues);
        let mut delay_hours = parse_delay(&raw, "delay_hours", &mut issues);
        let mut delay_minutes = parse_delay(&raw, "delay_minutes", &mut issues);

        let parts = (delay_days.unwrap_or(0), delay_hours.unwrap_or(0), delay_minutes.unwrap_or(0));
        if checked_delay(parts.0, parts.1, parts.2).is_none() {
            issues.push(format!(
                "delay of {}d {}h {}m exceeds the {} day maximum",
                parts.0, parts.1, parts.2, MAX_DELAY_DAYS
            ));
            delay_days = None;
            delay_hours = None;
            delay_minutes = None;
        }

        let business_hours_only = raw
            .get("business_hours_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let webhook_keys = raw
            .get("webhook_keys")
            .or_else(|| raw.get("webhook_key"))
            .and_then(|v| match serde_json::from_value::<WebhookKeys>(v.clone()) {
                Ok(keys) => Some(keys),
                Err(_) if v.is_null() => None,
                Err(_) => {
                    issues.push(format!("webhook_keys must be a string or list of strings, got {}", v));
                    None
                }
            });

        Self {
            delay_days,
            delay_hours,
            delay_minutes,
            business_hours_only,
            webhook_keys,
            issues,
            raw,
        }
    }
}

impl From<TriggerConfig> for Value {
    fn from(config: TriggerConfig) -> Self {
        Value::Object(config.raw)
    }
}

impl TriggerConfig {
    pub fn new(raw: Value) -> Self {
        Self::from(raw)
    }

    /// Cumulative delay, or `None` when no delay key is present
    pub fn delay(&self) -> Option<Duration> {
        if self.delay_days.is_none() && self.delay_hours.is_none() && self.delay_minutes.is_none() {
            return None;
        }

        checked_delay(
            self.delay_days.unwrap_or(0),
            self.delay_hours.unwrap_or(0),
            self.delay_minutes.unwrap_or(0),
        )
    }

    pub fn matches_webhook_key(&self, key: &str) -> bool {
        self.webhook_keys
            .as_ref()
            .map(|keys| keys.matches(key))
            .unwrap_or(false)
    }

    /// Log parse issues against a workflow
    pub fn report_issues(&self, workflow_id: Uuid) {
        for issue in &self.issues {
            warn!(%workflow_id, "Ignoring invalid trigger config value: {}", issue);
        }
    }
}

/// A lifecycle event as seen by the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub trigger_type: TriggerType,
    pub business_id: Uuid,
    pub customer_id: Uuid,
    /// Event-specific data merged into the execution's trigger data
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(trigger_type: TriggerType, business_id: Uuid, customer_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            trigger_type,
            business_id,
            customer_id,
            data: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn customer_created(business_id: Uuid, customer_id: Uuid) -> Self {
        Self::new(TriggerType::CustomerCreated, business_id, customer_id)
    }

    pub fn service_completed(business_id: Uuid, customer_id: Uuid, service_type: Option<&str>) -> Self {
        Self::new(TriggerType::ServiceCompleted, business_id, customer_id)
            .with("service_type", serde_json::json!(service_type))
    }

    pub fn review_completed(
        business_id: Uuid,
        customer_id: Uuid,
        review_request_id: Uuid,
        completed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::new(TriggerType::ReviewCompleted, business_id, customer_id)
            .with("review_request_id", serde_json::json!(review_request_id))
            .with("completed_at", serde_json::json!(completed_at))
    }

    pub fn webhook_received(business_id: Uuid, customer_id: Uuid, webhook_key: &str, payload: &Value) -> Self {
        let mut event = Self::new(TriggerType::Webhook, business_id, customer_id);
        if let Value::Object(map) = payload {
            event.data.extend(map.clone());
        } else if !payload.is_null() {
            event.data.insert("payload".to_string(), payload.clone());
        }
        event.with("webhook_key", serde_json::json!(webhook_key))
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn event_name(&self) -> &'static str {
        self.trigger_type.event_name()
    }
}
