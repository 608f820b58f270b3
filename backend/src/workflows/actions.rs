// Workflow Actions - typed action map and per-action results

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use reviewflow_shared::DeliveryMethod;

/// Which email template an `email` action sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailTemplateRef {
    Type(String),
    Name(String),
    /// Default review-request template
    ReviewRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsMessageType {
    ReviewRequest,
    FollowUp,
    ThankYou,
}

impl SmsMessageType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "review_request" => Some(Self::ReviewRequest),
            "follow_up" => Some(Self::FollowUp),
            "thank_you" => Some(Self::ThankYou),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookAction {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Extra fields merged over the standard payload
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Email {
        template: EmailTemplateRef,
    },
    Sms {
        message_type: SmsMessageType,
        follow_up_type: Option<String>,
    },
    ReviewRequest {
        delivery_method: DeliveryMethod,
    },
    Delay,
    Webhook(WebhookAction),
    /// Known type with unusable settings
    Invalid {
        action_type: String,
        reason: String,
    },
    Unsupported {
        action_type: String,
    },
}

impl ActionKind {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Email { .. } => "email",
            Self::Sms { .. } => "sms",
            Self::ReviewRequest { .. } => "review_request",
            Self::Delay => "delay",
            Self::Webhook(_) => "webhook",
            Self::Invalid { action_type, .. } | Self::Unsupported { action_type } => action_type,
        }
    }
}

/// A named entry of a workflow's action map
#[derive(Debug, Clone, PartialEq)]
pub struct NamedAction {
    pub name: String,
    pub enabled: bool,
    pub kind: ActionKind,
}

fn str_setting<'a>(settings: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl NamedAction {
    /// The action type is the `type` setting if present, otherwise the name
    pub fn parse(name: &str, settings: &Value) -> Self {
        let empty = Map::new();
        let settings = settings.as_object().unwrap_or(&empty);

        let enabled = settings.get("enabled").and_then(Value::as_bool).unwrap_or(true);
        let action_type = str_setting(settings, "type")
            .unwrap_or(name)
            .to_ascii_lowercase();

        let kind = match action_type.as_str() {
            "email" | "send_email" => {
                let template = if let Some(t) = str_setting(settings, "template_type") {
                    EmailTemplateRef::Type(t.to_string())
                } else if let Some(n) = str_setting(settings, "template_name") {
                    EmailTemplateRef::Name(n.to_string())
                } else {
                    EmailTemplateRef::ReviewRequest
                };
                ActionKind::Email { template }
            }
            "sms" | "send_sms" => {
                let raw = str_setting(settings, "message_type").unwrap_or("review_request");
                match SmsMessageType::parse(raw) {
                    Some(message_type) => ActionKind::Sms {
                        message_type,
                        follow_up_type: str_setting(settings, "follow_up_type").map(str::to_string),
                    },
                    None => ActionKind::Invalid {
                        action_type: action_type.clone(),
                        reason: format!("unknown sms message_type '{}'", raw),
                    },
                }
            }
            "review_request" => {
                let raw = str_setting(settings, "delivery_method").unwrap_or("EMAIL");
                match raw.parse::<DeliveryMethod>() {
                    Ok(delivery_method) => ActionKind::ReviewRequest { delivery_method },
                    Err(reason) => ActionKind::Invalid {
                        action_type: action_type.clone(),
                        reason,
                    },
                }
            }
            "delay" | "wait" => ActionKind::Delay,
            "webhook" | "send_webhook" => match str_setting(settings, "webhook_url") {
                Some(url) => ActionKind::Webhook(WebhookAction {
                    url: url.to_string(),
                    method: str_setting(settings, "method")
                        .unwrap_or("POST")
                        .to_ascii_uppercase(),
                    headers: settings
                        .get("headers")
                        .and_then(Value::as_object)
                        .map(|h| {
                            h.iter()
                                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                                .collect()
                        })
                        .unwrap_or_default(),
                    payload: settings
                        .get("payload")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                }),
                None => ActionKind::Invalid {
                    action_type: action_type.clone(),
                    reason: "webhook_url is required".to_string(),
                },
            },
            _ => ActionKind::Unsupported {
                action_type: action_type.clone(),
            },
        };

        Self {
            name: name.to_string(),
            enabled,
            kind,
        }
    }
}

/// Parsed action map, ordered by action name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct ActionMap {
    actions: Vec<NamedAction>,
    raw: Map<String, Value>,
}

impl From<Value> for ActionMap {
    fn from(value: Value) -> Self {
        let raw = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let actions = raw
            .iter()
            .map(|(name, settings)| NamedAction::parse(name, settings))
            .collect();
        Self { actions, raw }
    }
}

impl From<ActionMap> for Value {
    fn from(map: ActionMap) -> Self {
        Value::Object(map.raw)
    }
}

impl ActionMap {
    pub fn new(raw: Value) -> Self {
        Self::from(raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedAction> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// What drives one run of a workflow, resolved once at execution start
#[derive(Debug, Clone, Copy)]
pub enum ExecutionPlan<'a> {
    Delivery(DeliveryMethod),
    Actions(&'a ActionMap),
}

impl<'a> ExecutionPlan<'a> {
    /// A delivery method, when set, takes precedence over the action map
    pub fn resolve(delivery_method: Option<DeliveryMethod>, actions: &'a ActionMap) -> Self {
        match delivery_method {
            Some(method) => Self::Delivery(method),
            None => Self::Actions(actions),
        }
    }
}

/// Result of executing an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_name: String,
    pub action_type: String,
    pub success: bool,
    pub skipped: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(action: &NamedAction, output: Option<Value>) -> Self {
        Self {
            action_name: action.name.clone(),
            action_type: action.kind.type_name().to_string(),
            success: true,
            skipped: false,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(action: &NamedAction, error: impl Into<String>) -> Self {
        Self {
            action_name: action.name.clone(),
            action_type: action.kind.type_name().to_string(),
            success: false,
            skipped: false,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    /// Disabled actions count as successful
    pub fn skipped(action: &NamedAction) -> Self {
        Self {
            skipped: true,
            ..Self::success(action, None)
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
