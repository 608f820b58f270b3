// Workflow Templates - built-in starting points for common review automations

use serde::Serialize;
use serde_json::{json, Value};

use super::TriggerType;
use reviewflow_shared::DeliveryMethod;

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowTemplate {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub trigger_type: TriggerType,
    pub trigger_config: Value,
    pub actions: Value,
    pub conditions: Value,
    pub delivery_method: Option<DeliveryMethod>,
}

pub fn catalogue() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate {
            key: "welcome_review_request",
            name: "Welcome review request",
            description: "Ask new customers for a review one day after they are added",
            trigger_type: TriggerType::CustomerCreated,
            trigger_config: json!({"delay_days": 1, "business_hours_only": true}),
            actions: json!({
                "review_request": {"delivery_method": "EMAIL"}
            }),
            conditions: json!({"has_email": true}),
            delivery_method: None,
        },
        WorkflowTemplate {
            key: "review_request_after_service",
            name: "Review request after service",
            description: "Request a review by email and SMS two hours after a completed job",
            trigger_type: TriggerType::ServiceCompleted,
            trigger_config: json!({"delay_hours": 2}),
            actions: json!({}),
            conditions: json!({"no_recent_requests": 30}),
            delivery_method: Some(DeliveryMethod::Both),
        },
        WorkflowTemplate {
            key: "thank_you_after_review",
            name: "Thank you after review",
            description: "Thank customers right after they complete a review",
            trigger_type: TriggerType::ReviewCompleted,
            trigger_config: json!({}),
            actions: json!({
                "email": {"template_type": "thank_you"},
                "sms": {"message_type": "thank_you"}
            }),
            conditions: json!({}),
            delivery_method: None,
        },
        WorkflowTemplate {
            key: "follow_up_reminder",
            name: "Follow-up reminder",
            description: "Send a reminder three days later if no review was requested in the meantime",
            trigger_type: TriggerType::CustomerCreated,
            trigger_config: json!({"delay_days": 3}),
            actions: json!({
                "email": {"template_type": "reminder"}
            }),
            conditions: json!({"has_email": true, "no_recent_requests": 7}),
            delivery_method: None,
        },
        WorkflowTemplate {
            key: "webhook_crm_sync",
            name: "CRM sync",
            description: "Forward CRM updates to an external endpoint",
            trigger_type: TriggerType::Webhook,
            trigger_config: json!({"webhook_keys": ["crm_update"]}),
            actions: json!({
                "notify_crm": {
                    "type": "webhook",
                    "webhook_url": "https://crm.example.com/hooks/reviews",
                    "method": "POST",
                    "payload": {"source": "reviewflow", "customer_name": "{{customer.name}}"}
                }
            }),
            conditions: json!({}),
            delivery_method: None,
        },
    ]
}

pub fn find(key: &str) -> Option<WorkflowTemplate> {
    catalogue().into_iter().find(|t| t.key == key)
}
