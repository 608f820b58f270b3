// Execution engine: action dispatch, channel gating and failure isolation

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::repositories::ExecutionLogRepository;
use crate::services::sms::MockSmsSender;
use crate::services::{metric_names, DeliveryError, EmailSender};
use crate::tests::fixtures::{business, customer, CustomerFixture, WorkflowFixture};
use crate::tests::helpers::{
    channels, email_returning, email_unused, sms_ineligible, sms_sending, webhook_statuses, webhook_unused, TestEngine,
};
use crate::workflows::TriggerType;
use reviewflow_shared::{Business, Customer, DeliveryMethod, ExecutionStatus, LogLevel};

struct PanickingEmail;

#[async_trait]
impl EmailSender for PanickingEmail {
    async fn send_follow_up_email(&self, _: &Customer, _: &Business, _: &str) -> Result<bool, DeliveryError> {
        panic!("smtp transport exploded")
    }

    async fn send_review_request_with_template(&self, _: &Customer, _: &Business) -> Result<bool, DeliveryError> {
        panic!("smtp transport exploded")
    }
}

#[tokio::test]
async fn test_email_action_requires_address() {
    let engine = TestEngine::new(channels(email_unused(), sms_ineligible("no consent"), webhook_unused()));
    let business = business();
    let phone_only = CustomerFixture::for_business(business.id).without_email().build();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&phone_only], &[&workflow]).await;

    let result = engine.run(&workflow, &phone_only).await;

    assert!(!result.success);
    assert_eq!(result.actions_failed, 1);
    assert_eq!(
        result.outputs[0].error.as_deref(),
        Some("customer has no email address")
    );
}

#[tokio::test]
async fn test_partial_failure_still_succeeds() {
    let mut sms = MockSmsSender::new();
    sms.expect_eligibility()
        .returning(|_| Err(DeliveryError::Failed("gateway unreachable".to_string())));
    let (webhook, bodies) = webhook_statuses(vec![200]);
    let engine = TestEngine::new(channels(email_returning(true), sms, webhook));

    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .actions(json!({
            "a_email": {"type": "email"},
            "b_sms": {"type": "sms"},
            "c_notify": {"type": "webhook", "webhook_url": "https://hooks.example.com/reviews"}
        }))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(result.success);
    assert_eq!(result.actions_executed, 3);
    assert_eq!(result.actions_failed, 1);
    let names: Vec<_> = result.outputs.iter().map(|r| r.action_name.as_str()).collect();
    assert_eq!(names, ["a_email", "b_sms", "c_notify"]);
    assert!(!result.outputs[1].success);
    assert!(result.outputs[2].success);
    assert_eq!(bodies.lock().unwrap().len(), 1);
    assert_eq!(engine.state.metrics.total(metric_names::WORKFLOW_ACTION_TOTAL), 3);
}

#[tokio::test]
async fn test_both_falls_back_to_sms() {
    let engine = TestEngine::new(channels(email_returning(false), sms_sending(), webhook_unused()));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::ServiceCompleted)
        .delivery(DeliveryMethod::Both)
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(result.success);
    assert_eq!(result.outputs.len(), 1);
    let output = result.outputs[0].output.clone().unwrap();
    assert_eq!(output["channel"], "sms");
    assert_eq!(output["message_id"], "SM-review");
}

#[tokio::test]
async fn test_delivery_method_overrides_actions() {
    let engine = TestEngine::new(channels(email_returning(true), sms_ineligible("no consent"), webhook_unused()));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .actions(json!({"notify": {"type": "webhook", "webhook_url": "https://hooks.example.com"}}))
        .delivery(DeliveryMethod::Email)
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(result.success);
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs[0].action_name, "delivery");
}

#[tokio::test]
async fn test_sms_ineligible_fails_action() {
    let engine = TestEngine::new(channels(email_unused(), sms_ineligible("customer has not opted in"), webhook_unused()));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .actions(json!({"text": {"type": "sms", "message_type": "follow_up"}}))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(!result.success);
    assert!(result.outputs[0]
        .error
        .as_deref()
        .unwrap()
        .contains("customer has not opted in"));
}

#[tokio::test]
async fn test_panicking_action_is_isolated() {
    let (webhook, _) = webhook_statuses(vec![]);
    let mut channels = channels(email_unused(), sms_ineligible("no consent"), webhook);
    channels.email = Arc::new(PanickingEmail);
    let engine = TestEngine::new(channels);

    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .actions(json!({
            "first": {"type": "email"},
            "second": {"type": "webhook", "webhook_url": "https://hooks.example.com/after"}
        }))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(result.success);
    assert_eq!(result.outputs[0].error.as_deref(), Some("action panicked"));
    assert!(result.outputs[1].success);
}

#[tokio::test]
async fn test_webhook_retries_server_errors() {
    let (webhook, bodies) = webhook_statuses(vec![503, 502]);
    let engine = TestEngine::new(channels(email_unused(), sms_ineligible("no consent"), webhook));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::Webhook)
        .actions(json!({
            "sync": {
                "type": "webhook",
                "webhook_url": "https://crm.example.com/{{business.id}}",
                "payload": {"source": "reviews", "who": "{{customer.name}}"}
            }
        }))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(result.success);
    assert_eq!(result.outputs[0].output.as_ref().unwrap()["attempts"], 3);
    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0]["source"], "reviews");
    assert_eq!(bodies[0]["who"], json!(customer.name));
    assert_eq!(bodies[0]["customer"]["id"], json!(customer.id));
}

#[tokio::test]
async fn test_webhook_client_error_is_not_retried() {
    let (webhook, bodies) = webhook_statuses(vec![404]);
    let engine = TestEngine::new(channels(email_unused(), sms_ineligible("no consent"), webhook));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::Webhook)
        .actions(json!({"sync": {"type": "webhook", "webhook_url": "https://crm.example.com/missing"}}))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(!result.success);
    assert_eq!(bodies.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_disabled_and_unknown_actions() {
    let engine = TestEngine::new(channels(email_unused(), sms_ineligible("no consent"), webhook_unused()));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .actions(json!({
            "a_paused": {"type": "email", "enabled": false},
            "b_fax": {"type": "fax"}
        }))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let result = engine.run(&workflow, &customer).await;

    assert!(result.outputs[0].skipped);
    assert!(!result.outputs[1].success);
    // A disabled action counts as a success
    assert!(result.success);
}

#[tokio::test]
async fn test_no_actions_is_a_failure() {
    let engine = TestEngine::new(channels(email_unused(), sms_ineligible("no consent"), webhook_unused()));
    let business = business();
    let customer = customer(business.id);
    let empty = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .actions(json!({}))
        .build();
    engine.seed(&business, &[&customer], &[&empty]).await;

    let execution = engine.enqueue(&empty, &customer).await;
    assert!(!engine.state.executor.execute(&execution).await);
}

#[tokio::test]
async fn test_missing_workflow_aborts_execution() {
    let engine = TestEngine::new(channels(email_unused(), sms_ineligible("no consent"), webhook_unused()));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&customer], &[]).await;

    let execution = engine.enqueue(&workflow, &customer).await;

    assert!(engine.state.executor.run(&execution).await.unwrap_err().is_not_found());
    assert!(!engine.state.executor.execute(&execution).await);

    assert!(engine.state.log_sink.flush().await);
    let logs = engine.store.list_for_execution(execution.id).await.unwrap();
    assert!(logs.iter().any(|l| l.level == LogLevel::Error));
}

#[tokio::test]
async fn test_action_steps_are_logged() {
    let engine = TestEngine::new(channels(email_returning(true), sms_sending(), webhook_unused()));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .actions(json!({"a_email": {"type": "email"}, "b_sms": {"type": "sms"}}))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let execution = engine.enqueue(&workflow, &customer).await;
    let result = engine.state.executor.run(&execution).await.unwrap();
    assert!(result.success);

    assert!(engine.state.log_sink.flush().await);
    let logs = engine.store.list_for_execution(execution.id).await.unwrap();
    let steps: Vec<i32> = logs.iter().map(|l| l.step).collect();
    assert_eq!(steps, [1, 2]);
    assert_eq!(engine.store.execution(execution.id).await.unwrap().current_step, 2);
    assert_eq!(
        engine.store.execution(execution.id).await.unwrap().status,
        ExecutionStatus::Pending
    );
}
