// Trigger dispatch: candidate selection, gating and the automation guard

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::repositories::{InMemoryStore, Repositories};
use crate::services::metric_names;
use crate::tests::fixtures::{business, customer, review_request, CustomerFixture, WorkflowFixture};
use crate::tests::helpers::{email_only, FailingExecutions, TestEngine};
use crate::workflows::TriggerType;
use reviewflow_shared::ExecutionStatus;

#[tokio::test]
async fn test_customer_created_schedules_matching_workflows() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let welcome = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    let other_trigger = WorkflowFixture::new(business.id, TriggerType::ServiceCompleted).build();
    let paused = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .inactive()
        .build();
    engine
        .seed(&business, &[&customer], &[&welcome, &other_trigger, &paused])
        .await;

    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.scheduled.len(), 1);

    let executions = engine.store.executions().await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].workflow_id, welcome.id);
    assert_eq!(executions[0].status, ExecutionStatus::Pending);
    assert_eq!(executions[0].trigger_event, "customer_created");
    assert_eq!(executions[0].trigger_data["customer_name"], json!(customer.name));
    assert_eq!(executions[0].trigger_data["business_name"], json!(business.name));

    assert_eq!(engine.store.workflow(welcome.id).await.unwrap().execution_count, 1);
    assert!(engine.store.customer(customer.id).await.unwrap().automation_triggered);
    assert_eq!(engine.state.metrics.total(metric_names::WORKFLOW_TRIGGER_TOTAL), 1);
}

#[tokio::test]
async fn test_customer_created_runs_once_per_customer() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let first = engine.state.triggers.on_customer_created(&customer).await.unwrap();
    let second = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert_eq!(first.scheduled.len(), 1);
    assert!(!second.success);
    assert!(second.scheduled.is_empty());
    assert_eq!(engine.store.executions().await.len(), 1);
}

#[tokio::test]
async fn test_customer_not_ready_is_declined() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let unreachable = CustomerFixture::for_business(business.id)
        .without_email()
        .without_phone()
        .build();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&unreachable], &[&workflow]).await;

    let outcome = engine.state.triggers.on_customer_created(&unreachable).await.unwrap();

    assert!(!outcome.success);
    assert!(outcome.reason.is_some());
    assert!(engine.store.executions().await.is_empty());
    assert!(!engine.store.customer(unreachable.id).await.unwrap().automation_triggered);
}

#[tokio::test]
async fn test_no_candidates_still_sets_guard() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    engine.seed(&business, &[&customer], &[]).await;

    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert!(outcome.success);
    assert!(outcome.scheduled.is_empty());
    assert!(engine.store.customer(customer.id).await.unwrap().automation_triggered);
}

#[tokio::test]
async fn test_unknown_customer_is_not_found() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    engine.seed(&business, &[], &[]).await;
    let stranger = customer(business.id);

    let err = engine.state.triggers.on_customer_created(&stranger).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_conditions_skip_workflows() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let phone_only = CustomerFixture::for_business(business.id).without_email().build();
    let needs_email = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .conditions(json!({"has_email": true}))
        .build();
    let needs_phone = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .conditions(json!({"has_phone": true}))
        .build();
    engine
        .seed(&business, &[&phone_only], &[&needs_email, &needs_phone])
        .await;

    let outcome = engine.state.triggers.on_customer_created(&phone_only).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.scheduled.len(), 1);
    assert_eq!(engine.store.executions().await[0].workflow_id, needs_phone.id);
}

#[tokio::test]
async fn test_recent_review_request_blocks_workflow() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .conditions(json!({"no_recent_requests": 30}))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;
    engine
        .store
        .add_review_request(review_request(business.id, customer.id, Utc::now() - Duration::days(3)))
        .await;

    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert_eq!(outcome.skipped, 1);
    assert!(outcome.scheduled.is_empty());
}

#[tokio::test]
async fn test_failed_schedule_does_not_stop_batch() {
    let store = Arc::new(InMemoryStore::new());
    let business = business();
    let customer = customer(business.id);
    let broken = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    let healthy = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();

    let mut repositories = Repositories::in_memory(store.clone());
    repositories.executions = Arc::new(FailingExecutions::rejecting(store.clone(), broken.id));
    let engine = TestEngine::with_repositories(store, repositories, email_only(true));
    engine.seed(&business, &[&customer], &[&broken, &healthy]).await;

    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.scheduled.len(), 1);
    assert_eq!(engine.store.executions().await[0].workflow_id, healthy.id);
    // Guard is written after the batch regardless
    assert!(engine.store.customer(customer.id).await.unwrap().automation_triggered);
}

#[tokio::test]
async fn test_panicking_schedule_does_not_stop_batch() {
    let store = Arc::new(InMemoryStore::new());
    let business = business();
    let customer = customer(business.id);
    let exploding = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    let healthy = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();

    let mut repositories = Repositories::in_memory(store.clone());
    repositories.executions = Arc::new(FailingExecutions::panicking(store.clone(), exploding.id));
    let engine = TestEngine::with_repositories(store, repositories, email_only(true));
    engine.seed(&business, &[&customer], &[&exploding, &healthy]).await;

    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.scheduled.len(), 1);
    assert_eq!(engine.store.executions().await[0].workflow_id, healthy.id);
    assert!(engine.store.customer(customer.id).await.unwrap().automation_triggered);
}

#[tokio::test]
async fn test_oversized_delay_does_not_break_dispatch() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let oversized = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .trigger_config(json!({"delay_days": 100_000_000}))
        .build();
    let sibling = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .trigger_config(json!({"delay_hours": 1}))
        .build();
    engine.seed(&business, &[&customer], &[&oversized, &sibling]).await;

    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.scheduled.len(), 2);
    assert!(engine.store.customer(customer.id).await.unwrap().automation_triggered);

    let executions = engine.store.executions().await;
    let bad = executions.iter().find(|e| e.workflow_id == oversized.id).unwrap();
    let good = executions.iter().find(|e| e.workflow_id == sibling.id).unwrap();
    // The out-of-range delay is dropped, so the run is immediate
    assert_eq!(bad.scheduled_for, None);
    assert!(good.scheduled_for.is_some());
}

#[tokio::test]
async fn test_delayed_workflow_is_scheduled_in_future() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .trigger_config(json!({"delay_hours": 2}))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let before = Utc::now();
    engine.state.triggers.on_customer_created(&customer).await.unwrap();

    let execution = engine.store.executions().await.remove(0);
    let scheduled_for = execution.scheduled_for.expect("delayed execution has a run time");
    assert!(scheduled_for >= before + Duration::hours(2));
    assert!(scheduled_for <= Utc::now() + Duration::hours(2));

    let summary = engine.state.scheduler.process_due_executions().await.unwrap();
    assert_eq!(summary.claimed, 0);
}

#[tokio::test]
async fn test_service_completed_records_service() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::ServiceCompleted)
        .conditions(json!({"service_types": ["cleaning"]}))
        .build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let outcome = engine
        .state
        .triggers
        .on_service_completed(&customer, Some("cleaning"))
        .await
        .unwrap();

    assert_eq!(outcome.scheduled.len(), 1);
    let stored = engine.store.customer(customer.id).await.unwrap();
    assert_eq!(stored.service_type.as_deref(), Some("cleaning"));
    assert!(stored.service_completed_at.is_some());
    assert!(stored.automation_triggered);

    let execution = engine.store.executions().await.remove(0);
    assert_eq!(execution.trigger_event, "service_completed");
    assert_eq!(execution.trigger_data["service_type"], "cleaning");
}

#[tokio::test]
async fn test_service_completed_after_guard_only_records() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = CustomerFixture::for_business(business.id).already_triggered().build();
    let workflow = WorkflowFixture::new(business.id, TriggerType::ServiceCompleted).build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let outcome = engine
        .state
        .triggers
        .on_service_completed(&customer, Some("repair"))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(engine.store.executions().await.is_empty());
    let stored = engine.store.customer(customer.id).await.unwrap();
    assert_eq!(stored.service_type.as_deref(), Some("repair"));
}

#[tokio::test]
async fn test_review_completed_ignores_guard() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = CustomerFixture::for_business(business.id).already_triggered().build();
    let thank_you = WorkflowFixture::new(business.id, TriggerType::ReviewCompleted).build();
    engine.seed(&business, &[&customer], &[&thank_you]).await;

    let mut request = review_request(business.id, customer.id, Utc::now() - Duration::days(1));
    request.completed_at = Some(Utc::now());
    engine.store.add_review_request(request.clone()).await;

    let first = engine.state.triggers.on_review_request_completed(&request).await.unwrap();
    let second = engine.state.triggers.on_review_request_completed(&request).await.unwrap();

    assert_eq!(first.scheduled.len(), 1);
    assert_eq!(second.scheduled.len(), 1);
    assert_eq!(engine.store.executions().await.len(), 2);
}

#[tokio::test]
async fn test_webhook_key_matching() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let single = WorkflowFixture::new(business.id, TriggerType::Webhook)
        .trigger_config(json!({"webhook_key": "crm.deal_won"}))
        .build();
    let list = WorkflowFixture::new(business.id, TriggerType::Webhook)
        .trigger_config(json!({"webhook_keys": ["pos.sale", "pos.refund"]}))
        .build();
    engine.seed(&business, &[&customer], &[&single, &list]).await;

    let payload = json!({"amount": 120});
    let outcome = engine
        .state
        .triggers
        .on_webhook_received(business.id, "pos.refund", customer.id, &payload)
        .await
        .unwrap();

    assert_eq!(outcome.scheduled.len(), 1);
    let execution = engine.store.executions().await.remove(0);
    assert_eq!(execution.workflow_id, list.id);
    assert_eq!(execution.trigger_event, "webhook_received");

    let unmatched = engine
        .state
        .triggers
        .on_webhook_received(business.id, "unknown.key", customer.id, &payload)
        .await
        .unwrap();
    assert!(unmatched.success);
    assert!(unmatched.scheduled.is_empty());
}
