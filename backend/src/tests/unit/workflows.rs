// Workflow management: templates, updates, activation and tenant scoping

use serde_json::json;
use uuid::Uuid;

use crate::error::AutomationError;
use crate::tests::fixtures::{business, customer, WorkflowFixture};
use crate::tests::helpers::{email_only, TestEngine};
use crate::workflows::{CreateWorkflowRequest, TriggerType, UpdateWorkflowRequest};
use reviewflow_shared::DeliveryMethod;

fn request(trigger_config: serde_json::Value) -> CreateWorkflowRequest {
    CreateWorkflowRequest {
        name: "Follow up".to_string(),
        description: None,
        trigger_type: TriggerType::CustomerCreated,
        trigger_config,
        actions: json!({"send_email": {"type": "email"}}),
        conditions: json!({}),
        delivery_method: None,
        is_active: true,
    }
}

#[tokio::test]
async fn test_create_from_template_round_trips() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    engine.seed(&business, &[], &[]).await;

    let created = engine
        .state
        .workflows
        .create_from_template(business.id, "review_request_after_service", None)
        .await
        .unwrap();
    let loaded = engine.state.workflows.get_workflow(business.id, created.id).await.unwrap();

    assert_eq!(loaded.id, created.id);
    assert_eq!(loaded.trigger_type, TriggerType::ServiceCompleted);
    assert_eq!(loaded.delivery_method, Some(DeliveryMethod::Both));
    assert!(loaded.is_active);
    assert_eq!(loaded.execution_count, 0);

    let missing = engine
        .state
        .workflows
        .create_from_template(business.id, "no_such_template", None)
        .await;
    assert!(matches!(missing, Err(AutomationError::NotFound(_))));
}

#[tokio::test]
async fn test_create_rejects_out_of_range_delay() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    engine.seed(&business, &[], &[]).await;

    let result = engine
        .state
        .workflows
        .create_workflow(business.id, request(json!({"delay_days": 100_000_000})))
        .await;

    match result {
        Err(AutomationError::Validation { details }) => assert!(details.contains_key("trigger_config")),
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(engine.state.workflows.list_workflows(business.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_null_clears_delivery_method() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated)
        .delivery(DeliveryMethod::Sms)
        .build();
    engine.seed(&business, &[], &[&workflow]).await;

    let rename: UpdateWorkflowRequest = serde_json::from_value(json!({"name": "Renamed"})).unwrap();
    let renamed = engine
        .state
        .workflows
        .update_workflow(business.id, workflow.id, rename)
        .await
        .unwrap();
    assert_eq!(renamed.name, "Renamed");
    assert_eq!(renamed.delivery_method, Some(DeliveryMethod::Sms));

    let clear: UpdateWorkflowRequest = serde_json::from_value(json!({"delivery_method": null})).unwrap();
    engine
        .state
        .workflows
        .update_workflow(business.id, workflow.id, clear)
        .await
        .unwrap();

    let stored = engine.state.workflows.get_workflow(business.id, workflow.id).await.unwrap();
    assert_eq!(stored.delivery_method, None);
    assert_eq!(stored.name, "Renamed");
}

#[tokio::test]
async fn test_deactivated_workflow_is_not_dispatched() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    engine
        .state
        .workflows
        .deactivate_workflow(business.id, workflow.id)
        .await
        .unwrap();
    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();

    assert!(outcome.scheduled.is_empty());
    assert!(engine.store.executions().await.is_empty());
    assert!(!engine.store.workflow(workflow.id).await.unwrap().is_active);
}

#[tokio::test]
async fn test_other_tenant_cannot_touch_workflow() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[], &[&workflow]).await;
    let intruder = Uuid::new_v4();

    let get = engine.state.workflows.get_workflow(intruder, workflow.id).await;
    let deactivate = engine.state.workflows.deactivate_workflow(intruder, workflow.id).await;
    let delete = engine.state.workflows.delete_workflow(intruder, workflow.id).await;

    assert!(matches!(get, Err(AutomationError::NotFound(_))));
    assert!(matches!(deactivate, Err(AutomationError::NotFound(_))));
    assert!(matches!(delete, Err(AutomationError::NotFound(_))));
    assert!(engine.store.workflow(workflow.id).await.unwrap().is_active);
}

#[tokio::test]
async fn test_delete_removes_workflow_and_history() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&customer], &[&workflow]).await;
    engine.enqueue(&workflow, &customer).await;

    engine.state.workflows.delete_workflow(business.id, workflow.id).await.unwrap();

    assert!(engine.store.workflow(workflow.id).await.is_none());
    assert!(engine.store.executions().await.is_empty());
    let history = engine.state.workflows.execution_history(business.id, workflow.id, 10).await;
    assert!(matches!(history, Err(AutomationError::NotFound(_))));
}
