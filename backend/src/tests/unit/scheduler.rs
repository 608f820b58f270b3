// Due-execution sweep and the job runner around it

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::jobs::{JobError, JobScheduler, JobStatus, EXECUTION_SWEEP_JOB};
use crate::services::{metric_names, DeliveryError, EmailSender, MetricsService};
use crate::tests::fixtures::{business, customer, CustomerFixture, WorkflowFixture};
use crate::tests::helpers::{email_only, TestEngine};
use crate::workflows::{TriggerType, WorkflowScheduler};
use reviewflow_shared::{Business, Customer, ExecutionStatus, WorkflowExecution};

/// Email adapter that takes a while and counts its sends
#[derive(Default)]
struct SlowEmail {
    sends: AtomicUsize,
}

impl SlowEmail {
    async fn send(&self) -> Result<bool, DeliveryError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        Ok(true)
    }
}

#[async_trait]
impl EmailSender for SlowEmail {
    async fn send_follow_up_email(&self, _: &Customer, _: &Business, _: &str) -> Result<bool, DeliveryError> {
        self.send().await
    }

    async fn send_review_request_with_template(&self, _: &Customer, _: &Business) -> Result<bool, DeliveryError> {
        self.send().await
    }
}

/// Engine with a slow email channel and `count` due executions
async fn slow_engine(count: usize) -> (TestEngine, Arc<SlowEmail>, Vec<uuid::Uuid>) {
    let slow = Arc::new(SlowEmail::default());
    let mut channels = email_only(true);
    channels.email = slow.clone();
    let engine = TestEngine::new(channels);

    let business = business();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[], &[&workflow]).await;

    let mut ids = Vec::new();
    for _ in 0..count {
        let customer = customer(business.id);
        engine.store.add_customer(customer.clone()).await;
        ids.push(engine.enqueue(&workflow, &customer).await.id);
    }
    (engine, slow, ids)
}

#[tokio::test]
async fn test_sweep_runs_due_executions_only() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let due = engine.enqueue(&workflow, &customer).await;
    let later = WorkflowExecution::pending(
        workflow.id,
        customer.id,
        business.id,
        "customer_created",
        json!({}),
        Some(Utc::now() + Duration::hours(3)),
    );
    engine.store.add_execution(later.clone()).await;

    let summary = engine.state.scheduler.process_due_executions().await.unwrap();

    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);

    let finished = engine.store.execution(due.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());
    assert_eq!(
        engine.store.execution(later.id).await.unwrap().status,
        ExecutionStatus::Pending
    );

    let workflow_id = workflow.id.to_string();
    let success = [("workflow_id", workflow_id.as_str()), ("success", "true")];
    assert_eq!(
        engine.state.metrics.counter(metric_names::WORKFLOW_EXECUTION_TOTAL, &success),
        1
    );
    assert_eq!(
        engine
            .state
            .metrics
            .counter(metric_names::WORKFLOW_EXECUTION_DURATION_SECONDS, &success[..1]),
        1
    );

    // Finished executions are never claimed again
    let again = engine.state.scheduler.process_due_executions().await.unwrap();
    assert_eq!(again.claimed, 0);
}

#[tokio::test]
async fn test_failed_execution_records_reason() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let phone_only = CustomerFixture::for_business(business.id).without_email().build();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&phone_only], &[&workflow]).await;

    let execution = engine.enqueue(&workflow, &phone_only).await;
    let summary = engine.state.scheduler.process_due_executions().await.unwrap();

    assert_eq!(summary.failed, 1);
    let finished = engine.store.execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(finished.error_message.as_deref(), Some("no action succeeded"));
}

#[tokio::test]
async fn test_missing_customer_fails_execution() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[], &[&workflow]).await;

    let ghost = customer(business.id);
    let execution = engine.enqueue(&workflow, &ghost).await;
    engine.state.scheduler.process_due_executions().await.unwrap();

    assert_eq!(
        engine.store.execution(execution.id).await.unwrap().status,
        ExecutionStatus::Failed
    );
}

#[tokio::test]
async fn test_sweep_processes_batch_concurrently() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[], &[&workflow]).await;

    let mut ids = Vec::new();
    for _ in 0..10 {
        let customer = customer(business.id);
        engine.store.add_customer(customer.clone()).await;
        ids.push(engine.enqueue(&workflow, &customer).await.id);
    }

    let summary = engine.state.scheduler.process_due_executions().await.unwrap();
    assert_eq!(summary.claimed, 10);
    assert_eq!(summary.completed, 10);

    for id in ids {
        assert_eq!(engine.store.execution(id).await.unwrap().status, ExecutionStatus::Completed);
    }
}

#[tokio::test]
async fn test_overlapping_tick_is_skipped() {
    let (engine, slow, ids) = slow_engine(3).await;
    let scheduler = &engine.state.scheduler;

    let (first, second) = tokio::join!(scheduler.process_due_executions(), async {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scheduler.process_due_executions().await
    });
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.claimed, 3);
    assert!(second.skipped);
    assert_eq!(second.claimed, 0);
    assert_eq!(slow.sends.load(Ordering::SeqCst), 3);
    for id in ids {
        assert_eq!(engine.store.execution(id).await.unwrap().status, ExecutionStatus::Completed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_never_run_an_execution_twice() {
    let (engine, slow, ids) = slow_engine(6).await;

    // A second worker sharing the same store, as another process would
    let other = Arc::new(WorkflowScheduler::new(
        engine.state.repositories.executions.clone(),
        engine.state.executor.clone(),
        MetricsService::new().unwrap(),
        engine.state.config.engine.clone(),
        engine.state.config.business_hours,
    ));
    let ours = engine.state.scheduler.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { ours.process_due_executions().await }),
        tokio::spawn(async move { other.process_due_executions().await }),
    );
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

    assert_eq!(a.claimed + b.claimed, 6);
    assert_eq!(a.completed + b.completed, 6);
    assert_eq!(slow.sends.load(Ordering::SeqCst), 6);
    for id in ids {
        assert_eq!(engine.store.execution(id).await.unwrap().status, ExecutionStatus::Completed);
    }
}

#[tokio::test]
async fn test_trigger_then_sweep_end_to_end() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&customer], &[&workflow]).await;

    let outcome = engine.state.triggers.on_customer_created(&customer).await.unwrap();
    let summary = engine.state.scheduler.process_due_executions().await.unwrap();

    assert_eq!(summary.completed, 1);
    let metrics = engine
        .state
        .workflows
        .workflow_metrics(business.id, workflow.id)
        .await
        .unwrap();
    assert_eq!(metrics.execution_count, 1);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.success_rate, 1.0);

    let history = engine
        .state
        .workflows
        .execution_history(business.id, workflow.id, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, outcome.scheduled[0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_runner_records_sweeps() {
    let engine = TestEngine::new(email_only(true));
    let business = business();
    let customer = customer(business.id);
    let workflow = WorkflowFixture::new(business.id, TriggerType::CustomerCreated).build();
    engine.seed(&business, &[&customer], &[&workflow]).await;
    engine.enqueue(&workflow, &customer).await;

    let jobs = JobScheduler::new(Arc::clone(&engine.state.scheduler)).await.unwrap();
    let summary = tokio_test::assert_ok!(jobs.run_job_now(EXECUTION_SWEEP_JOB).await);
    assert_eq!(summary.completed, 1);

    let logs = jobs.get_execution_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].job_name, EXECUTION_SWEEP_JOB);
    assert_eq!(logs[0].status, JobStatus::Completed);
    assert_eq!(logs[0].items_processed, 1);

    assert!(matches!(
        jobs.run_job_now("nightly_report").await,
        Err(JobError::ConfigError(_))
    ));
}
