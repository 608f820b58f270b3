// Persistence seams for the automation engine

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AutomationResult;
use crate::workflows::Workflow;
use reviewflow_shared::{
    Business, Customer, ExecutionLogEntry, ExecutionStatus, TriggerType, WorkflowExecution,
};

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn insert(&self, workflow: &Workflow) -> AutomationResult<()>;

    /// Returns false when the workflow does not exist
    async fn update(&self, workflow: &Workflow) -> AutomationResult<bool>;

    async fn get(&self, business_id: Uuid, id: Uuid) -> AutomationResult<Option<Workflow>>;

    async fn list(&self, business_id: Uuid) -> AutomationResult<Vec<Workflow>>;

    /// Active workflows of a tenant for one trigger type
    async fn list_active_by_trigger(
        &self,
        business_id: Uuid,
        trigger_type: TriggerType,
    ) -> AutomationResult<Vec<Workflow>>;

    async fn set_active(&self, business_id: Uuid, id: Uuid, active: bool) -> AutomationResult<bool>;

    async fn delete(&self, business_id: Uuid, id: Uuid) -> AutomationResult<bool>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert a PENDING execution and bump the workflow's execution counter atomically
    async fn create_for_workflow(&self, execution: &WorkflowExecution) -> AutomationResult<()>;

    /// Move up to `limit` due PENDING executions to PROCESSING and return them
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> AutomationResult<Vec<WorkflowExecution>>;

    async fn update_step(&self, id: Uuid, step: i32) -> AutomationResult<()>;

    async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> AutomationResult<()>;

    /// Most recent first
    async fn list_for_workflow(&self, workflow_id: Uuid, limit: i64) -> AutomationResult<Vec<WorkflowExecution>>;

    async fn status_counts(&self, workflow_id: Uuid) -> AutomationResult<HashMap<ExecutionStatus, i64>>;
}

#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn get(&self, business_id: Uuid, id: Uuid) -> AutomationResult<Option<Customer>>;

    /// Set the guard only if it is unset; true when this call set it
    async fn mark_automation_triggered(&self, id: Uuid, at: DateTime<Utc>) -> AutomationResult<bool>;

    async fn mark_service_completed(
        &self,
        id: Uuid,
        service_type: Option<&str>,
        at: DateTime<Utc>,
    ) -> AutomationResult<()>;
}

#[async_trait]
pub trait BusinessRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> AutomationResult<Option<Business>>;
}

#[async_trait]
pub trait ReviewRequestRepository: Send + Sync {
    /// Newest review request for a customer, ignoring `exclude`
    async fn last_request_at(
        &self,
        customer_id: Uuid,
        exclude: Option<Uuid>,
    ) -> AutomationResult<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait ExecutionLogRepository: Send + Sync {
    async fn append(&self, entry: &ExecutionLogEntry) -> AutomationResult<()>;

    async fn list_for_execution(&self, execution_id: Uuid) -> AutomationResult<Vec<ExecutionLogEntry>>;
}

/// The full set of repositories the engine works against
#[derive(Clone)]
pub struct Repositories {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub customers: Arc<dyn CustomerRepository>,
    pub businesses: Arc<dyn BusinessRepository>,
    pub review_requests: Arc<dyn ReviewRequestRepository>,
    pub execution_logs: Arc<dyn ExecutionLogRepository>,
}

impl Repositories {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            workflows: store.clone(),
            executions: store.clone(),
            customers: store.clone(),
            businesses: store.clone(),
            review_requests: store.clone(),
            execution_logs: store,
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            workflows: store.clone(),
            executions: store.clone(),
            customers: store.clone(),
            businesses: store.clone(),
            review_requests: store.clone(),
            execution_logs: store,
        }
    }
}
