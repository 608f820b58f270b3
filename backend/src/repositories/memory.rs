use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BusinessRepository, CustomerRepository, ExecutionLogRepository, ExecutionRepository,
    ReviewRequestRepository, WorkflowRepository,
};
use crate::error::{AutomationError, AutomationResult};
use crate::workflows::Workflow;
use reviewflow_shared::{
    Business, Customer, ExecutionLogEntry, ExecutionStatus, ReviewRequest, TriggerType, WorkflowExecution,
};

/// Process-local store implementing every repository trait
#[derive(Default)]
pub struct InMemoryStore {
    businesses: RwLock<HashMap<Uuid, Business>>,
    customers: RwLock<HashMap<Uuid, Customer>>,
    review_requests: RwLock<Vec<ReviewRequest>>,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    logs: RwLock<Vec<ExecutionLogEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_business(&self, business: Business) {
        self.businesses.write().await.insert(business.id, business);
    }

    pub async fn add_customer(&self, customer: Customer) {
        self.customers.write().await.insert(customer.id, customer);
    }

    pub async fn add_review_request(&self, request: ReviewRequest) {
        self.review_requests.write().await.push(request);
    }

    pub async fn add_workflow(&self, workflow: Workflow) {
        self.workflows.write().await.insert(workflow.id, workflow);
    }

    pub async fn add_execution(&self, execution: WorkflowExecution) {
        self.executions.write().await.insert(execution.id, execution);
    }

    pub async fn customer(&self, id: Uuid) -> Option<Customer> {
        self.customers.read().await.get(&id).cloned()
    }

    pub async fn workflow(&self, id: Uuid) -> Option<Workflow> {
        self.workflows.read().await.get(&id).cloned()
    }

    pub async fn execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.executions.read().await.get(&id).cloned()
    }

    pub async fn executions(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<_> = self.executions.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.created_at);
        all
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryStore {
    async fn insert(&self, workflow: &Workflow) -> AutomationResult<()> {
        self.workflows.write().await.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update(&self, workflow: &Workflow) -> AutomationResult<bool> {
        let mut workflows = self.workflows.write().await;
        match workflows.get_mut(&workflow.id) {
            Some(existing) if existing.business_id == workflow.business_id => {
                let execution_count = existing.execution_count;
                *existing = workflow.clone();
                existing.execution_count = execution_count;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, business_id: Uuid, id: Uuid) -> AutomationResult<Option<Workflow>> {
        Ok(self
            .workflows
            .read()
            .await
            .get(&id)
            .filter(|w| w.business_id == business_id)
            .cloned())
    }

    async fn list(&self, business_id: Uuid) -> AutomationResult<Vec<Workflow>> {
        let mut list: Vec<Workflow> = self
            .workflows
            .read()
            .await
            .values()
            .filter(|w| w.business_id == business_id)
            .cloned()
            .collect();
        list.sort_by_key(|w| w.created_at);
        Ok(list)
    }

    async fn list_active_by_trigger(
        &self,
        business_id: Uuid,
        trigger_type: TriggerType,
    ) -> AutomationResult<Vec<Workflow>> {
        Ok(self
            .list(business_id)
            .await?
            .into_iter()
            .filter(|w| w.is_active && w.trigger_type == trigger_type)
            .collect())
    }

    async fn set_active(&self, business_id: Uuid, id: Uuid, active: bool) -> AutomationResult<bool> {
        let mut workflows = self.workflows.write().await;
        match workflows.get_mut(&id).filter(|w| w.business_id == business_id) {
            Some(workflow) => {
                workflow.is_active = active;
                workflow.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, business_id: Uuid, id: Uuid) -> AutomationResult<bool> {
        let mut workflows = self.workflows.write().await;
        if !workflows.get(&id).is_some_and(|w| w.business_id == business_id) {
            return Ok(false);
        }
        workflows.remove(&id);
        self.executions.write().await.retain(|_, e| e.workflow_id != id);
        Ok(true)
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryStore {
    async fn create_for_workflow(&self, execution: &WorkflowExecution) -> AutomationResult<()> {
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_mut(&execution.workflow_id)
            .ok_or_else(|| AutomationError::not_found(format!("Workflow {}", execution.workflow_id)))?;

        self.executions.write().await.insert(execution.id, execution.clone());
        workflow.execution_count += 1;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> AutomationResult<Vec<WorkflowExecution>> {
        let mut executions = self.executions.write().await;

        let mut due: Vec<(Option<DateTime<Utc>>, DateTime<Utc>, Uuid)> = executions
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| (e.scheduled_for, e.created_at, e.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(execution) = executions.get_mut(&id) {
                execution.status = ExecutionStatus::Processing;
                execution.started_at = Some(now);
                claimed.push(execution.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_step(&self, id: Uuid, step: i32) -> AutomationResult<()> {
        if let Some(execution) = self.executions.write().await.get_mut(&id) {
            execution.current_step = step;
        }
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> AutomationResult<()> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| AutomationError::not_found(format!("Execution {}", id)))?;
        execution.status = status;
        execution.error_message = error_message;
        execution.completed_at = Some(at);
        Ok(())
    }

    async fn list_for_workflow(&self, workflow_id: Uuid, limit: i64) -> AutomationResult<Vec<WorkflowExecution>> {
        let mut list: Vec<WorkflowExecution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn status_counts(&self, workflow_id: Uuid) -> AutomationResult<HashMap<ExecutionStatus, i64>> {
        let mut counts = HashMap::new();
        for execution in self.executions.read().await.values() {
            if execution.workflow_id == workflow_id {
                *counts.entry(execution.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl CustomerRepository for InMemoryStore {
    async fn get(&self, business_id: Uuid, id: Uuid) -> AutomationResult<Option<Customer>> {
        Ok(self
            .customers
            .read()
            .await
            .get(&id)
            .filter(|c| c.business_id == business_id)
            .cloned())
    }

    async fn mark_automation_triggered(&self, id: Uuid, at: DateTime<Utc>) -> AutomationResult<bool> {
        let mut customers = self.customers.write().await;
        match customers.get_mut(&id) {
            Some(customer) if !customer.automation_triggered => {
                customer.automation_triggered = true;
                customer.automation_triggered_at = Some(at);
                customer.updated_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_service_completed(
        &self,
        id: Uuid,
        service_type: Option<&str>,
        at: DateTime<Utc>,
    ) -> AutomationResult<()> {
        let mut customers = self.customers.write().await;
        let customer = customers
            .get_mut(&id)
            .ok_or_else(|| AutomationError::not_found(format!("Customer {}", id)))?;
        customer.service_completed_at = Some(at);
        if let Some(service_type) = service_type {
            customer.service_type = Some(service_type.to_string());
        }
        customer.updated_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl BusinessRepository for InMemoryStore {
    async fn get(&self, id: Uuid) -> AutomationResult<Option<Business>> {
        Ok(self.businesses.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl ReviewRequestRepository for InMemoryStore {
    async fn last_request_at(
        &self,
        customer_id: Uuid,
        exclude: Option<Uuid>,
    ) -> AutomationResult<Option<DateTime<Utc>>> {
        Ok(self
            .review_requests
            .read()
            .await
            .iter()
            .filter(|r| r.customer_id == customer_id && Some(r.id) != exclude)
            .map(|r| r.created_at)
            .max())
    }
}

#[async_trait]
impl ExecutionLogRepository for InMemoryStore {
    async fn append(&self, entry: &ExecutionLogEntry) -> AutomationResult<()> {
        self.logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: Uuid) -> AutomationResult<Vec<ExecutionLogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
