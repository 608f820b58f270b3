// Workflow Triggers - lifecycle event dispatch into scheduled executions

use chrono::Utc;
use serde::Serialize;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{eligible, EvaluationContext, TriggerEvent, TriggerType, Workflow, WorkflowScheduler};
use crate::error::{AutomationError, AutomationResult};
use crate::repositories::{
    BusinessRepository, CustomerRepository, Repositories, ReviewRequestRepository, WorkflowRepository,
};
use crate::services::metrics::MetricsService;
use reviewflow_shared::{Business, Customer, ReviewRequest};

/// What a triggering call did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    /// No candidate workflow failed to schedule
    pub success: bool,
    pub reason: Option<String>,
    /// Ids of the executions created
    pub scheduled: Vec<Uuid>,
    /// Workflows whose conditions did not pass
    pub skipped: usize,
    pub failed: usize,
}

impl TriggerOutcome {
    fn declined(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// NotFound goes back to the caller; anything else becomes a failed outcome
fn fold_error(e: AutomationError) -> AutomationResult<TriggerOutcome> {
    if e.is_not_found() {
        return Err(e);
    }
    error!("Trigger dispatch failed: {}", e);
    Ok(TriggerOutcome::declined(e.to_string()))
}

pub struct WorkflowTriggerService {
    workflows: Arc<dyn WorkflowRepository>,
    customers: Arc<dyn CustomerRepository>,
    businesses: Arc<dyn BusinessRepository>,
    review_requests: Arc<dyn ReviewRequestRepository>,
    scheduler: Arc<WorkflowScheduler>,
    metrics: MetricsService,
}

impl WorkflowTriggerService {
    pub fn new(repositories: &Repositories, scheduler: Arc<WorkflowScheduler>, metrics: MetricsService) -> Self {
        Self {
            workflows: repositories.workflows.clone(),
            customers: repositories.customers.clone(),
            businesses: repositories.businesses.clone(),
            review_requests: repositories.review_requests.clone(),
            scheduler,
            metrics,
        }
    }

    async fn load_customer(&self, business_id: Uuid, customer_id: Uuid) -> AutomationResult<Customer> {
        self.customers
            .get(business_id, customer_id)
            .await?
            .ok_or_else(|| AutomationError::not_found(format!("Customer {}", customer_id)))
    }

    async fn load_business(&self, business_id: Uuid) -> AutomationResult<Business> {
        self.businesses
            .get(business_id)
            .await?
            .ok_or_else(|| AutomationError::not_found(format!("Business {}", business_id)))
    }

    /// Set the per-customer guard; failures are logged, never returned
    async fn set_guard(&self, customer_id: Uuid) {
        match self.customers.mark_automation_triggered(customer_id, Utc::now()).await {
            Ok(true) => debug!(%customer_id, "Automation guard set"),
            Ok(false) => debug!(%customer_id, "Automation guard was already set"),
            Err(e) => error!(%customer_id, "Failed to set automation guard: {}", e),
        }
    }

    pub async fn on_customer_created(&self, customer: &Customer) -> AutomationResult<TriggerOutcome> {
        let customer = self.load_customer(customer.business_id, customer.id).await?;
        let business = self.load_business(customer.business_id).await?;

        if customer.automation_triggered {
            debug!(customer_id = %customer.id, "Automation already triggered, skipping");
            return Ok(TriggerOutcome::declined("automation already triggered for customer"));
        }
        if !customer.is_ready_for_automation() {
            debug!(customer_id = %customer.id, "Customer not ready for automation");
            return Ok(TriggerOutcome::declined("customer is not ready for automation"));
        }

        let candidates = match self
            .workflows
            .list_active_by_trigger(business.id, TriggerType::CustomerCreated)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => return fold_error(e),
        };

        let event = TriggerEvent::customer_created(business.id, customer.id);
        let outcome = self.dispatch(&event, &customer, &business, candidates, None).await;
        self.set_guard(customer.id).await;
        Ok(outcome)
    }

    pub async fn on_service_completed(
        &self,
        customer: &Customer,
        service_type: Option<&str>,
    ) -> AutomationResult<TriggerOutcome> {
        let mut customer = self.load_customer(customer.business_id, customer.id).await?;
        let business = self.load_business(customer.business_id).await?;

        let now = Utc::now();
        match self
            .customers
            .mark_service_completed(customer.id, service_type, now)
            .await
        {
            Ok(()) => {
                customer.service_completed_at = Some(now);
                if let Some(service_type) = service_type {
                    customer.service_type = Some(service_type.to_string());
                }
            }
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => warn!(customer_id = %customer.id, "Failed to record service completion: {}", e),
        }

        // Shares the guard with CUSTOMER_CREATED
        if customer.automation_triggered {
            debug!(customer_id = %customer.id, "Automation already triggered, skipping service workflows");
            return Ok(TriggerOutcome::declined("automation already triggered for customer"));
        }

        let candidates = match self
            .workflows
            .list_active_by_trigger(business.id, TriggerType::ServiceCompleted)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => return fold_error(e),
        };

        let event = TriggerEvent::service_completed(business.id, customer.id, customer.service_type.as_deref());
        let outcome = self.dispatch(&event, &customer, &business, candidates, None).await;
        self.set_guard(customer.id).await;
        Ok(outcome)
    }

    pub async fn on_review_request_completed(
        &self,
        review_request: &ReviewRequest,
    ) -> AutomationResult<TriggerOutcome> {
        let customer = self
            .load_customer(review_request.business_id, review_request.customer_id)
            .await?;
        let business = self.load_business(review_request.business_id).await?;

        let candidates = match self
            .workflows
            .list_active_by_trigger(business.id, TriggerType::ReviewCompleted)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => return fold_error(e),
        };

        let event = TriggerEvent::review_completed(
            business.id,
            customer.id,
            review_request.id,
            review_request.completed_at,
        );
        Ok(self
            .dispatch(&event, &customer, &business, candidates, Some(review_request.id))
            .await)
    }

    pub async fn on_webhook_received(
        &self,
        business_id: Uuid,
        webhook_key: &str,
        customer_id: Uuid,
        payload: &Value,
    ) -> AutomationResult<TriggerOutcome> {
        let customer = self.load_customer(business_id, customer_id).await?;
        let business = self.load_business(business_id).await?;

        let candidates: Vec<Workflow> = match self
            .workflows
            .list_active_by_trigger(business.id, TriggerType::Webhook)
            .await
        {
            Ok(all) => all
                .into_iter()
                .filter(|w| w.trigger_config.matches_webhook_key(webhook_key))
                .collect(),
            Err(e) => return fold_error(e),
        };

        if candidates.is_empty() {
            debug!(%business_id, webhook_key, "No workflows listen on webhook key");
        }

        let event = TriggerEvent::webhook_received(business.id, customer.id, webhook_key, payload);
        Ok(self.dispatch(&event, &customer, &business, candidates, None).await)
    }

    /// Gate and schedule each candidate; one workflow's failure never stops the batch
    async fn dispatch(
        &self,
        event: &TriggerEvent,
        customer: &Customer,
        business: &Business,
        candidates: Vec<Workflow>,
        exclude_request: Option<Uuid>,
    ) -> TriggerOutcome {
        let mut outcome = TriggerOutcome::default();
        if candidates.is_empty() {
            outcome.success = true;
            outcome.reason = Some(format!("no active {} workflows", event.trigger_type));
            return outcome;
        }

        let last_request_at = if candidates.iter().any(|w| w.conditions.needs_request_history()) {
            match self.review_requests.last_request_at(customer.id, exclude_request).await {
                Ok(last) => Ok(last),
                Err(e) => {
                    warn!(customer_id = %customer.id, "Could not load review request history: {}", e);
                    Err(e)
                }
            }
        } else {
            Ok(None)
        };

        let trigger_data = build_trigger_data(event, customer, business);
        let now = Utc::now();

        for workflow in &candidates {
            if workflow.conditions.needs_request_history() && last_request_at.is_err() {
                outcome.failed += 1;
                self.count(event.trigger_type, workflow.id, false);
                continue;
            }

            let ctx = EvaluationContext {
                customer,
                business: Some(business),
                event_data: &event.data,
                now,
                last_request_at: last_request_at.as_ref().ok().copied().flatten(),
            };
            if !eligible(workflow.id, &workflow.conditions, &ctx) {
                outcome.skipped += 1;
                continue;
            }

            let scheduled = AssertUnwindSafe(self.scheduler.schedule_from_trigger_config(
                workflow,
                customer.id,
                event.event_name(),
                trigger_data.clone(),
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AutomationError::Internal("scheduling panicked".to_string())));

            match scheduled {
                Ok(execution) => {
                    outcome.scheduled.push(execution.id);
                    self.count(event.trigger_type, workflow.id, true);
                }
                Err(e) => {
                    error!(
                        workflow_id = %workflow.id,
                        customer_id = %customer.id,
                        "Failed to schedule workflow: {}",
                        e
                    );
                    outcome.failed += 1;
                    self.count(event.trigger_type, workflow.id, false);
                }
            }
        }

        outcome.success = outcome.failed == 0;
        if outcome.scheduled.is_empty() && outcome.reason.is_none() {
            outcome.reason = Some("no workflow was scheduled".to_string());
        }

        info!(
            trigger = %event.trigger_type,
            customer_id = %customer.id,
            scheduled = outcome.scheduled.len(),
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Dispatched trigger event"
        );
        outcome
    }

    fn count(&self, trigger_type: TriggerType, workflow_id: Uuid, success: bool) {
        self.metrics
            .record_trigger(trigger_type.as_str(), workflow_id, success);
    }
}

/// Customer and business fields plus the event's own data
fn build_trigger_data(event: &TriggerEvent, customer: &Customer, business: &Business) -> Value {
    let mut data = Map::new();
    data.insert("event_id".to_string(), json!(event.event_id));
    data.insert("customer_id".to_string(), json!(customer.id));
    data.insert("customer_name".to_string(), json!(customer.name));
    data.insert("customer_email".to_string(), json!(customer.email));
    data.insert("customer_phone".to_string(), json!(customer.phone));
    data.insert("service_type".to_string(), json!(customer.service_type));
    data.insert("business_id".to_string(), json!(business.id));
    data.insert("business_name".to_string(), json!(business.name));
    data.insert("triggered_at".to_string(), json!(event.timestamp));

    for (key, value) in &event.data {
        data.insert(key.clone(), value.clone());
    }
    Value::Object(data)
}
