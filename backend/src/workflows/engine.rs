// Workflow Engine - workflow definitions and their management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::templates::{self, WorkflowTemplate};
use super::{ActionKind, ActionMap, ConditionSet, ExecutionPlan, TriggerConfig, TriggerType};
use crate::error::{AutomationError, AutomationResult, ValidationBuilder};
use crate::repositories::{BusinessRepository, ExecutionRepository, WorkflowRepository};
use reviewflow_shared::{DeliveryMethod, ExecutionStatus, WorkflowExecution};

/// A tenant-owned automation definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_config: TriggerConfig,
    pub actions: ActionMap,
    pub conditions: ConditionSet,
    pub delivery_method: Option<DeliveryMethod>,
    pub is_active: bool,
    pub execution_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn plan(&self) -> ExecutionPlan<'_> {
        ExecutionPlan::resolve(self.delivery_method, &self.actions)
    }
}

fn default_true() -> bool {
    true
}

/// Distinguishes an absent field from an explicit `null`
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateWorkflowRequest {
    #[validate(length(min = 1, max = 120, message = "Name must be between 1 and 120 characters"))]
    pub name: String,
    #[validate(length(max = 1000, message = "Description must be at most 1000 characters"))]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Value,
    #[serde(default)]
    pub actions: Value,
    #[serde(default)]
    pub conditions: Value,
    pub delivery_method: Option<DeliveryMethod>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateWorkflowRequest {
    #[validate(length(min = 1, max = 120, message = "Name must be between 1 and 120 characters"))]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    pub trigger_config: Option<Value>,
    pub actions: Option<Value>,
    pub conditions: Option<Value>,
    #[serde(default, deserialize_with = "double_option")]
    pub delivery_method: Option<Option<DeliveryMethod>>,
    pub is_active: Option<bool>,
}

/// Execution counts for one workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowMetrics {
    pub workflow_id: Uuid,
    pub execution_count: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// completed / (completed + failed), 0 when nothing has finished
    pub success_rate: f64,
}

/// Semantic checks shared by create and update
fn validate_definition(
    trigger_type: TriggerType,
    trigger_config: &TriggerConfig,
    actions: &ActionMap,
    conditions: &ConditionSet,
    delivery_method: Option<DeliveryMethod>,
) -> AutomationResult<()> {
    let mut errors = ValidationBuilder::new();

    for issue in &trigger_config.issues {
        errors.push("trigger_config", issue);
    }

    if trigger_type == TriggerType::Webhook
        && trigger_config.webhook_keys.as_ref().map(|k| k.is_empty()).unwrap_or(true)
    {
        errors.push("trigger_config", "webhook workflows need at least one webhook key");
    }

    if actions.is_empty() && delivery_method.is_none() {
        errors.push("actions", "either an action map or a delivery method is required");
    }

    for action in actions.iter() {
        match &action.kind {
            ActionKind::Invalid { reason, .. } => {
                errors.push("actions", &format!("{}: {}", action.name, reason));
            }
            ActionKind::Unsupported { action_type } => {
                errors.push(
                    "actions",
                    &format!("{}: unsupported action type '{}'", action.name, action_type),
                );
            }
            ActionKind::Webhook(hook) if !hook.url.contains("{{") => match url::Url::parse(&hook.url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                _ => errors.push("actions", &format!("{}: invalid webhook_url '{}'", action.name, hook.url)),
            },
            _ => {}
        }
    }

    for key in conditions.invalid_keys() {
        errors.push("conditions", &format!("invalid value for '{}'", key));
    }

    match errors.build() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// CRUD, templates and history for workflows
pub struct WorkflowService {
    workflows: Arc<dyn WorkflowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    businesses: Arc<dyn BusinessRepository>,
}

impl WorkflowService {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        executions: Arc<dyn ExecutionRepository>,
        businesses: Arc<dyn BusinessRepository>,
    ) -> Self {
        Self {
            workflows,
            executions,
            businesses,
        }
    }

    async fn ensure_business(&self, business_id: Uuid) -> AutomationResult<()> {
        match self.businesses.get(business_id).await? {
            Some(_) => Ok(()),
            None => Err(AutomationError::not_found(format!("Business {}", business_id))),
        }
    }

    pub async fn create_workflow(
        &self,
        business_id: Uuid,
        request: CreateWorkflowRequest,
    ) -> AutomationResult<Workflow> {
        request.validate()?;
        self.ensure_business(business_id).await?;

        let trigger_config = TriggerConfig::new(request.trigger_config);
        let actions = ActionMap::new(request.actions);
        let conditions = ConditionSet::new(request.conditions);
        validate_definition(
            request.trigger_type,
            &trigger_config,
            &actions,
            &conditions,
            request.delivery_method,
        )?;

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            business_id,
            name: request.name.trim().to_string(),
            description: request.description,
            trigger_type: request.trigger_type,
            trigger_config,
            actions,
            conditions,
            delivery_method: request.delivery_method,
            is_active: request.is_active,
            execution_count: 0,
            created_at: now,
            updated_at: now,
        };

        self.workflows.insert(&workflow).await?;
        info!(workflow_id = %workflow.id, %business_id, "Created workflow '{}'", workflow.name);
        Ok(workflow)
    }

    pub fn templates(&self) -> Vec<WorkflowTemplate> {
        templates::catalogue()
    }

    pub async fn create_from_template(
        &self,
        business_id: Uuid,
        template_key: &str,
        name: Option<String>,
    ) -> AutomationResult<Workflow> {
        let template = templates::find(template_key)
            .ok_or_else(|| AutomationError::not_found(format!("Workflow template '{}'", template_key)))?;

        self.create_workflow(
            business_id,
            CreateWorkflowRequest {
                name: name.unwrap_or_else(|| template.name.to_string()),
                description: Some(template.description.to_string()),
                trigger_type: template.trigger_type,
                trigger_config: template.trigger_config,
                actions: template.actions,
                conditions: template.conditions,
                delivery_method: template.delivery_method,
                is_active: true,
            },
        )
        .await
    }

    pub async fn get_workflow(&self, business_id: Uuid, id: Uuid) -> AutomationResult<Workflow> {
        self.workflows
            .get(business_id, id)
            .await?
            .ok_or_else(|| AutomationError::not_found(format!("Workflow {}", id)))
    }

    pub async fn list_workflows(&self, business_id: Uuid) -> AutomationResult<Vec<Workflow>> {
        self.workflows.list(business_id).await
    }

    pub async fn update_workflow(
        &self,
        business_id: Uuid,
        id: Uuid,
        request: UpdateWorkflowRequest,
    ) -> AutomationResult<Workflow> {
        request.validate()?;
        let mut workflow = self.get_workflow(business_id, id).await?;

        if let Some(name) = request.name {
            workflow.name = name.trim().to_string();
        }
        if let Some(description) = request.description {
            workflow.description = description;
        }
        if let Some(raw) = request.trigger_config {
            workflow.trigger_config = TriggerConfig::new(raw);
        }
        if let Some(raw) = request.actions {
            workflow.actions = ActionMap::new(raw);
        }
        if let Some(raw) = request.conditions {
            workflow.conditions = ConditionSet::new(raw);
        }
        if let Some(method) = request.delivery_method {
            workflow.delivery_method = method;
        }
        if let Some(active) = request.is_active {
            workflow.is_active = active;
        }

        validate_definition(
            workflow.trigger_type,
            &workflow.trigger_config,
            &workflow.actions,
            &workflow.conditions,
            workflow.delivery_method,
        )?;

        workflow.updated_at = Utc::now();
        if !self.workflows.update(&workflow).await? {
            return Err(AutomationError::not_found(format!("Workflow {}", id)));
        }

        info!(workflow_id = %id, "Updated workflow");
        Ok(workflow)
    }

    pub async fn activate_workflow(&self, business_id: Uuid, id: Uuid) -> AutomationResult<()> {
        self.set_active(business_id, id, true).await
    }

    pub async fn deactivate_workflow(&self, business_id: Uuid, id: Uuid) -> AutomationResult<()> {
        self.set_active(business_id, id, false).await
    }

    async fn set_active(&self, business_id: Uuid, id: Uuid, active: bool) -> AutomationResult<()> {
        if !self.workflows.set_active(business_id, id, active).await? {
            return Err(AutomationError::not_found(format!("Workflow {}", id)));
        }
        info!(workflow_id = %id, active, "Workflow activation changed");
        Ok(())
    }

    /// Deleting a workflow removes its executions with it
    pub async fn delete_workflow(&self, business_id: Uuid, id: Uuid) -> AutomationResult<()> {
        if !self.workflows.delete(business_id, id).await? {
            return Err(AutomationError::not_found(format!("Workflow {}", id)));
        }
        warn!(workflow_id = %id, %business_id, "Deleted workflow");
        Ok(())
    }

    pub async fn execution_history(
        &self,
        business_id: Uuid,
        id: Uuid,
        limit: i64,
    ) -> AutomationResult<Vec<WorkflowExecution>> {
        self.get_workflow(business_id, id).await?;
        self.executions.list_for_workflow(id, limit.clamp(1, 500)).await
    }

    pub async fn workflow_metrics(&self, business_id: Uuid, id: Uuid) -> AutomationResult<WorkflowMetrics> {
        let workflow = self.get_workflow(business_id, id).await?;
        let counts = self.executions.status_counts(id).await?;
        let count = |status| counts.get(&status).copied().unwrap_or(0);

        let completed = count(ExecutionStatus::Completed);
        let failed = count(ExecutionStatus::Failed);
        let finished = completed + failed;

        Ok(WorkflowMetrics {
            workflow_id: id,
            execution_count: workflow.execution_count,
            pending: count(ExecutionStatus::Pending),
            processing: count(ExecutionStatus::Processing),
            completed,
            failed,
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
        })
    }
}
