use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    BusinessRepository, CustomerRepository, ExecutionLogRepository, ExecutionRepository,
    ReviewRequestRepository, WorkflowRepository,
};
use crate::error::{AutomationError, AutomationResult};
use crate::workflows::{ActionMap, ConditionSet, TriggerConfig, Workflow};
use reviewflow_shared::{
    Business, Customer, DeliveryMethod, ExecutionLogEntry, ExecutionStatus, TriggerType, WorkflowExecution,
};

/// PostgreSQL implementation of every repository trait
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    business_id: Uuid,
    name: String,
    description: Option<String>,
    trigger_type: TriggerType,
    trigger_config: Value,
    actions: Value,
    conditions: Value,
    delivery_method: Option<DeliveryMethod>,
    is_active: bool,
    execution_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        let trigger_config = TriggerConfig::new(row.trigger_config);
        trigger_config.report_issues(row.id);

        Workflow {
            id: row.id,
            business_id: row.business_id,
            name: row.name,
            description: row.description,
            trigger_type: row.trigger_type,
            trigger_config,
            actions: ActionMap::new(row.actions),
            conditions: ConditionSet::new(row.conditions),
            delivery_method: row.delivery_method,
            is_active: row.is_active,
            execution_count: row.execution_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const WORKFLOW_COLUMNS: &str = r#"
    id, business_id, name, description, trigger_type, trigger_config, actions,
    conditions, delivery_method, is_active, execution_count, created_at, updated_at
"#;

#[async_trait]
impl WorkflowRepository for PgStore {
    async fn insert(&self, workflow: &Workflow) -> AutomationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows
            (id, business_id, name, description, trigger_type, trigger_config, actions,
             conditions, delivery_method, is_active, execution_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $12)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.business_id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.trigger_type)
        .bind(serde_json::to_value(&workflow.trigger_config)?)
        .bind(serde_json::to_value(&workflow.actions)?)
        .bind(serde_json::to_value(&workflow.conditions)?)
        .bind(workflow.delivery_method)
        .bind(workflow.is_active)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, workflow: &Workflow) -> AutomationResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET name = $3, description = $4, trigger_config = $5, actions = $6,
                conditions = $7, delivery_method = $8, is_active = $9, updated_at = $10
            WHERE id = $1 AND business_id = $2
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.business_id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(serde_json::to_value(&workflow.trigger_config)?)
        .bind(serde_json::to_value(&workflow.actions)?)
        .bind(serde_json::to_value(&workflow.conditions)?)
        .bind(workflow.delivery_method)
        .bind(workflow.is_active)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, business_id: Uuid, id: Uuid) -> AutomationResult<Option<Workflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {} FROM workflows WHERE id = $1 AND business_id = $2",
            WORKFLOW_COLUMNS
        ))
        .bind(id)
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Workflow::from))
    }

    async fn list(&self, business_id: Uuid) -> AutomationResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {} FROM workflows WHERE business_id = $1 ORDER BY created_at ASC",
            WORKFLOW_COLUMNS
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Workflow::from).collect())
    }

    async fn list_active_by_trigger(
        &self,
        business_id: Uuid,
        trigger_type: TriggerType,
    ) -> AutomationResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            SELECT {} FROM workflows
            WHERE business_id = $1 AND trigger_type = $2 AND is_active = true
            ORDER BY created_at ASC
            "#,
            WORKFLOW_COLUMNS
        ))
        .bind(business_id)
        .bind(trigger_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Workflow::from).collect())
    }

    async fn set_active(&self, business_id: Uuid, id: Uuid, active: bool) -> AutomationResult<bool> {
        let result = sqlx::query(
            "UPDATE workflows SET is_active = $3, updated_at = NOW() WHERE id = $1 AND business_id = $2",
        )
        .bind(id)
        .bind(business_id)
        .bind(active)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, business_id: Uuid, id: Uuid) -> AutomationResult<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1 AND business_id = $2")
            .bind(id)
            .bind(business_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExecutionRepository for PgStore {
    async fn create_for_workflow(&self, execution: &WorkflowExecution) -> AutomationResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE workflows SET execution_count = execution_count + 1 WHERE id = $1")
            .bind(execution.workflow_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(AutomationError::not_found(format!("Workflow {}", execution.workflow_id)));
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_executions
            (id, workflow_id, customer_id, business_id, trigger_event, trigger_data,
             scheduled_for, status, current_step, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.customer_id)
        .bind(execution.business_id)
        .bind(&execution.trigger_event)
        .bind(&execution.trigger_data)
        .bind(execution.scheduled_for)
        .bind(execution.status)
        .bind(execution.current_step)
        .bind(execution.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> AutomationResult<Vec<WorkflowExecution>> {
        let claimed = sqlx::query_as::<_, WorkflowExecution>(
            r#"
            UPDATE workflow_executions
            SET status = 'PROCESSING', started_at = $1
            WHERE id IN (
                SELECT id FROM workflow_executions
                WHERE status = 'PENDING' AND (scheduled_for IS NULL OR scheduled_for <= $1)
                ORDER BY scheduled_for ASC NULLS FIRST, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(claimed)
    }

    async fn update_step(&self, id: Uuid, step: i32) -> AutomationResult<()> {
        sqlx::query("UPDATE workflow_executions SET current_step = $2 WHERE id = $1")
            .bind(id)
            .bind(step)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> AutomationResult<()> {
        sqlx::query(
            "UPDATE workflow_executions SET status = $2, error_message = $3, completed_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_workflow(&self, workflow_id: Uuid, limit: i64) -> AutomationResult<Vec<WorkflowExecution>> {
        Ok(sqlx::query_as::<_, WorkflowExecution>(
            "SELECT * FROM workflow_executions WHERE workflow_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn status_counts(&self, workflow_id: Uuid) -> AutomationResult<HashMap<ExecutionStatus, i64>> {
        let rows = sqlx::query_as::<_, (ExecutionStatus, i64)>(
            "SELECT status, COUNT(*) FROM workflow_executions WHERE workflow_id = $1 GROUP BY status",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl CustomerRepository for PgStore {
    async fn get(&self, business_id: Uuid, id: Uuid) -> AutomationResult<Option<Customer>> {
        Ok(
            sqlx::query_as::<_, Customer>("SELECT * FROM customers WHERE id = $1 AND business_id = $2")
                .bind(id)
                .bind(business_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn mark_automation_triggered(&self, id: Uuid, at: DateTime<Utc>) -> AutomationResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE customers
            SET automation_triggered = true, automation_triggered_at = $2, updated_at = $2
            WHERE id = $1 AND automation_triggered = false
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_service_completed(
        &self,
        id: Uuid,
        service_type: Option<&str>,
        at: DateTime<Utc>,
    ) -> AutomationResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE customers
            SET service_completed_at = $2, service_type = COALESCE($3, service_type), updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(service_type)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AutomationError::not_found(format!("Customer {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BusinessRepository for PgStore {
    async fn get(&self, id: Uuid) -> AutomationResult<Option<Business>> {
        Ok(sqlx::query_as::<_, Business>("SELECT * FROM businesses WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }
}

#[async_trait]
impl ReviewRequestRepository for PgStore {
    async fn last_request_at(
        &self,
        customer_id: Uuid,
        exclude: Option<Uuid>,
    ) -> AutomationResult<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(created_at) FROM review_requests
            WHERE customer_id = $1 AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(customer_id)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await?;

        Ok(last)
    }
}

#[async_trait]
impl ExecutionLogRepository for PgStore {
    async fn append(&self, entry: &ExecutionLogEntry) -> AutomationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_execution_logs (id, execution_id, workflow_id, level, step, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.execution_id)
        .bind(entry.workflow_id)
        .bind(entry.level)
        .bind(entry.step)
        .bind(&entry.message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: Uuid) -> AutomationResult<Vec<ExecutionLogEntry>> {
        Ok(sqlx::query_as::<_, ExecutionLogEntry>(
            "SELECT * FROM workflow_execution_logs WHERE execution_id = $1 ORDER BY created_at ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
