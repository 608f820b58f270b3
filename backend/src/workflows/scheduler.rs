// Workflow Scheduler - delayed execution records and the due-execution sweep

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{TriggerConfig, Workflow, WorkflowExecutor};
use crate::config::{BusinessHours, EngineConfig};
use crate::error::AutomationResult;
use crate::repositories::ExecutionRepository;
use crate::services::metrics::MetricsService;
use reviewflow_shared::{ExecutionStatus, WorkflowExecution};

fn is_business_day(at: DateTime<Utc>, hours: BusinessHours) -> bool {
    !hours.weekdays_only || !matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
}

fn opening_on(day: DateTime<Utc>, hours: BusinessHours) -> DateTime<Utc> {
    let open = NaiveTime::from_hms_opt(hours.start_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    day.date_naive().and_time(open).and_utc()
}

/// Earliest instant at or after `at` that falls inside business hours
pub fn next_business_time(at: DateTime<Utc>, hours: BusinessHours) -> DateTime<Utc> {
    if is_business_day(at, hours) && at.hour() >= hours.start_hour && at.hour() < hours.end_hour {
        return at;
    }

    let mut day = if at.hour() < hours.start_hour { at } else { at + Duration::days(1) };
    for _ in 0..7 {
        if is_business_day(day, hours) {
            return opening_on(day, hours);
        }
        day += Duration::days(1);
    }
    opening_on(day, hours)
}

/// When an execution should run, or `None` for the next sweep.
///
/// The delay is the sum of the day/hour/minute keys. `business_hours_only`
/// moves the result forward to the next opening when it lands outside the
/// configured window.
pub fn compute_scheduled_for(
    config: &TriggerConfig,
    now: DateTime<Utc>,
    hours: BusinessHours,
) -> Option<DateTime<Utc>> {
    let delay = config.delay();
    let target = delay
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now);

    if config.business_hours_only {
        let shifted = next_business_time(target, hours);
        if delay.is_none() && shifted == target {
            return None;
        }
        return Some(shifted);
    }

    delay.map(|_| target)
}

/// Counts from one sweep tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Another sweep was still running
    pub skipped: bool,
    pub duration_ms: i64,
}

pub struct WorkflowScheduler {
    executions: Arc<dyn ExecutionRepository>,
    executor: Arc<WorkflowExecutor>,
    metrics: MetricsService,
    config: EngineConfig,
    business_hours: BusinessHours,
    sweep_lock: Mutex<()>,
}

impl WorkflowScheduler {
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        executor: Arc<WorkflowExecutor>,
        metrics: MetricsService,
        config: EngineConfig,
        business_hours: BusinessHours,
    ) -> Self {
        Self {
            executions,
            executor,
            metrics,
            config,
            business_hours,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persist a PENDING execution for `workflow` and bump its counter
    pub async fn schedule_from_trigger_config(
        &self,
        workflow: &Workflow,
        customer_id: Uuid,
        trigger_event: &str,
        trigger_data: Value,
    ) -> AutomationResult<WorkflowExecution> {
        workflow.trigger_config.report_issues(workflow.id);
        let scheduled_for = compute_scheduled_for(&workflow.trigger_config, Utc::now(), self.business_hours);

        let execution = WorkflowExecution::pending(
            workflow.id,
            customer_id,
            workflow.business_id,
            trigger_event,
            trigger_data,
            scheduled_for,
        );
        self.executions.create_for_workflow(&execution).await?;

        info!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            %customer_id,
            scheduled_for = ?scheduled_for,
            "Scheduled workflow execution"
        );
        Ok(execution)
    }

    /// Claim due executions and run them on a bounded worker pool
    pub async fn process_due_executions(&self) -> AutomationResult<SweepSummary> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("Previous sweep still running, skipping tick");
            return Ok(SweepSummary {
                skipped: true,
                ..Default::default()
            });
        };

        let started = Instant::now();
        let due = self
            .executions
            .claim_due(Utc::now(), self.config.sweep_batch_size)
            .await?;

        let mut summary = SweepSummary {
            claimed: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        info!("Processing {} due workflow executions", due.len());
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_executions.max(1)));
        let mut tasks = JoinSet::new();

        for execution in due {
            let permits = permits.clone();
            let executor = self.executor.clone();
            let executions = self.executions.clone();
            let metrics = self.metrics.clone();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                run_claimed(execution, executor, executions, metrics).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => summary.completed += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!("Execution task ended abnormally: {}", e);
                    summary.failed += 1;
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as i64;
        info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            "Sweep finished in {}ms",
            summary.duration_ms
        );
        Ok(summary)
    }
}

/// Run one claimed execution and record its terminal status
async fn run_claimed(
    execution: WorkflowExecution,
    executor: Arc<WorkflowExecutor>,
    executions: Arc<dyn ExecutionRepository>,
    metrics: MetricsService,
) -> bool {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(executor.execute(&execution)).catch_unwind().await;

    let (status, error_message) = match outcome {
        Ok(true) => (ExecutionStatus::Completed, None),
        Ok(false) => (ExecutionStatus::Failed, Some("no action succeeded".to_string())),
        Err(_) => {
            error!(execution_id = %execution.id, "Execution panicked");
            (ExecutionStatus::Failed, Some("execution panicked".to_string()))
        }
    };
    let success = status == ExecutionStatus::Completed;

    if let Err(e) = executions.finish(execution.id, status, error_message, Utc::now()).await {
        warn!(execution_id = %execution.id, "Failed to record execution status {}: {}", status.as_str(), e);
    }

    metrics.record_execution(execution.workflow_id, success, started.elapsed());

    success
}
