// Job Scheduler - drives the due-execution sweep on a fixed interval

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use crate::workflows::{SweepSummary, WorkflowScheduler};

pub const EXECUTION_SWEEP_JOB: &str = "execution_sweep";
const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub items_failed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Completed,
    Failed,
    PartialFailure,
    /// Previous run still in progress
    Skipped,
}

type ExecutionLogs = Arc<RwLock<Vec<JobExecutionLog>>>;

pub struct JobScheduler {
    scheduler: TokioScheduler,
    workflows: Arc<WorkflowScheduler>,
    interval: Duration,
    execution_logs: ExecutionLogs,
}

async fn record(logs: &ExecutionLogs, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    if logs.len() > MAX_EXECUTION_LOGS {
        logs.remove(0);
    }
}

/// One sweep, recorded in the job log
async fn run_sweep(workflows: &WorkflowScheduler, logs: &ExecutionLogs) -> JobResult<SweepSummary> {
    let started_at = Utc::now();
    let result = workflows.process_due_executions().await;
    let completed_at = Utc::now();

    let (status, processed, failed, errors) = match &result {
        Ok(summary) if summary.skipped => (JobStatus::Skipped, 0, 0, Vec::new()),
        Ok(summary) if summary.failed == 0 => (JobStatus::Completed, summary.claimed as i32, 0, Vec::new()),
        Ok(summary) => (
            JobStatus::PartialFailure,
            summary.claimed as i32,
            summary.failed as i32,
            Vec::new(),
        ),
        Err(e) => (JobStatus::Failed, 0, 0, vec![e.to_string()]),
    };

    record(
        logs,
        JobExecutionLog {
            id: Uuid::new_v4(),
            job_name: EXECUTION_SWEEP_JOB.to_string(),
            started_at,
            completed_at: Some(completed_at),
            status,
            items_processed: processed,
            items_failed: failed,
            errors,
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
        },
    )
    .await;

    result.map_err(|e| JobError::ExecutionError(e.to_string()))
}

impl JobScheduler {
    pub async fn new(workflows: Arc<WorkflowScheduler>) -> JobResult<Self> {
        let interval = Duration::from_secs(workflows.engine_config().sweep_interval_secs);
        if interval.is_zero() {
            return Err(JobError::ConfigError("sweep interval must be positive".to_string()));
        }

        let scheduler = TokioScheduler::new().await?;
        Ok(Self {
            scheduler,
            workflows,
            interval,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting workflow job scheduler");

        self.schedule_execution_sweep().await?;
        self.scheduler.start().await?;

        info!("Workflow job scheduler started");
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down workflow job scheduler");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_execution_sweep(&self) -> JobResult<()> {
        let workflows = self.workflows.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_repeated_async(self.interval, move |_uuid, _lock| {
            let workflows = workflows.clone();
            let logs = logs.clone();

            Box::pin(async move {
                match run_sweep(&workflows, &logs).await {
                    Ok(summary) if summary.claimed > 0 => {
                        info!(
                            "Execution sweep completed: {} claimed, {} completed, {} failed",
                            summary.claimed, summary.completed, summary.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Execution sweep failed: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled execution sweep every {:?}", self.interval);
        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<SweepSummary> {
        match job_name {
            EXECUTION_SWEEP_JOB => run_sweep(&self.workflows, &self.execution_logs).await,
            _ => Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }
    }
}
