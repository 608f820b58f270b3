// Background Jobs
//
// The automation worker runs a single recurring job that sweeps due
// workflow executions. Jobs are scheduled with tokio-cron-scheduler.

pub mod scheduler;

pub use scheduler::{JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus, EXECUTION_SWEEP_JOB};
