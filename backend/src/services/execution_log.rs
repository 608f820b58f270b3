use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repositories::ExecutionLogRepository;
use crate::services::metrics::MetricsService;
use reviewflow_shared::{ExecutionLogEntry, LogLevel};

enum LogCommand {
    Write(ExecutionLogEntry),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Fire-and-forget handle for execution log lines.
///
/// Lines go through a bounded queue to a single writer task. When the queue
/// is full the line is dropped and counted; callers never wait on storage.
#[derive(Clone)]
pub struct ExecutionLogSink {
    tx: mpsc::Sender<LogCommand>,
    dropped: Arc<AtomicU64>,
    metrics: MetricsService,
}

impl ExecutionLogSink {
    pub fn log(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        level: LogLevel,
        step: i32,
        message: impl Into<String>,
    ) {
        let entry = ExecutionLogEntry {
            id: Uuid::new_v4(),
            execution_id,
            workflow_id,
            level,
            step,
            message: message.into(),
            created_at: Utc::now(),
        };

        if self.tx.try_send(LogCommand::Write(entry)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_log_dropped();
            debug!(%execution_id, "Execution log queue full, line dropped");
        }
    }

    pub fn info(&self, execution_id: Uuid, workflow_id: Uuid, step: i32, message: impl Into<String>) {
        self.log(execution_id, workflow_id, LogLevel::Info, step, message);
    }

    pub fn warn(&self, execution_id: Uuid, workflow_id: Uuid, step: i32, message: impl Into<String>) {
        self.log(execution_id, workflow_id, LogLevel::Warn, step, message);
    }

    pub fn error(&self, execution_id: Uuid, workflow_id: Uuid, step: i32, message: impl Into<String>) {
        self.log(execution_id, workflow_id, LogLevel::Error, step, message);
    }

    /// Wait until every line queued before this call has been written.
    /// Returns false if the writer is gone.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).await.is_err() {
            return false;
        }
        done_rx.await.is_ok()
    }

    /// Lines dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The writer task behind an `ExecutionLogSink`
pub struct ExecutionLogWriter {
    tx: mpsc::Sender<LogCommand>,
    handle: JoinHandle<()>,
}

impl ExecutionLogWriter {
    pub fn spawn(
        repository: Arc<dyn ExecutionLogRepository>,
        capacity: usize,
        metrics: MetricsService,
    ) -> (ExecutionLogSink, ExecutionLogWriter) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(repository, rx));

        let sink = ExecutionLogSink {
            tx: tx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
            metrics,
        };

        (sink, ExecutionLogWriter { tx, handle })
    }

    /// Drain queued lines, then stop the writer
    pub async fn shutdown(self) {
        if self.tx.send(LogCommand::Shutdown).await.is_ok() {
            if let Err(e) = self.handle.await {
                warn!("Execution log writer ended abnormally: {}", e);
            }
        }
        info!("Execution log writer stopped");
    }
}

async fn run_writer(repository: Arc<dyn ExecutionLogRepository>, mut rx: mpsc::Receiver<LogCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Write(entry) => {
                if let Err(e) = repository.append(&entry).await {
                    debug!(execution_id = %entry.execution_id, "Discarding execution log line: {}", e);
                }
            }
            LogCommand::Flush(done) => {
                let _ = done.send(());
            }
            LogCommand::Shutdown => break,
        }
    }
}
