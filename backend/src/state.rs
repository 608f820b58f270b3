// Application state - wires repositories, delivery channels and the engine

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AutomationResult;
use crate::repositories::Repositories;
use crate::services::{
    DeliveryError, EmailService, ExecutionLogSink, ExecutionLogWriter, HttpWebhookCaller, MetricsService, RetryPolicy,
    SmsService, WebhookDispatcher,
};
use crate::workflows::{DeliveryChannels, WorkflowExecutor, WorkflowScheduler, WorkflowService, WorkflowTriggerService};

pub struct AppState {
    pub config: Config,
    pub repositories: Repositories,
    pub metrics: MetricsService,
    pub log_sink: ExecutionLogSink,
    pub executor: Arc<WorkflowExecutor>,
    pub scheduler: Arc<WorkflowScheduler>,
    pub triggers: Arc<WorkflowTriggerService>,
    pub workflows: Arc<WorkflowService>,
}

impl AppState {
    /// Production delivery channels built from configuration
    pub fn delivery_channels(config: &Config) -> Result<DeliveryChannels, DeliveryError> {
        if !config.smtp.is_configured() {
            warn!(host = %config.smtp.host, "SMTP credentials are not set");
        }
        let email = EmailService::new(&config.smtp)?;

        let sms = SmsService::new(config.sms.clone())?;
        if sms.is_configured() {
            info!("SMS delivery enabled");
        } else {
            warn!("SMS is not configured, SMS actions will report ineligible");
        }
        let caller = HttpWebhookCaller::new(config.webhook.timeout())?;

        Ok(DeliveryChannels {
            email: Arc::new(email),
            sms: Arc::new(sms),
            webhooks: WebhookDispatcher::new(Arc::new(caller), RetryPolicy::from(&config.webhook)),
        })
    }

    /// Build the engine. Must run inside a tokio runtime; the returned writer
    /// owns the execution log task and should be shut down last.
    pub fn build(
        config: Config,
        repositories: Repositories,
        channels: DeliveryChannels,
    ) -> AutomationResult<(Self, ExecutionLogWriter)> {
        let metrics = MetricsService::new()?;
        let (log_sink, log_writer) = ExecutionLogWriter::spawn(
            repositories.execution_logs.clone(),
            config.engine.log_queue_capacity,
            metrics.clone(),
        );

        let executor = Arc::new(WorkflowExecutor::new(
            &repositories,
            channels,
            metrics.clone(),
            log_sink.clone(),
        ));
        let scheduler = Arc::new(WorkflowScheduler::new(
            repositories.executions.clone(),
            executor.clone(),
            metrics.clone(),
            config.engine.clone(),
            config.business_hours,
        ));
        let triggers = Arc::new(WorkflowTriggerService::new(
            &repositories,
            scheduler.clone(),
            metrics.clone(),
        ));
        let workflows = Arc::new(WorkflowService::new(
            repositories.workflows.clone(),
            repositories.executions.clone(),
            repositories.businesses.clone(),
        ));

        let state = Self {
            config,
            repositories,
            metrics,
            log_sink,
            executor,
            scheduler,
            triggers,
            workflows,
        };
        Ok((state, log_writer))
    }
}
