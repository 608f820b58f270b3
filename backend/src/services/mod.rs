// Delivery adapters and side-channel services used by the workflow engine

pub mod email;
pub mod execution_log;
pub mod metrics;
pub mod sms;
pub mod webhook;

pub use email::{EmailSender, EmailService, EmailTemplate};
pub use execution_log::{ExecutionLogSink, ExecutionLogWriter};
pub use metrics::{metric_names, MetricsService};
pub use sms::{SmsEligibility, SmsSendResult, SmsSender, SmsService};
pub use webhook::{
    HttpWebhookCaller, RetryPolicy, WebhookCaller, WebhookDelivery, WebhookDispatcher, WebhookRequest,
    WebhookResponse,
};

use thiserror::Error;

/// Failure reported by a delivery adapter
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("Message build error: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("Address error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("Delivery failed: {0}")]
    Failed(String),
}
