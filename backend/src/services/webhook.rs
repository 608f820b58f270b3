use crate::config::WebhookConfig;
use crate::services::DeliveryError;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An outbound webhook call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    /// Perform one attempt; transport failures are errors, any HTTP status is a response
    async fn call(&self, request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError>;
}

/// `reqwest` caller with a per-attempt timeout
#[derive(Debug, Clone)]
pub struct HttpWebhookCaller {
    client: reqwest::Client,
}

impl HttpWebhookCaller {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("reviewflow-webhooks/1.0")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn call(&self, request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| DeliveryError::Failed(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.json(&request.body).send().await?;
        Ok(WebhookResponse {
            status: response.status().as_u16(),
        })
    }
}

/// Exponential backoff between webhook attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&WebhookConfig::default())
    }
}

impl From<&WebhookConfig> for RetryPolicy {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(2_u32.saturating_pow(retry.saturating_sub(1)))
            .min(self.max_delay);

        if self.jitter && !base.is_zero() {
            base + Duration::from_millis(rand::thread_rng().gen_range(0..100))
        } else {
            base
        }
    }
}

/// Outcome of a delivery including retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub success: bool,
    pub status: Option<u16>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Delivers webhooks, retrying 5xx responses only
#[derive(Clone)]
pub struct WebhookDispatcher {
    caller: Arc<dyn WebhookCaller>,
    policy: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(caller: Arc<dyn WebhookCaller>, policy: RetryPolicy) -> Self {
        Self { caller, policy }
    }

    pub async fn deliver(&self, request: &WebhookRequest) -> WebhookDelivery {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(url = %request.url, attempt, "Calling webhook");

            match self.caller.call(request).await {
                Ok(response) if response.is_success() => {
                    info!(url = %request.url, status = response.status, attempt, "Webhook delivered");
                    return WebhookDelivery {
                        success: true,
                        status: Some(response.status),
                        attempts: attempt,
                        error: None,
                    };
                }
                Ok(response) if response.is_server_error() && attempt < max_attempts => {
                    let delay = self.policy.delay_for_retry(attempt);
                    warn!(
                        url = %request.url,
                        status = response.status,
                        attempt,
                        "Webhook returned server error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => {
                    warn!(url = %request.url, status = response.status, attempt, "Webhook delivery failed");
                    return WebhookDelivery {
                        success: false,
                        status: Some(response.status),
                        attempts: attempt,
                        error: Some(format!("webhook returned status {}", response.status)),
                    };
                }
                Err(e) => {
                    warn!(url = %request.url, attempt, "Webhook call failed: {}", e);
                    return WebhookDelivery {
                        success: false,
                        status: None,
                        attempts: attempt,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }
}
