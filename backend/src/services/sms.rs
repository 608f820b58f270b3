use crate::config::{SmsConfig, DEFAULT_SMS_TIMEOUT_SECS};
use crate::services::DeliveryError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reviewflow_shared::{Business, Customer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsEligibility {
    pub eligible: bool,
    pub reason: Option<String>,
}

impl SmsEligibility {
    pub fn eligible() -> Self {
        Self {
            eligible: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsSendResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SmsSendResult {
    pub fn sent(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Outbound SMS channel; eligibility covers consent and rate limits
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn eligibility(&self, customer: &Customer) -> Result<SmsEligibility, DeliveryError>;

    async fn send_review_request_sms(
        &self,
        customer: &Customer,
        business: &Business,
    ) -> Result<SmsSendResult, DeliveryError>;

    async fn send_follow_up_sms(
        &self,
        customer: &Customer,
        business: &Business,
        subtype: &str,
    ) -> Result<SmsSendResult, DeliveryError>;
}

#[derive(Debug, Deserialize)]
struct GatewayMessage {
    sid: Option<String>,
}

type SendHistory = HashMap<Uuid, Vec<DateTime<Utc>>>;

/// SMS through the Twilio Messages API
pub struct SmsService {
    client: reqwest::Client,
    config: Option<SmsConfig>,
    sent: Mutex<SendHistory>,
}

/// Start of the rate-limit window ending at `now`
fn window_start(now: DateTime<Utc>, window_hours: u32) -> DateTime<Utc> {
    Duration::try_hours(i64::from(window_hours))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl SmsService {
    pub fn new(config: Option<SmsConfig>) -> Result<Self, DeliveryError> {
        let config = config.filter(SmsConfig::is_configured);
        let timeout = config
            .as_ref()
            .map(SmsConfig::timeout)
            .unwrap_or(std::time::Duration::from_secs(DEFAULT_SMS_TIMEOUT_SECS));
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            config,
            sent: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn history(&self) -> std::sync::MutexGuard<'_, SendHistory> {
        match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sent_in_window(&self, customer_id: Uuid, since: DateTime<Utc>) -> usize {
        self.history()
            .get(&customer_id)
            .map(|history| history.iter().filter(|at| **at > since).count())
            .unwrap_or(0)
    }

    /// Record a send and forget every timestamp older than the window
    fn record_sent(&self, customer_id: Uuid, at: DateTime<Utc>, since: DateTime<Utc>) {
        let mut sent = self.history();
        sent.retain(|_, history| {
            history.retain(|t| *t > since);
            !history.is_empty()
        });
        sent.entry(customer_id).or_default().push(at);
    }

    async fn send(&self, customer: &Customer, body: String) -> Result<SmsSendResult, DeliveryError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| DeliveryError::NotConfigured("sms".to_string()))?;

        let to = customer
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| DeliveryError::InvalidRecipient(format!("customer {} has no phone", customer.id)))?;

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            config.api_base_url.trim_end_matches('/'),
            config.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&config.account_sid, Some(&config.auth_token))
            .form(&[("To", to), ("From", config.from_number.as_str()), ("Body", body.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(customer_id = %customer.id, "SMS gateway returned {}: {}", status, text);
            return Ok(SmsSendResult::failed(format!("gateway returned {}", status)));
        }

        let message: GatewayMessage = response.json().await?;
        let now = Utc::now();
        self.record_sent(customer.id, now, window_start(now, config.rate_limit_window_hours));
        info!(customer_id = %customer.id, "SMS sent");
        Ok(SmsSendResult::sent(message.sid))
    }
}

/// Message body for a subtype
pub fn render_message(subtype: &str, customer: &Customer, business: &Business) -> String {
    let name = customer.name.split_whitespace().next().unwrap_or("there");
    let review_url = business.review_url.as_deref().unwrap_or("");

    match subtype {
        "review_request" => format!(
            "Hi {}, thanks for choosing {}! Would you mind leaving us a quick review? {} Reply STOP to opt out.",
            name, business.name, review_url
        ),
        "thank_you" => format!(
            "Hi {}, thank you for your review of {}. We really appreciate it! Reply STOP to opt out.",
            name, business.name
        ),
        "reminder" => format!(
            "Hi {}, a friendly reminder from {}: we'd still love your feedback. {} Reply STOP to opt out.",
            name, business.name, review_url
        ),
        _ => format!(
            "Hi {}, {} here. How did everything go? We'd love to hear from you: {} Reply STOP to opt out.",
            name, business.name, review_url
        ),
    }
}

#[async_trait]
impl SmsSender for SmsService {
    async fn eligibility(&self, customer: &Customer) -> Result<SmsEligibility, DeliveryError> {
        let Some(config) = self.config.as_ref() else {
            return Ok(SmsEligibility::denied("sms is not configured"));
        };
        if !customer.has_phone() {
            return Ok(SmsEligibility::denied("customer has no phone number"));
        }
        if !customer.sms_opt_in {
            return Ok(SmsEligibility::denied("customer has not opted in to sms"));
        }

        let since = window_start(Utc::now(), config.rate_limit_window_hours);
        let sent = self.sent_in_window(customer.id, since);
        if sent >= config.max_messages_per_window as usize {
            warn!(customer_id = %customer.id, sent, "SMS rate limit reached");
            return Ok(SmsEligibility::denied(format!(
                "rate limit of {} messages per {}h reached",
                config.max_messages_per_window, config.rate_limit_window_hours
            )));
        }

        Ok(SmsEligibility::eligible())
    }

    async fn send_review_request_sms(
        &self,
        customer: &Customer,
        business: &Business,
    ) -> Result<SmsSendResult, DeliveryError> {
        self.send(customer, render_message("review_request", customer, business))
            .await
    }

    async fn send_follow_up_sms(
        &self,
        customer: &Customer,
        business: &Business,
        subtype: &str,
    ) -> Result<SmsSendResult, DeliveryError> {
        self.send(customer, render_message(subtype, customer, business)).await
    }
}
