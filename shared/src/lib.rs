use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle event category a workflow reacts to
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "workflow_trigger_type", rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    CustomerCreated,
    ServiceCompleted,
    ReviewCompleted,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerCreated => "CUSTOMER_CREATED",
            Self::ServiceCompleted => "SERVICE_COMPLETED",
            Self::ReviewCompleted => "REVIEW_COMPLETED",
            Self::Webhook => "WEBHOOK",
        }
    }

    /// Event name recorded on executions and sent in webhook payloads
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CustomerCreated => "customer_created",
            Self::ServiceCompleted => "service_completed",
            Self::ReviewCompleted => "review_completed",
            Self::Webhook => "webhook_received",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CUSTOMER_CREATED" => Ok(Self::CustomerCreated),
            "SERVICE_COMPLETED" => Ok(Self::ServiceCompleted),
            "REVIEW_COMPLETED" => Ok(Self::ReviewCompleted),
            "WEBHOOK" => Ok(Self::Webhook),
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

/// Single/multi-channel send shortcut
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "delivery_method", rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Email,
    Sms,
    Both,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Both => "BOTH",
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Self::Email),
            "SMS" => Ok(Self::Sms),
            "BOTH" => Ok(Self::Both),
            other => Err(format!("unknown delivery method '{}'", other)),
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "execution_status", rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    /// Claimed by a sweep, running
    Processing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "execution_log_level", rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub industry: Option<String>,
    pub review_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub service_type: Option<String>,
    pub sms_opt_in: bool,
    pub automation_triggered: bool,
    pub automation_triggered_at: Option<DateTime<Utc>>,
    pub service_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Customer {
    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    pub fn has_phone(&self) -> bool {
        self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    /// Has the fields automation needs and has not been triggered yet
    pub fn is_ready_for_automation(&self) -> bool {
        !self.name.trim().is_empty()
            && (self.has_email() || self.has_phone())
            && !self.automation_triggered
    }

    pub fn age_in_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: Uuid,
    pub business_id: Uuid,
    pub customer_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One scheduled/attempted run of a workflow for one customer
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub customer_id: Uuid,
    pub business_id: Uuid,
    pub trigger_event: String,
    pub trigger_data: serde_json::Value,
    /// `None` means run on the next sweep
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub current_step: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn pending(
        workflow_id: Uuid,
        customer_id: Uuid,
        business_id: Uuid,
        trigger_event: &str,
        trigger_data: serde_json::Value,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            customer_id,
            business_id,
            trigger_event: trigger_event.to_string(),
            trigger_data,
            scheduled_for,
            status: ExecutionStatus::Pending,
            current_step: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending
            && self.scheduled_for.map(|at| at <= now).unwrap_or(true)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub level: LogLevel,
    pub step: i32,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
