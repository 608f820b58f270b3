// Workflow Executor - runs one execution's delivery plan or action map

use chrono::Utc;
use futures::FutureExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ActionKind, ActionResult, EmailTemplateRef, ExecutionPlan, NamedAction, SmsMessageType, WebhookAction, Workflow};
use crate::error::{AutomationError, AutomationResult};
use crate::repositories::{BusinessRepository, CustomerRepository, ExecutionRepository, Repositories, WorkflowRepository};
use crate::services::metrics::MetricsService;
use crate::services::{EmailSender, ExecutionLogSink, SmsSender, WebhookDispatcher, WebhookRequest};
use reviewflow_shared::{Business, Customer, DeliveryMethod, WorkflowExecution};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern is valid"));

/// Result of workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub success: bool,
    pub actions_executed: i32,
    pub actions_failed: i32,
    pub total_duration_ms: i64,
    pub outputs: Vec<ActionResult>,
}

/// Outbound channels the executor delivers through
#[derive(Clone)]
pub struct DeliveryChannels {
    pub email: Arc<dyn EmailSender>,
    pub sms: Arc<dyn SmsSender>,
    pub webhooks: WebhookDispatcher,
}

#[derive(Debug)]
enum ActionOutcome {
    Succeeded(Option<Value>),
    Failed(String),
}

struct ActionContext<'a> {
    execution: &'a WorkflowExecution,
    workflow: &'a Workflow,
    customer: &'a Customer,
    business: &'a Business,
}

pub struct WorkflowExecutor {
    workflows: Arc<dyn WorkflowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    customers: Arc<dyn CustomerRepository>,
    businesses: Arc<dyn BusinessRepository>,
    channels: DeliveryChannels,
    metrics: MetricsService,
    log_sink: ExecutionLogSink,
}

impl WorkflowExecutor {
    pub fn new(
        repositories: &Repositories,
        channels: DeliveryChannels,
        metrics: MetricsService,
        log_sink: ExecutionLogSink,
    ) -> Self {
        Self {
            workflows: repositories.workflows.clone(),
            executions: repositories.executions.clone(),
            customers: repositories.customers.clone(),
            businesses: repositories.businesses.clone(),
            channels,
            metrics,
            log_sink,
        }
    }

    /// Run an execution; true when at least one action succeeded.
    /// Never fails: missing records and repository errors become `false`.
    pub async fn execute(&self, execution: &WorkflowExecution) -> bool {
        match self.run(execution).await {
            Ok(result) => result.success,
            Err(e) => {
                error!(
                    execution_id = %execution.id,
                    workflow_id = %execution.workflow_id,
                    "Execution aborted: {}",
                    e
                );
                self.log_sink.error(
                    execution.id,
                    execution.workflow_id,
                    execution.current_step,
                    format!("Execution aborted: {}", e),
                );
                false
            }
        }
    }

    pub async fn run(&self, execution: &WorkflowExecution) -> AutomationResult<ExecutionResult> {
        let started = Instant::now();

        let workflow = self
            .workflows
            .get(execution.business_id, execution.workflow_id)
            .await?
            .ok_or_else(|| AutomationError::not_found(format!("Workflow {}", execution.workflow_id)))?;
        let customer = self
            .customers
            .get(execution.business_id, execution.customer_id)
            .await?
            .ok_or_else(|| AutomationError::not_found(format!("Customer {}", execution.customer_id)))?;
        let business = self
            .businesses
            .get(execution.business_id)
            .await?
            .ok_or_else(|| AutomationError::not_found(format!("Business {}", execution.business_id)))?;

        let ctx = ActionContext {
            execution,
            workflow: &workflow,
            customer: &customer,
            business: &business,
        };

        // A delivery method runs as a single review request action
        let delivery_action;
        let actions: Vec<&NamedAction> = match workflow.plan() {
            ExecutionPlan::Delivery(method) => {
                delivery_action = NamedAction {
                    name: "delivery".to_string(),
                    enabled: true,
                    kind: ActionKind::ReviewRequest {
                        delivery_method: method,
                    },
                };
                vec![&delivery_action]
            }
            ExecutionPlan::Actions(map) => map.iter().collect(),
        };

        info!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            actions = actions.len(),
            "Executing workflow '{}'",
            workflow.name
        );

        let mut outputs = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let step = index as i32 + 1;
            if let Err(e) = self.executions.update_step(execution.id, step).await {
                debug!(execution_id = %execution.id, "Could not record step {}: {}", step, e);
            }

            let result = self.run_action(action, &ctx, step).await;
            self.metrics
                .record_action(workflow.id, &result.action_type, result.success);
            outputs.push(result);
        }

        let actions_failed = outputs.iter().filter(|r| !r.success).count() as i32;
        let success = outputs.iter().any(|r| r.success);
        if outputs.is_empty() {
            warn!(execution_id = %execution.id, "Workflow has no actions to run");
            self.log_sink
                .warn(execution.id, workflow.id, 0, "Workflow has no actions to run");
        }

        Ok(ExecutionResult {
            execution_id: execution.id,
            workflow_id: workflow.id,
            success,
            actions_executed: outputs.len() as i32,
            actions_failed,
            total_duration_ms: started.elapsed().as_millis() as i64,
            outputs,
        })
    }

    /// Run one action, turning errors and panics into a failed result
    async fn run_action(&self, action: &NamedAction, ctx: &ActionContext<'_>, step: i32) -> ActionResult {
        let execution_id = ctx.execution.id;
        let workflow_id = ctx.workflow.id;

        if !action.enabled {
            debug!(%execution_id, action = %action.name, "Action disabled, skipping");
            self.log_sink
                .info(execution_id, workflow_id, step, format!("Skipped disabled action '{}'", action.name));
            return ActionResult::skipped(action);
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.execute_action(action, ctx))
            .catch_unwind()
            .await;
        let duration = started.elapsed().as_millis() as i64;

        let result = match outcome {
            Ok(Ok(ActionOutcome::Succeeded(output))) => {
                self.log_sink.info(
                    execution_id,
                    workflow_id,
                    step,
                    format!("Action '{}' ({}) succeeded", action.name, action.kind.type_name()),
                );
                ActionResult::success(action, output)
            }
            Ok(Ok(ActionOutcome::Failed(reason))) => {
                warn!(%execution_id, action = %action.name, "Action failed: {}", reason);
                self.log_sink.warn(
                    execution_id,
                    workflow_id,
                    step,
                    format!("Action '{}' failed: {}", action.name, reason),
                );
                ActionResult::failure(action, reason)
            }
            Ok(Err(e)) => {
                error!(%execution_id, action = %action.name, "Action error: {}", e);
                self.log_sink.error(
                    execution_id,
                    workflow_id,
                    step,
                    format!("Action '{}' errored: {}", action.name, e),
                );
                ActionResult::failure(action, e.to_string())
            }
            Err(_) => {
                error!(%execution_id, action = %action.name, "Action panicked");
                self.log_sink.error(
                    execution_id,
                    workflow_id,
                    step,
                    format!("Action '{}' panicked", action.name),
                );
                ActionResult::failure(action, "action panicked")
            }
        };

        result.with_duration(duration)
    }

    async fn execute_action(&self, action: &NamedAction, ctx: &ActionContext<'_>) -> AutomationResult<ActionOutcome> {
        match &action.kind {
            ActionKind::Email { template } => self.send_email(template, ctx.customer, ctx.business).await,
            ActionKind::Sms {
                message_type,
                follow_up_type,
            } => {
                self.send_sms(*message_type, follow_up_type.as_deref(), ctx.customer, ctx.business)
                    .await
            }
            ActionKind::ReviewRequest { delivery_method } => {
                self.deliver(*delivery_method, ctx.customer, ctx.business).await
            }
            ActionKind::Delay => Ok(ActionOutcome::Succeeded(None)),
            ActionKind::Webhook(hook) => Ok(self.send_webhook(hook, ctx).await),
            ActionKind::Invalid { action_type, reason } => {
                warn!(action = %action.name, "Invalid {} action settings: {}", action_type, reason);
                Ok(ActionOutcome::Failed(format!("invalid {} settings: {}", action_type, reason)))
            }
            ActionKind::Unsupported { action_type } => {
                warn!(action = %action.name, "Unknown action type '{}'", action_type);
                Ok(ActionOutcome::Failed(format!("unknown action type '{}'", action_type)))
            }
        }
    }

    async fn send_email(
        &self,
        template: &EmailTemplateRef,
        customer: &Customer,
        business: &Business,
    ) -> AutomationResult<ActionOutcome> {
        if !customer.has_email() {
            return Ok(ActionOutcome::Failed("customer has no email address".to_string()));
        }

        let (sent, template_label) = match template {
            EmailTemplateRef::Type(t) | EmailTemplateRef::Name(t) => (
                self.channels
                    .email
                    .send_follow_up_email(customer, business, t)
                    .await?,
                t.as_str(),
            ),
            EmailTemplateRef::ReviewRequest => (
                self.channels
                    .email
                    .send_review_request_with_template(customer, business)
                    .await?,
                "review_request",
            ),
        };

        Ok(if sent {
            ActionOutcome::Succeeded(Some(json!({"channel": "email", "template": template_label})))
        } else {
            ActionOutcome::Failed("email was not sent".to_string())
        })
    }

    async fn send_sms(
        &self,
        message_type: SmsMessageType,
        follow_up_type: Option<&str>,
        customer: &Customer,
        business: &Business,
    ) -> AutomationResult<ActionOutcome> {
        let eligibility = self.channels.sms.eligibility(customer).await?;
        if !eligibility.eligible {
            return Ok(ActionOutcome::Failed(format!(
                "customer not eligible for sms: {}",
                eligibility.reason.as_deref().unwrap_or("no reason given")
            )));
        }

        let sms = &self.channels.sms;
        let result = match message_type {
            SmsMessageType::ReviewRequest => sms.send_review_request_sms(customer, business).await?,
            SmsMessageType::FollowUp => {
                sms.send_follow_up_sms(customer, business, follow_up_type.unwrap_or("follow_up"))
                    .await?
            }
            SmsMessageType::ThankYou => sms.send_follow_up_sms(customer, business, "thank_you").await?,
        };

        Ok(if result.success {
            ActionOutcome::Succeeded(Some(json!({"channel": "sms", "message_id": result.message_id})))
        } else {
            ActionOutcome::Failed(result.error.unwrap_or_else(|| "sms was not sent".to_string()))
        })
    }

    /// Review request fan-out; BOTH tries email first and falls back to SMS
    async fn deliver(
        &self,
        method: DeliveryMethod,
        customer: &Customer,
        business: &Business,
    ) -> AutomationResult<ActionOutcome> {
        match method {
            DeliveryMethod::Email => self.send_email(&EmailTemplateRef::ReviewRequest, customer, business).await,
            DeliveryMethod::Sms => {
                self.send_sms(SmsMessageType::ReviewRequest, None, customer, business)
                    .await
            }
            DeliveryMethod::Both => {
                match self.send_email(&EmailTemplateRef::ReviewRequest, customer, business).await {
                    Ok(ActionOutcome::Succeeded(output)) => return Ok(ActionOutcome::Succeeded(output)),
                    Ok(ActionOutcome::Failed(reason)) => {
                        debug!(customer_id = %customer.id, "Email delivery failed ({}), trying sms", reason);
                    }
                    Err(e) => {
                        warn!(customer_id = %customer.id, "Email delivery errored ({}), trying sms", e);
                    }
                }
                self.send_sms(SmsMessageType::ReviewRequest, None, customer, business)
                    .await
            }
        }
    }

    async fn send_webhook(&self, hook: &WebhookAction, ctx: &ActionContext<'_>) -> ActionOutcome {
        let request = build_webhook_request(hook, ctx.execution, ctx.customer, ctx.business);
        let delivery = self.channels.webhooks.deliver(&request).await;

        self.metrics
            .record_webhook_delivery(ctx.workflow.id, delivery.success);

        let output = json!({
            "url": request.url,
            "status": delivery.status,
            "attempts": delivery.attempts,
        });
        if delivery.success {
            ActionOutcome::Succeeded(Some(output))
        } else {
            ActionOutcome::Failed(format!(
                "webhook failed after {} attempt(s): {}",
                delivery.attempts,
                delivery.error.unwrap_or_default()
            ))
        }
    }
}

/// Standard webhook payload with caller-supplied keys merged over it
fn build_webhook_request(
    hook: &WebhookAction,
    execution: &WorkflowExecution,
    customer: &Customer,
    business: &Business,
) -> WebhookRequest {
    let context = json!({
        "event": execution.trigger_event,
        "timestamp": Utc::now().to_rfc3339(),
        "execution_id": execution.id,
        "workflow_id": execution.workflow_id,
        "customer": {
            "id": customer.id,
            "name": customer.name,
            "email": customer.email,
        },
        "business": {
            "id": business.id,
            "name": business.name,
        },
        "trigger_data": execution.trigger_data,
    });

    let mut body: Map<String, Value> = match &context {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in &hook.payload {
        body.insert(key.clone(), process_templates(value, &context));
    }

    WebhookRequest {
        url: replace_template_vars(&hook.url, &context),
        method: hook.method.clone(),
        headers: hook
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), replace_template_vars(v, &context)))
            .collect(),
        body: Value::Object(body),
    }
}

/// Resolve `{{path}}` placeholders in every string of a JSON value
pub fn process_templates(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(replace_template_vars(s, context)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), process_templates(v, context)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| process_templates(v, context)).collect()),
        _ => value.clone(),
    }
}

/// Unresolvable placeholders are left as written
pub fn replace_template_vars(template: &str, context: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match get_nested_value(context, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => caps[0].to_string(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

fn get_nested_value<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(json, |current, part| current.get(part.trim()))
}
