// Workflow Automation Engine
//
// Event-driven review automation: lifecycle triggers are matched against
// tenant workflows, gated by conditions, scheduled with optional delays and
// executed by a periodic sweep.

pub mod actions;
pub mod conditions;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod scheduler;
pub mod templates;
pub mod triggers;

pub use actions::{
    ActionKind, ActionMap, ActionResult, EmailTemplateRef, ExecutionPlan, NamedAction, SmsMessageType,
    WebhookAction,
};
pub use conditions::{eligible, Condition, ConditionSet, EvaluationContext};
pub use dispatcher::{TriggerOutcome, WorkflowTriggerService};
pub use engine::{CreateWorkflowRequest, UpdateWorkflowRequest, Workflow, WorkflowMetrics, WorkflowService};
pub use executor::{DeliveryChannels, ExecutionResult, WorkflowExecutor};
pub use scheduler::{compute_scheduled_for, SweepSummary, WorkflowScheduler};
pub use templates::WorkflowTemplate;
pub use triggers::{TriggerConfig, TriggerEvent, TriggerType, WebhookKeys, MAX_DELAY_DAYS};
