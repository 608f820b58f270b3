use prometheus::proto::MetricType;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Metric names as exported
pub mod metric_names {
    pub const WORKFLOW_TRIGGER_TOTAL: &str = "reviewflow_workflow_trigger_total";
    pub const WORKFLOW_EXECUTION_TOTAL: &str = "reviewflow_workflow_execution_total";
    pub const WORKFLOW_EXECUTION_DURATION_SECONDS: &str = "reviewflow_workflow_execution_duration_seconds";
    pub const WORKFLOW_ACTION_TOTAL: &str = "reviewflow_workflow_action_total";
    pub const WEBHOOK_DELIVERY_TOTAL: &str = "reviewflow_webhook_delivery_total";
    pub const EXECUTION_LOG_DROPPED: &str = "reviewflow_execution_log_dropped_total";
}

/// Prometheus collectors shared by the dispatcher, engine and log sink.
///
/// Each service owns its own `Registry`, so several engines can live in one
/// process without colliding on metric names.
#[derive(Clone)]
pub struct MetricsService {
    registry: Registry,
    trigger_total: IntCounterVec,
    execution_total: IntCounterVec,
    execution_duration: HistogramVec,
    action_total: IntCounterVec,
    webhook_delivery_total: IntCounterVec,
    log_dropped_total: IntCounter,
}

impl fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsService").finish_non_exhaustive()
    }
}

fn flag(success: bool) -> &'static str {
    if success { "true" } else { "false" }
}

impl MetricsService {
    pub fn new() -> prometheus::Result<Self> {
        let trigger_total = IntCounterVec::new(
            Opts::new(
                metric_names::WORKFLOW_TRIGGER_TOTAL,
                "Schedule attempts by trigger type, workflow and outcome",
            ),
            &["trigger_type", "workflow_id", "success"],
        )?;
        let execution_total = IntCounterVec::new(
            Opts::new(
                metric_names::WORKFLOW_EXECUTION_TOTAL,
                "Finished workflow executions by workflow and outcome",
            ),
            &["workflow_id", "success"],
        )?;
        let execution_duration = HistogramVec::new(
            HistogramOpts::new(
                metric_names::WORKFLOW_EXECUTION_DURATION_SECONDS,
                "Wall time of workflow executions (in seconds) by workflow",
            ),
            &["workflow_id"],
        )?;
        let action_total = IntCounterVec::new(
            Opts::new(
                metric_names::WORKFLOW_ACTION_TOTAL,
                "Dispatched workflow actions by workflow, action type and outcome",
            ),
            &["workflow_id", "action_type", "success"],
        )?;
        let webhook_delivery_total = IntCounterVec::new(
            Opts::new(
                metric_names::WEBHOOK_DELIVERY_TOTAL,
                "Webhook deliveries by workflow and outcome",
            ),
            &["workflow_id", "success"],
        )?;
        let log_dropped_total = IntCounter::new(
            metric_names::EXECUTION_LOG_DROPPED,
            "Execution log entries dropped because the queue was full",
        )?;

        let registry = Registry::new();
        registry.register(Box::new(trigger_total.clone()))?;
        registry.register(Box::new(execution_total.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(action_total.clone()))?;
        registry.register(Box::new(webhook_delivery_total.clone()))?;
        registry.register(Box::new(log_dropped_total.clone()))?;

        Ok(Self {
            registry,
            trigger_total,
            execution_total,
            execution_duration,
            action_total,
            webhook_delivery_total,
            log_dropped_total,
        })
    }

    pub fn record_trigger(&self, trigger_type: &str, workflow_id: Uuid, success: bool) {
        self.trigger_total
            .with_label_values(&[trigger_type, workflow_id.to_string().as_str(), flag(success)])
            .inc();
    }

    pub fn record_execution(&self, workflow_id: Uuid, success: bool, elapsed: Duration) {
        let workflow_id = workflow_id.to_string();
        self.execution_total
            .with_label_values(&[workflow_id.as_str(), flag(success)])
            .inc();
        self.execution_duration
            .with_label_values(&[workflow_id.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_action(&self, workflow_id: Uuid, action_type: &str, success: bool) {
        self.action_total
            .with_label_values(&[workflow_id.to_string().as_str(), action_type, flag(success)])
            .inc();
    }

    pub fn record_webhook_delivery(&self, workflow_id: Uuid, success: bool) {
        self.webhook_delivery_total
            .with_label_values(&[workflow_id.to_string().as_str(), flag(success)])
            .inc();
    }

    pub fn record_log_dropped(&self) {
        self.log_dropped_total.inc();
    }

    /// Text exposition format of every registered collector
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Sum of a metric over every series whose labels include `filter`.
    ///
    /// Counters contribute their value, histograms their sample count.
    pub fn counter(&self, name: &str, filter: &[(&str, &str)]) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| {
                let kind = family.get_field_type();
                family.get_metric().iter().map(move |metric| (kind, metric))
            })
            .filter(|(_, metric)| {
                filter.iter().all(|(key, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
                })
            })
            .map(|(kind, metric)| match kind {
                MetricType::HISTOGRAM => metric.get_histogram().get_sample_count(),
                _ => metric.get_counter().get_value() as u64,
            })
            .sum()
    }

    /// Sum of a metric across every label set
    pub fn total(&self, name: &str) -> u64 {
        self.counter(name, &[])
    }
}
