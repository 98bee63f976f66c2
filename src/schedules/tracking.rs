use indexmap::IndexMap;
use log::error;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};

const METER_NAME: &str = "ci_autocancel";

pub const FAILED_CREATION_COUNTER: &str = "pipeline_schedule_creation_failed_total";

/// Key/value context attached to a tracked error, kept in insertion order.
pub type ErrorContext = IndexMap<&'static str, String>;

/// Receives unexpected errors that must not crash the caller.
pub trait ErrorTracker: Send + Sync {
    fn track(&self, error: &(dyn std::error::Error + 'static), context: &ErrorContext);
}

/// Reports tracked errors through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorTracker;

impl ErrorTracker for LogErrorTracker {
    fn track(&self, error: &(dyn std::error::Error + 'static), context: &ErrorContext) {
        let context = context
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        error!("Tracked error: {error} ({context})");
    }
}

/// OpenTelemetry instruments of the schedule worker.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    failed_creations: Counter<u64>,
}

impl WorkerMetrics {
    pub fn new(meter: &Meter) -> Self {
        let failed_creations = meter
            .u64_counter(FAILED_CREATION_COUNTER)
            .with_description("Counter of failed attempts of pipeline schedule creation")
            .build();

        Self { failed_creations }
    }

    pub fn record_failed_creation(&self) {
        self.failed_creations.add(1, &[]);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new(&global::meter(METER_NAME))
    }
}
