use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::domain::{PipelineId, PipelineSource};

pub const AUDIT_TARGET: &str = "ci_autocancel::audit";

/// One line of the auto-cancel audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoCancelRecord {
    pub message: String,
    pub canceled_pipeline_id: PipelineId,
    pub canceled_by_pipeline_id: PipelineId,
    pub canceled_by_pipeline_source: PipelineSource,
    pub canceled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_url: Option<String>,
}

impl AutoCancelRecord {
    pub fn new(
        canceled_pipeline_id: PipelineId,
        canceled_by_pipeline_id: PipelineId,
        canceled_by_pipeline_source: PipelineSource,
    ) -> Self {
        Self {
            message: "Pipeline auto-canceled by a newer pipeline on the same ref".to_string(),
            canceled_pipeline_id,
            canceled_by_pipeline_id,
            canceled_by_pipeline_source,
            canceled_at: Utc::now(),
            pipeline_url: None,
        }
    }

    pub fn with_pipeline_url(mut self, url: Option<String>) -> Self {
        self.pipeline_url = url;
        self
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AutoCancelRecord) -> Result<(), AuditError>;
}

/// Writes each record as a JSON line to the `ci_autocancel::audit` log target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, entry: &AutoCancelRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(entry)?;
        info!(target: AUDIT_TARGET, "{line}");
        Ok(())
    }
}

/// Hands `entry` to `sink`; a failing sink never fails the cancellation.
pub fn emit(sink: &dyn AuditSink, entry: &AutoCancelRecord) {
    if let Err(e) = sink.record(entry) {
        debug!(
            "Dropped audit record for pipeline {}: {}",
            entry.canceled_pipeline_id, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingAuditSink;

    #[test]
    fn test_record_serializes_without_missing_url() {
        let record = AutoCancelRecord::new(3, 7, PipelineSource::Push);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["canceled_pipeline_id"], 3);
        assert_eq!(json["canceled_by_pipeline_id"], 7);
        assert_eq!(json["canceled_by_pipeline_source"], "push");
        assert!(json.get("pipeline_url").is_none());
    }

    #[test]
    fn test_record_includes_url_when_known() {
        let record = AutoCancelRecord::new(3, 7, PipelineSource::Schedule)
            .with_pipeline_url(Some("https://gitlab.com/group/project/-/pipelines/3".into()));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(
            json["pipeline_url"],
            "https://gitlab.com/group/project/-/pipelines/3"
        );
    }

    #[test]
    fn test_emit_swallows_sink_errors() {
        let sink = RecordingAuditSink::failing();
        emit(&sink, &AutoCancelRecord::new(1, 2, PipelineSource::Web));
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_log_sink_accepts_records() {
        assert!(LogAuditSink
            .record(&AutoCancelRecord::new(1, 2, PipelineSource::Api))
            .is_ok());
    }
}
