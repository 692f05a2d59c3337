//! Database models for pipeline runs

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::model::PipelineRun;

/// Database representation of a finalized run
#[derive(Debug, Clone, FromRow)]
pub struct PipelineRunRow {
    pub job_id: String,
    pub pipeline_variant: String,
    pub status: String,
    pub quality: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl PipelineRunRow {
    pub fn from_domain(run: &PipelineRun) -> Result<Self, String> {
        let payload = serde_json::to_value(run).map_err(|e| format!("Failed to serialize run: {}", e))?;

        Ok(Self {
            job_id: run.job_id.clone(),
            pipeline_variant: run.pipeline_variant.to_string(),
            status: enum_label(&run.status)?,
            quality: enum_label(&run.quality)?,
            created_at: run.created_at,
            completed_at: run.completed_at,
            payload,
        })
    }

    /// Convert database row to domain model
    pub fn into_domain(self) -> Result<PipelineRun, String> {
        serde_json::from_value(self.payload)
            .map_err(|e| format!("Invalid payload for run {}: {}", self.job_id, e))
    }
}

/// snake_case serde name of a unit enum variant
fn enum_label<T: Serialize>(value: &T) -> Result<String, String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(format!("Expected a string label, got {}", other)),
        Err(e) => Err(e.to_string()),
    }
}
