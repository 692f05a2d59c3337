//! Repository for pipeline run persistence

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;

use super::DbError;
use super::models::PipelineRunRow;
use crate::model::PipelineRun;

/// Persistence collaborator: stores finalized runs keyed by job id
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: &PipelineRun) -> Result<(), DbError>;

    async fn load(&self, job_id: &str) -> Result<PipelineRun, DbError>;

    /// Cheap liveness check of the backing store
    async fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// PostgreSQL store keeping each run as an opaque JSONB payload
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), DbError> {
        let row = PipelineRunRow::from_domain(run).map_err(DbError::Serialization)?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                job_id, pipeline_variant, status, quality, created_at, completed_at, payload
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO UPDATE SET
                pipeline_variant = EXCLUDED.pipeline_variant,
                status = EXCLUDED.status,
                quality = EXCLUDED.quality,
                completed_at = EXCLUDED.completed_at,
                payload = EXCLUDED.payload
            "#,
        )
        .bind(&row.job_id)
        .bind(&row.pipeline_variant)
        .bind(&row.status)
        .bind(&row.quality)
        .bind(row.created_at)
        .bind(row.completed_at)
        .bind(&row.payload)
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %row.job_id, status = %row.status, "Saved pipeline run");
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<PipelineRun, DbError> {
        let row: PipelineRunRow = sqlx::query_as(
            r#"
            SELECT * FROM pipeline_runs WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(job_id.to_string()))?;

        row.into_domain().map_err(DbError::Serialization)
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

/// In-process store, used when no database is configured and in tests
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), DbError> {
        let payload = serde_json::to_value(run).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(run.job_id.clone(), payload);
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<PipelineRun, DbError> {
        let payload = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(job_id.to_string()))?;
        serde_json::from_value(payload).map_err(|e| DbError::Serialization(e.to_string()))
    }
}
