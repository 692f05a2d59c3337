//! Database module for PostgreSQL persistence of pipeline runs

pub mod models;
pub mod repository;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::env;

pub use repository::{MemoryRunStore, PgRunStore, RunStore};

// Environment variable names
const ENV_POSTGRES_HOST: &str = "FACTHARBOR_POSTGRES_HOST";
const ENV_POSTGRES_PORT: &str = "FACTHARBOR_POSTGRES_PORT";
const ENV_POSTGRES_USER: &str = "FACTHARBOR_POSTGRES_USER";
const ENV_POSTGRES_PASSWORD: &str = "FACTHARBOR_POSTGRES_PASSWORD";
const ENV_POSTGRES_DB: &str = "FACTHARBOR_POSTGRES_DB";

// Default values
const DEFAULT_POSTGRES_HOST: &str = "127.0.0.1";
const DEFAULT_POSTGRES_PORT: &str = "5432";
const DEFAULT_POSTGRES_USER: &str = "factharbor";
const DEFAULT_POSTGRES_PASSWORD: &str = "factharbor";
const DEFAULT_POSTGRES_DB: &str = "factharbor";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Create a new database connection pool
pub async fn create_pool() -> Result<PgPool, DbError> {
    let host = env::var(ENV_POSTGRES_HOST).unwrap_or_else(|_| DEFAULT_POSTGRES_HOST.to_string());
    let port = env::var(ENV_POSTGRES_PORT).unwrap_or_else(|_| DEFAULT_POSTGRES_PORT.to_string());
    let user = env::var(ENV_POSTGRES_USER).unwrap_or_else(|_| DEFAULT_POSTGRES_USER.to_string());
    let password =
        env::var(ENV_POSTGRES_PASSWORD).unwrap_or_else(|_| DEFAULT_POSTGRES_PASSWORD.to_string());
    let database = env::var(ENV_POSTGRES_DB).unwrap_or_else(|_| DEFAULT_POSTGRES_DB.to_string());

    let database_url = format!(
        "postgres://{}:{}@{}:{}/{}",
        user, password, host, port, database
    );

    tracing::debug!(host = %host, port = %port, database = %database, "Connecting to PostgreSQL");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    tracing::info!(host = %host, port = %port, "PostgreSQL connection established");

    Ok(pool)
}

/// Initialize database schema
pub async fn init_schema(pool: &PgPool) -> Result<(), DbError> {
    // The run itself is an opaque payload; the other columns exist for listing and cleanup
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            job_id VARCHAR(64) PRIMARY KEY,
            pipeline_variant VARCHAR(50) NOT NULL,
            status VARCHAR(50) NOT NULL,
            quality VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ NOT NULL,
            payload JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_created_at ON pipeline_runs(created_at)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database schema initialized");

    Ok(())
}
