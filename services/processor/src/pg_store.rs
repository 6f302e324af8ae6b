use crate::config::DatabaseConfig;
use crate::record_store::{ImageRecord, PointSource, RecordStore, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// PostgreSQL-backed image location store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(image_id = %record.image_id))]
    async fn put(&self, record: &ImageRecord) -> Result<(), StoreError> {
        record.validate()?;

        sqlx::query(
            r#"
            INSERT INTO image_locations (
                image_id, storage_key, latitude, longitude, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, NOW(), NOW()
            )
            ON CONFLICT (image_id) DO UPDATE SET
                storage_key = EXCLUDED.storage_key,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                updated_at = NOW()
            "#,
        )
        .bind(&record.image_id)
        .bind(&record.storage_key)
        .bind(record.latitude)
        .bind(record.longitude)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        debug!(storage_key = %record.storage_key, "Image record upserted");

        Ok(())
    }
}

#[async_trait]
impl PointSource for PgRecordStore {
    async fn scan(&self) -> Result<Vec<ImageRecord>, StoreError> {
        sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT image_id, storage_key, latitude, longitude
            FROM image_locations
            ORDER BY image_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_error)
    }
}

fn store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => classify_sqlstate(db.code().as_deref(), db.message()),
        _ => StoreError::Unavailable(err.to_string()),
    }
}

/// Data exceptions (22) and integrity violations (23) are the record's fault;
/// everything else is the backend's.
fn classify_sqlstate(code: Option<&str>, message: &str) -> StoreError {
    match code {
        Some(code) if code.starts_with("22") || code.starts_with("23") => {
            StoreError::Validation(format!("{} ({})", message, code))
        }
        Some(code) => StoreError::Unavailable(format!("{} ({})", message, code)),
        None => StoreError::Unavailable(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sqlstate() {
        assert!(matches!(
            classify_sqlstate(Some("23514"), "violates check constraint"),
            StoreError::Validation(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("22003"), "numeric value out of range"),
            StoreError::Validation(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("53300"), "too many connections"),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            classify_sqlstate(None, "connection reset"),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(matches!(
            store_error(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
    }
}
