//! Client-server backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use sweepr_common::error::StoreError;
use sweepr_common::event::{NewEvent, NewTempEvent, ScanId, StoredEvent};

use super::{BackendError, EventRow, StoreBackend, finish, parse_json};

/// serialization_failure, deadlock_detected, lock_not_available
const CONTENTION_CODES: &[&str] = &["40001", "40P01", "55P03"];

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scan_events (
    id             BIGSERIAL PRIMARY KEY,
    date           TIMESTAMPTZ NOT NULL,
    target         TEXT NOT NULL,
    module_name    TEXT NOT NULL,
    scan_unique_id TEXT NOT NULL,
    port           TEXT NOT NULL,
    event          TEXT NOT NULL,
    json_event     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scan_events_pair ON scan_events(target, module_name);
CREATE INDEX IF NOT EXISTS idx_scan_events_scan ON scan_events(scan_unique_id);

CREATE TABLE IF NOT EXISTS temp_events (
    id             BIGSERIAL PRIMARY KEY,
    date           TIMESTAMPTZ NOT NULL,
    target         TEXT NOT NULL,
    module_name    TEXT NOT NULL,
    scan_unique_id TEXT NOT NULL,
    event_name     TEXT NOT NULL,
    port           TEXT NOT NULL,
    event          TEXT NOT NULL,
    data           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_temp_events_pair ON temp_events(target, module_name);
"#;

#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("postgres: {e}")))?;

        Ok(Self { pool })
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, BackendError> {
        self.pool.begin().await.map_err(classify)
    }
}

fn classify(err: sqlx::Error) -> BackendError {
    BackendError::from_sqlx(err, |code| CONTENTION_CODES.contains(&code))
}

#[async_trait]
impl StoreBackend for PostgresBackend {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn create_schema(&self) -> Result<(), BackendError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<(), BackendError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "INSERT INTO scan_events \
             (date, target, module_name, scan_unique_id, port, event, json_event) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.date)
        .bind(&event.target)
        .bind(&event.module_name)
        .bind(event.scan_id.as_str())
        .bind(event.port.to_string())
        .bind(event.event.to_string())
        .bind(event.json_event.to_string())
        .execute(&mut *tx)
        .await;

        finish(classify, tx, result).await.map(|_| ())
    }

    async fn insert_temp_event(&self, event: &NewTempEvent) -> Result<(), BackendError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "INSERT INTO temp_events \
             (date, target, module_name, scan_unique_id, event_name, port, event, data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.date)
        .bind(&event.target)
        .bind(&event.module_name)
        .bind(event.scan_id.as_str())
        .bind(&event.event_name)
        .bind(event.port.to_string())
        .bind(event.event.to_string())
        .bind(event.data.to_string())
        .execute(&mut *tx)
        .await;

        finish(classify, tx, result).await.map(|_| ())
    }

    async fn select_events(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
    ) -> Result<Vec<Value>, BackendError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT json_event FROM scan_events \
             WHERE target = $1 AND module_name = $2 AND scan_unique_id = $3 ORDER BY id",
        )
        .bind(target)
        .bind(module_name)
        .bind(scan_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(|(text,)| parse_json(&text)).collect())
    }

    async fn select_temp_event(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
        event_name: &str,
    ) -> Result<Option<Value>, BackendError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT data FROM temp_events \
             WHERE target = $1 AND module_name = $2 AND scan_unique_id = $3 AND event_name = $4 \
             ORDER BY id LIMIT 1",
        )
        .bind(target)
        .bind(module_name)
        .bind(scan_id.as_str())
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|(text,)| parse_json(&text)))
    }

    async fn delete_stale(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
    ) -> Result<u64, BackendError> {
        let mut tx = self.begin().await?;

        let mut removed: u64 = 0;
        for table in ["scan_events", "temp_events"] {
            let sql: String = format!(
                "DELETE FROM {table} \
                 WHERE target = $1 AND module_name = $2 AND scan_unique_id <> $3"
            );
            let result = sqlx::query(&sql)
                .bind(target)
                .bind(module_name)
                .bind(scan_id.as_str())
                .execute(&mut *tx)
                .await;

            match result {
                Ok(done) => removed += done.rows_affected(),
                Err(e) => return finish(classify, tx, Err(e)).await,
            }
        }

        finish(classify, tx, Ok(removed)).await
    }

    async fn select_by_target(&self, target: &str) -> Result<Vec<StoredEvent>, BackendError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, date, target, module_name, scan_unique_id, port, event, json_event \
             FROM scan_events WHERE target = $1 ORDER BY id",
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(StoredEvent::from).collect())
    }

    async fn select_by_scan(&self, scan_id: &ScanId) -> Result<Vec<StoredEvent>, BackendError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, date, target, module_name, scan_unique_id, port, event, json_event \
             FROM scan_events WHERE scan_unique_id = $1 ORDER BY id",
        )
        .bind(scan_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(StoredEvent::from).collect())
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
