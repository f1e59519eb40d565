//! Embedded single-file backend.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};

use sweepr_common::error::StoreError;
use sweepr_common::event::{NewEvent, NewTempEvent, ScanId, StoredEvent};

use super::{BackendError, EventRow, StoreBackend, finish, parse_json};

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

const MAX_CONNECTIONS: u32 = 4;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scan_events (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    date           TEXT NOT NULL,
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
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    date           TEXT NOT NULL,
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
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub async fn connect(
        path: &Path,
        journal_mode: &str,
        synchronous: &str,
        busy_timeout_ms: u64,
    ) -> Result<Self, StoreError> {
        let unavailable = |e: sqlx::Error| StoreError::Unavailable(format!("sqlite: {e}"));

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::from_str(journal_mode).map_err(unavailable)?)
            .synchronous(SqliteSynchronous::from_str(synchronous).map_err(unavailable)?)
            .busy_timeout(Duration::from_millis(busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        Ok(Self { pool })
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, BackendError> {
        self.pool.begin().await.map_err(classify)
    }
}

fn classify(err: sqlx::Error) -> BackendError {
    BackendError::from_sqlx(err, is_busy_or_locked)
}

/// Extended result codes carry the primary code in their low byte.
fn is_busy_or_locked(code: &str) -> bool {
    code.parse::<i64>()
        .is_ok_and(|n| matches!(n & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    fn engine(&self) -> &'static str {
        "sqlite"
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
             VALUES (?, ?, ?, ?, ?, ?, ?)",
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
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
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
             WHERE target = ? AND module_name = ? AND scan_unique_id = ? ORDER BY id",
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
             WHERE target = ? AND module_name = ? AND scan_unique_id = ? AND event_name = ? \
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

        let events = sqlx::query(
            "DELETE FROM scan_events \
             WHERE target = ? AND module_name = ? AND scan_unique_id != ?",
        )
        .bind(target)
        .bind(module_name)
        .bind(scan_id.as_str())
        .execute(&mut *tx)
        .await;

        let events = match events {
            Ok(done) => done.rows_affected(),
            Err(e) => return finish(classify, tx, Err(e)).await,
        };

        let temps = sqlx::query(
            "DELETE FROM temp_events \
             WHERE target = ? AND module_name = ? AND scan_unique_id != ?",
        )
        .bind(target)
        .bind(module_name)
        .bind(scan_id.as_str())
        .execute(&mut *tx)
        .await
        .map(|done| events + done.rows_affected());

        finish(classify, tx, temps).await
    }

    async fn select_by_target(&self, target: &str) -> Result<Vec<StoredEvent>, BackendError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, date, target, module_name, scan_unique_id, port, event, json_event \
             FROM scan_events WHERE target = ? ORDER BY id",
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
             FROM scan_events WHERE scan_unique_id = ? ORDER BY id",
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
