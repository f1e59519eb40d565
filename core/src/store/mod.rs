//! # Event Log Store
//!
//! Durable storage for findings (`scan_events`) and cross-pass signals
//! (`temp_events`).
//!
//! The layering is:
//! * [`StoreBackend`]: one engine, one attempt per call. Reports lock contention
//!   separately from every other failure.
//! * [`EventLog`]: wraps any backend and applies the [`RetryPolicy`] to every call.
//!   This is the only [`EventStore`] implementation.
//!
//! Writes are at-least-once. A write that times out after the engine committed it
//! may be retried and land twice.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Database, FromRow, Transaction};
use tracing::{debug, warn};

use sweepr_common::config::{ExhaustionPolicy, RetryPolicy, StoreConfig, StoreSettings};
use sweepr_common::error::StoreError;
use sweepr_common::event::{NewEvent, NewTempEvent, ScanId, StoredEvent, WriteOutcome};
use sweepr_common::store::EventStore;

mod postgres;
mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// Failure of a single backend attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The engine refused because of a competing writer. Worth retrying.
    Contention(String),
    Other(String),
}

impl BackendError {
    /// Sorts an engine error into contention or not.
    ///
    /// `is_contention_code` recognizes the engine specific codes that mean
    /// "locked, try again".
    pub(crate) fn from_sqlx(err: sqlx::Error, is_contention_code: fn(&str) -> bool) -> Self {
        let message: String = err.to_string();

        let contended: bool = match &err {
            sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => {
                db.code().is_some_and(|code| is_contention_code(&code))
                    || message.contains("database is locked")
            }
            _ => false,
        };

        if contended {
            BackendError::Contention(message)
        } else {
            BackendError::Other(message)
        }
    }

    fn message(&self) -> &str {
        match self {
            BackendError::Contention(msg) | BackendError::Other(msg) => msg,
        }
    }
}

/// Commits on success, rolls back and reports on failure.
pub(crate) async fn finish<DB: Database, T>(
    classify: fn(sqlx::Error) -> BackendError,
    tx: Transaction<'static, DB>,
    result: Result<T, sqlx::Error>,
) -> Result<T, BackendError> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(classify)?;
            Ok(value)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(classify(e))
        }
    }
}

/// A `scan_events` row as both engines return it. JSON columns are TEXT.
#[derive(FromRow)]
pub(crate) struct EventRow {
    id: i64,
    date: DateTime<Utc>,
    target: String,
    module_name: String,
    scan_unique_id: String,
    port: String,
    event: String,
    json_event: String,
}

impl From<EventRow> for StoredEvent {
    fn from(row: EventRow) -> Self {
        StoredEvent {
            id: row.id,
            date: row.date,
            target: row.target,
            module_name: row.module_name,
            scan_id: ScanId::from(row.scan_unique_id),
            port: parse_json(&row.port),
            event: parse_json(&row.event),
            json_event: parse_json(&row.json_event),
        }
    }
}

/// Columns are written by this crate, so a parse failure means a hand-edited
/// row. Surface it as a JSON string instead of dropping it.
pub(crate) fn parse_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Raw operations of one storage engine. No retries happen at this level.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn engine(&self) -> &'static str;

    async fn create_schema(&self) -> Result<(), BackendError>;

    async fn insert_event(&self, event: &NewEvent) -> Result<(), BackendError>;

    async fn insert_temp_event(&self, event: &NewTempEvent) -> Result<(), BackendError>;

    async fn select_events(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
    ) -> Result<Vec<Value>, BackendError>;

    async fn select_temp_event(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
        event_name: &str,
    ) -> Result<Option<Value>, BackendError>;

    /// Removes rows from both tables in one transaction.
    async fn delete_stale(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
    ) -> Result<u64, BackendError>;

    async fn select_by_target(&self, target: &str) -> Result<Vec<StoredEvent>, BackendError>;

    async fn select_by_scan(&self, scan_id: &ScanId) -> Result<Vec<StoredEvent>, BackendError>;
}

/// Retry wrapper that turns any [`StoreBackend`] into an [`EventStore`].
pub struct EventLog<B> {
    backend: B,
    policy: RetryPolicy,
}

impl<B: StoreBackend> EventLog<B> {
    pub fn new(backend: B, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails for a non-contention reason, or the
    /// attempts run out. `Ok(None)` means the attempts ran out under the silent
    /// policy.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<Option<T>, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts: u32 = self.policy.attempts();

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(BackendError::Contention(msg)) => {
                    debug!("{operation}: contention on attempt {attempt}/{attempts}: {msg}");
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.retry_delay()).await;
                    }
                }
                Err(BackendError::Other(msg)) => return Err(StoreError::Backend(msg)),
            }
        }

        match self.policy.on_exhausted {
            ExhaustionPolicy::Silent => {
                warn!(
                    "{operation}: dropped after {attempts} attempts on {}",
                    self.backend.engine()
                );
                Ok(None)
            }
            ExhaustionPolicy::FailLoud => Err(StoreError::RetriesExhausted {
                operation,
                attempts,
            }),
        }
    }

    async fn read<T, F, Fut>(&self, operation: &'static str, op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        match self.with_retry(operation, op).await {
            Ok(value) => value,
            Err(e) => {
                warn!("{operation} failed, returning nothing: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl<B: StoreBackend> EventStore for EventLog<B> {
    async fn append(&self, event: NewEvent) -> Result<WriteOutcome, StoreError> {
        let backend: &B = &self.backend;
        let event: &NewEvent = &event;

        let outcome = self
            .with_retry("append", move || backend.insert_event(event))
            .await?;
        Ok(outcome.map_or(WriteOutcome::Dropped, |_| WriteOutcome::Written))
    }

    async fn append_temp(&self, event: NewTempEvent) -> Result<WriteOutcome, StoreError> {
        let backend: &B = &self.backend;
        let event: &NewTempEvent = &event;

        let outcome = self
            .with_retry("append_temp", move || backend.insert_temp_event(event))
            .await?;
        Ok(outcome.map_or(WriteOutcome::Dropped, |_| WriteOutcome::Written))
    }

    async fn query(&self, target: &str, module_name: &str, scan_id: &ScanId) -> Vec<Value> {
        let backend: &B = &self.backend;
        self.read("query", move || {
            backend.select_events(target, module_name, scan_id)
        })
        .await
        .unwrap_or_default()
    }

    async fn query_temp(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
        event_name: &str,
    ) -> Option<Value> {
        let backend: &B = &self.backend;
        self.read("query_temp", move || {
            backend.select_temp_event(target, module_name, scan_id, event_name)
        })
        .await
        .flatten()
    }

    async fn purge_stale(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
    ) -> Result<u64, StoreError> {
        let backend: &B = &self.backend;
        let removed = self
            .with_retry("purge_stale", move || {
                backend.delete_stale(target, module_name, scan_id)
            })
            .await?;
        Ok(removed.unwrap_or(0))
    }

    async fn events_for_target(&self, target: &str) -> Vec<StoredEvent> {
        let backend: &B = &self.backend;
        self.read("events_for_target", move || backend.select_by_target(target))
            .await
            .unwrap_or_default()
    }

    async fn events_for_scan(&self, scan_id: &ScanId) -> Vec<StoredEvent> {
        let backend: &B = &self.backend;
        self.read("events_for_scan", move || backend.select_by_scan(scan_id))
            .await
            .unwrap_or_default()
    }
}

/// Connects and creates the schema. Used once by the orchestrating process;
/// any failure here aborts the scan before dispatch.
pub async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn EventStore>, StoreError> {
    connect(settings, true).await
}

/// Connects to a store whose schema already exists. Used by worker processes.
pub async fn attach_store(settings: &StoreSettings) -> Result<Arc<dyn EventStore>, StoreError> {
    connect(settings, false).await
}

async fn connect(
    settings: &StoreSettings,
    create_schema: bool,
) -> Result<Arc<dyn EventStore>, StoreError> {
    let store: Arc<dyn EventStore> = match &settings.backend {
        StoreConfig::Sqlite {
            path,
            journal_mode,
            synchronous,
            busy_timeout_ms,
        } => {
            let backend =
                SqliteBackend::connect(path, journal_mode, synchronous, *busy_timeout_ms).await?;
            prepare(&backend, create_schema).await?;
            Arc::new(EventLog::new(backend, settings.retry))
        }
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            let backend = PostgresBackend::connect(url, *max_connections).await?;
            prepare(&backend, create_schema).await?;
            Arc::new(EventLog::new(backend, settings.retry))
        }
    };

    Ok(store)
}

async fn prepare<B: StoreBackend>(backend: &B, create_schema: bool) -> Result<(), StoreError> {
    if create_schema {
        backend.create_schema().await.map_err(|e| {
            StoreError::Unavailable(format!("{}: {}", backend.engine(), e.message()))
        })?;
        debug!("{} schema ready", backend.engine());
    }
    Ok(())
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    /// Fails the first `fail_first` calls of every kind with `error`.
    struct FlakyBackend {
        fail_first: u32,
        error: BackendError,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn contended(fail_first: u32) -> Self {
            Self {
                fail_first,
                error: BackendError::Contention("database is locked".into()),
                calls: AtomicU32::new(0),
            }
        }

        fn tick(&self) -> Result<(), BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StoreBackend for FlakyBackend {
        fn engine(&self) -> &'static str {
            "flaky"
        }

        async fn create_schema(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn insert_event(&self, _event: &NewEvent) -> Result<(), BackendError> {
            self.tick()
        }

        async fn insert_temp_event(&self, _event: &NewTempEvent) -> Result<(), BackendError> {
            self.tick()
        }

        async fn select_events(
            &self,
            _target: &str,
            _module_name: &str,
            _scan_id: &ScanId,
        ) -> Result<Vec<Value>, BackendError> {
            self.tick().map(|_| vec![json!({"ok": true})])
        }

        async fn select_temp_event(
            &self,
            _target: &str,
            _module_name: &str,
            _scan_id: &ScanId,
            _event_name: &str,
        ) -> Result<Option<Value>, BackendError> {
            self.tick().map(|_| Some(json!(1)))
        }

        async fn delete_stale(
            &self,
            _target: &str,
            _module_name: &str,
            _scan_id: &ScanId,
        ) -> Result<u64, BackendError> {
            self.tick().map(|_| 2)
        }

        async fn select_by_target(&self, _target: &str) -> Result<Vec<StoredEvent>, BackendError> {
            self.tick().map(|_| Vec::new())
        }

        async fn select_by_scan(&self, _scan_id: &ScanId) -> Result<Vec<StoredEvent>, BackendError> {
            self.tick().map(|_| Vec::new())
        }
    }

    fn policy(max_retries: u32, on_exhausted: ExhaustionPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay_ms: 1,
            on_exhausted,
        }
    }

    fn sample_event() -> NewEvent {
        NewEvent::new("t", "m", &ScanId::from("s"), None, json!({}))
    }

    #[tokio::test]
    async fn exhausted_write_is_dropped_after_exact_attempts() {
        let log = EventLog::new(FlakyBackend::contended(5), policy(5, ExhaustionPolicy::Silent));

        let started = Instant::now();
        let outcome = log.append(sample_event()).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Dropped);
        assert_eq!(log.backend().calls.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fail_loud_surfaces_exhaustion() {
        let log = EventLog::new(FlakyBackend::contended(3), policy(3, ExhaustionPolicy::FailLoud));

        let err = log.append(sample_event()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RetriesExhausted { operation: "append", attempts: 3 }
        ));
    }

    #[tokio::test]
    async fn recovers_when_contention_clears() {
        let log = EventLog::new(FlakyBackend::contended(2), policy(3, ExhaustionPolicy::Silent));

        let outcome = log.append(sample_event()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(log.backend().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let backend = FlakyBackend {
            fail_first: 10,
            error: BackendError::Other("disk I/O error".into()),
            calls: AtomicU32::new(0),
        };
        let log = EventLog::new(backend, policy(5, ExhaustionPolicy::Silent));

        let err = log.append(sample_event()).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(log.backend().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_failures_come_back_empty() {
        let backend = FlakyBackend {
            fail_first: 10,
            error: BackendError::Other("no such table".into()),
            calls: AtomicU32::new(0),
        };
        let log = EventLog::new(backend, policy(3, ExhaustionPolicy::FailLoud));
        let id = ScanId::from("s");

        assert!(log.query("t", "m", &id).await.is_empty());
        assert!(log.query_temp("t", "m", &id, "e").await.is_none());
        assert!(log.events_for_target("t").await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_purge_reports_nothing_removed() {
        let log = EventLog::new(FlakyBackend::contended(9), policy(2, ExhaustionPolicy::Silent));
        assert_eq!(log.purge_stale("t", "m", &ScanId::from("s")).await.unwrap(), 0);
    }

    #[test]
    fn pool_timeout_counts_as_contention() {
        assert!(matches!(
            BackendError::from_sqlx(sqlx::Error::PoolTimedOut, |_| false),
            BackendError::Contention(_)
        ));
        assert!(matches!(
            BackendError::from_sqlx(sqlx::Error::RowNotFound, |_| true),
            BackendError::Other(_)
        ));
    }

    #[test]
    fn row_conversion_keeps_unparseable_columns_as_text() {
        let row = EventRow {
            id: 7,
            date: Utc::now(),
            target: "10.0.0.1".into(),
            module_name: "port_scan".into(),
            scan_unique_id: "s1".into(),
            port: "22".into(),
            event: "{not json".into(),
            json_event: r#"{"port":22}"#.into(),
        };

        let stored = StoredEvent::from(row);
        assert_eq!(stored.scan_id, ScanId::from("s1"));
        assert_eq!(stored.port, json!(22));
        assert_eq!(stored.event, json!("{not json"));
        assert_eq!(stored.json_event["port"], 22);
    }
}
