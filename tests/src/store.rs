#![cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sweepr_common::config::{ExhaustionPolicy, RetryPolicy, StoreConfig, StoreSettings};
use sweepr_common::error::StoreError;
use sweepr_common::event::{NewEvent, NewTempEvent, ScanId, StoredEvent, WriteOutcome};
use sweepr_common::store::EventStore;
use sweepr_core::store::{self, BackendError, EventLog, StoreBackend};
use tempfile::TempDir;

/// Answers every insert with lock contention until `busy_for` attempts have been made.
struct Locked {
    busy_for: u32,
    attempts: AtomicU32,
}

impl Locked {
    fn new(busy_for: u32) -> Self {
        Self {
            busy_for,
            attempts: AtomicU32::new(0),
        }
    }

    fn attempt(&self) -> Result<(), BackendError> {
        let n: u32 = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.busy_for {
            Err(BackendError::Contention("database is locked".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreBackend for Locked {
    fn engine(&self) -> &'static str {
        "locked"
    }

    async fn create_schema(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn insert_event(&self, _event: &NewEvent) -> Result<(), BackendError> {
        self.attempt()
    }

    async fn insert_temp_event(&self, _event: &NewTempEvent) -> Result<(), BackendError> {
        self.attempt()
    }

    async fn select_events(&self, _: &str, _: &str, _: &ScanId) -> Result<Vec<Value>, BackendError> {
        Ok(Vec::new())
    }

    async fn select_temp_event(
        &self,
        _: &str,
        _: &str,
        _: &ScanId,
        _: &str,
    ) -> Result<Option<Value>, BackendError> {
        Ok(None)
    }

    async fn delete_stale(&self, _: &str, _: &str, _: &ScanId) -> Result<u64, BackendError> {
        Ok(0)
    }

    async fn select_by_target(&self, _: &str) -> Result<Vec<StoredEvent>, BackendError> {
        Ok(Vec::new())
    }

    async fn select_by_scan(&self, _: &ScanId) -> Result<Vec<StoredEvent>, BackendError> {
        Ok(Vec::new())
    }
}

fn policy(max_retries: u32, on_exhausted: ExhaustionPolicy) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        retry_delay_ms: 1,
        on_exhausted,
    }
}

fn finding(target: &str, module_name: &str, scan_id: &ScanId) -> NewEvent {
    NewEvent::new(target, module_name, scan_id, Some(22), json!({"port": 22}))
}

#[tokio::test]
async fn contended_write_is_dropped_after_exactly_max_retries() {
    const M: u32 = 4;
    let log = EventLog::new(Locked::new(M), policy(M, ExhaustionPolicy::Silent));
    let scan_id = ScanId::generate();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        log.append(finding("10.0.0.1", "port_scan", &scan_id)),
    )
    .await
    .expect("append must not block")
    .unwrap();

    assert_eq!(outcome, WriteOutcome::Dropped);
    assert_eq!(log.backend().attempts.load(Ordering::SeqCst), M);
}

#[tokio::test]
async fn contended_write_fails_loud_when_asked() {
    let log = EventLog::new(Locked::new(3), policy(3, ExhaustionPolicy::FailLoud));
    let scan_id = ScanId::generate();

    let err = log
        .append_temp(NewTempEvent::new("10.0.0.1", "port_scan", &scan_id, "seen", json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn write_lands_once_contention_clears() {
    let log = EventLog::new(Locked::new(2), policy(3, ExhaustionPolicy::FailLoud));
    let outcome = log
        .append(finding("10.0.0.1", "port_scan", &ScanId::generate()))
        .await
        .unwrap();
    assert!(outcome.is_written());
    assert_eq!(log.backend().attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn purge_keeps_current_scan_and_other_pairs() {
    let dir = TempDir::new().unwrap();
    let settings = StoreSettings::new(StoreConfig::sqlite(dir.path().join("purge.db")));
    let store = store::open_store(&settings).await.unwrap();

    let old = ScanId::from("old-scan");
    let current = ScanId::from("current-scan");

    for event in [
        finding("10.0.0.1", "port_scan", &old),
        finding("10.0.0.1", "port_scan", &current),
        finding("10.0.0.1", "icmp_scan", &old),
        finding("10.0.0.2", "port_scan", &old),
    ] {
        assert!(store.append(event).await.unwrap().is_written());
    }
    store
        .append_temp(NewTempEvent::new("10.0.0.1", "port_scan", &old, "seen", json!(true)))
        .await
        .unwrap();

    let removed: u64 = store.purge_stale("10.0.0.1", "port_scan", &current).await.unwrap();
    assert_eq!(removed, 2);

    assert_eq!(store.query("10.0.0.1", "port_scan", &current).await.len(), 1);
    assert!(store.query("10.0.0.1", "port_scan", &old).await.is_empty());
    assert!(store.query_temp("10.0.0.1", "port_scan", &old, "seen").await.is_none());
    assert_eq!(store.query("10.0.0.1", "icmp_scan", &old).await.len(), 1);
    assert_eq!(store.query("10.0.0.2", "port_scan", &old).await.len(), 1);
}
