//! The storage seam every component writes findings through.
//!
//! Implementations live in `sweepr-core`. Callers only ever see this trait, so the
//! retry policy and the choice of engine stay invisible to modules.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::event::{NewEvent, NewTempEvent, ScanId, StoredEvent, WriteOutcome};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists one finding. At-least-once: a retried write may land twice.
    async fn append(&self, event: NewEvent) -> Result<WriteOutcome, StoreError>;

    async fn append_temp(&self, event: NewTempEvent) -> Result<WriteOutcome, StoreError>;

    /// Every `json_event` for the triple. Empty on no match and on failure.
    async fn query(&self, target: &str, module_name: &str, scan_id: &ScanId) -> Vec<Value>;

    /// The `data` of the first matching temp event, if any. `None` on failure.
    async fn query_temp(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
        event_name: &str,
    ) -> Option<Value>;

    /// Deletes rows for `(target, module_name)` in both tables whose scan id is
    /// not `scan_id`. Returns the number of rows removed.
    async fn purge_stale(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
    ) -> Result<u64, StoreError>;

    /// Every stored finding for a target, oldest first.
    async fn events_for_target(&self, target: &str) -> Vec<StoredEvent>;

    async fn events_for_scan(&self, scan_id: &ScanId) -> Vec<StoredEvent>;
}
