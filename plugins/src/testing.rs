//! In-memory event store for module unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use sweepr_common::config::ScanRequest;
use sweepr_common::error::StoreError;
use sweepr_common::event::{NewEvent, NewTempEvent, ScanId, StoredEvent, WriteOutcome};
use sweepr_common::module::ModuleContext;
use sweepr_common::network::dialer::Dialer;
use sweepr_common::store::EventStore;

#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<NewEvent>>,
    temps: Mutex<Vec<NewTempEvent>>,
}

impl MemoryStore {
    pub fn events(&self) -> Vec<NewEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: NewEvent) -> Result<WriteOutcome, StoreError> {
        self.events.lock().unwrap().push(event);
        Ok(WriteOutcome::Written)
    }

    async fn append_temp(&self, event: NewTempEvent) -> Result<WriteOutcome, StoreError> {
        self.temps.lock().unwrap().push(event);
        Ok(WriteOutcome::Written)
    }

    async fn query(&self, target: &str, module_name: &str, scan_id: &ScanId) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.target == target && e.module_name == module_name && &e.scan_id == scan_id)
            .map(|e| e.json_event.clone())
            .collect()
    }

    async fn query_temp(
        &self,
        target: &str,
        module_name: &str,
        scan_id: &ScanId,
        event_name: &str,
    ) -> Option<Value> {
        self.temps
            .lock()
            .unwrap()
            .iter()
            .find(|e| {
                e.target == target
                    && e.module_name == module_name
                    && &e.scan_id == scan_id
                    && e.event_name == event_name
            })
            .map(|e| e.data.clone())
    }

    async fn purge_stale(
        &self,
        _target: &str,
        _module_name: &str,
        _scan_id: &ScanId,
    ) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn events_for_target(&self, _target: &str) -> Vec<StoredEvent> {
        Vec::new()
    }

    async fn events_for_scan(&self, _scan_id: &ScanId) -> Vec<StoredEvent> {
        Vec::new()
    }
}

pub fn context(
    target: &str,
    module_name: &str,
    request: ScanRequest,
) -> (ModuleContext, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let ctx = ModuleContext {
        target: target.to_string(),
        module_name: module_name.to_string(),
        scan_id: ScanId::from("test-scan"),
        dialer: Dialer::new(request.socks_proxy.clone(), request.timeout()),
        request: Arc::new(request),
        store: store.clone(),
        process_number: 1,
        task_number: 1,
        total_tasks: 1,
    };
    (ctx, store)
}
