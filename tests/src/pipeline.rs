#![cfg(test)]
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sweepr_common::config::{ScanRequest, StoreConfig, StoreSettings};
use sweepr_common::event::{ScanId, StoredEvent};
use sweepr_common::module::{ModuleContext, ModuleRegistry, ScanModule};
use sweepr_common::store::EventStore;
use sweepr_core::dispatch::InProcessLauncher;
use sweepr_core::orchestrator::Orchestrator;
use sweepr_core::store;
use sweepr_core::worker;
use tempfile::TempDir;

/// Reports a single open port for every target it runs against.
struct OnePort;

#[async_trait]
impl ScanModule for OnePort {
    fn build_loops(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        ctx.emit(Some(443), json!({"port": 443, "state": "open"})).await?;
        Ok(())
    }
}

/// Tracks how many instances are executing at once.
struct Gauge {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl ScanModule for Gauge {
    fn build_loops(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        let now: usize = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn sqlite_store(dir: &TempDir) -> (StoreSettings, Arc<dyn EventStore>) {
    let settings = StoreSettings::new(StoreConfig::sqlite(dir.path().join("events.db")));
    let store = store::open_store(&settings).await.unwrap();
    (settings, store)
}

#[tokio::test]
async fn single_domain_single_module_writes_one_event() {
    let dir = TempDir::new().unwrap();
    let (settings, store) = sqlite_store(&dir).await;
    let registry = ModuleRegistry::new().register("port_scan", || Box::new(OnePort));
    let launcher = Arc::new(InProcessLauncher::new(registry.clone(), Arc::clone(&store)));
    let orchestrator = Orchestrator::new(Arc::clone(&store), settings, launcher, registry)
        .with_privileged(false);

    let request = ScanRequest {
        targets: vec!["example.com".to_string()],
        selected_modules: vec!["port_scan".to_string()],
        skip_service_discovery: true,
        ..Default::default()
    };
    let outcome = orchestrator.run(request).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.targets_scanned, vec!["example.com"]);

    let rows: Vec<StoredEvent> = store.events_for_scan(&outcome.scan_id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].module_name, "port_scan");
    assert_eq!(rows[0].target, "example.com");
    assert_eq!(rows[0].json_event["event"]["port"], 443);
}

#[tokio::test]
async fn tasks_in_a_group_respect_parallel_module_scan() {
    let dir = TempDir::new().unwrap();
    let (_settings, store) = sqlite_store(&dir).await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = ModuleRegistry::new();
    for name in ["gauge_a", "gauge_b"] {
        let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
        registry = registry.register(name, move || {
            Box::new(Gauge {
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            })
        });
    }

    let targets: Vec<String> = (1..=5).map(|i| format!("10.0.0.{i}")).collect();
    let request = ScanRequest {
        selected_modules: vec!["gauge_a".to_string(), "gauge_b".to_string()],
        parallel_module_scan: 2,
        ..Default::default()
    };

    let report = worker::run_group(
        1,
        &targets,
        Arc::new(request),
        &ScanId::generate(),
        &registry,
        store,
    )
    .await;

    assert_eq!(report.completed, 10);
    assert_eq!(running.load(Ordering::SeqCst), 0);
    let peak: usize = peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "observed {peak} tasks at once");
    assert!(peak >= 1);
}

#[tokio::test]
async fn rerun_replaces_previous_findings() {
    let dir = TempDir::new().unwrap();
    let (settings, store) = sqlite_store(&dir).await;
    let registry = ModuleRegistry::new().register("port_scan", || Box::new(OnePort));
    let launcher = Arc::new(InProcessLauncher::new(registry.clone(), Arc::clone(&store)));
    let orchestrator = Orchestrator::new(Arc::clone(&store), settings, launcher, registry)
        .with_privileged(false);

    let request = ScanRequest {
        targets: vec!["10.1.1.1".to_string()],
        selected_modules: vec!["port_scan".to_string()],
        ..Default::default()
    };
    let first = orchestrator.run(request.clone()).await.unwrap();
    let second = orchestrator.run(request).await.unwrap();
    assert_ne!(first.scan_id, second.scan_id);

    let rows: Vec<StoredEvent> = store.events_for_target("10.1.1.1").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].scan_id, second.scan_id);
}
