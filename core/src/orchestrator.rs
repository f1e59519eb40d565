//! # Scan Orchestrator
//!
//! Top-level state machine of one invocation:
//!
//! `Init → SubdomainPass? → ReachabilityPass? → PortDiscoveryPass? → MainScan → Done`
//!
//! Each optional pass narrows the module selection to a single bootstrap module,
//! runs it through the full group → dispatch → worker pipeline, then reads its
//! findings back to reshape the working target set. The bootstrap module is
//! removed from the selection afterwards so the main scan does not repeat it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use sweepr_common::config::{ScanRequest, StoreSettings};
use sweepr_common::error::ScanError;
use sweepr_common::event::ScanId;
use sweepr_common::grouping::{self, TargetGroup};
use sweepr_common::module::ModuleRegistry;
use sweepr_common::network::target::{self, NormalizedTargets};
use sweepr_common::store::EventStore;

use crate::dispatch::{self, GroupLauncher};
use crate::store;

pub const SUBDOMAIN_MODULE: &str = "subdomain_scan";
pub const REACHABILITY_MODULE: &str = "icmp_scan";
pub const PORT_DISCOVERY_MODULE: &str = "port_scan";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
    Init,
    SubdomainPass,
    ReachabilityPass,
    PortDiscoveryPass,
    MainScan,
    Done,
}

impl fmt::Display for ScanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanStage::Init => "init",
            ScanStage::SubdomainPass => "subdomain pass",
            ScanStage::ReachabilityPass => "reachability pass",
            ScanStage::PortDiscoveryPass => "port discovery pass",
            ScanStage::MainScan => "main scan",
            ScanStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Result of one invocation. Findings themselves stay in the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub scan_id: ScanId,
    /// True iff every group of the main scan finished cleanly.
    pub success: bool,
    pub targets_scanned: Vec<String>,
}

pub struct Orchestrator {
    store: Arc<dyn EventStore>,
    settings: StoreSettings,
    launcher: Arc<dyn GroupLauncher>,
    registry: ModuleRegistry,
    privileged: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EventStore>,
        settings: StoreSettings,
        launcher: Arc<dyn GroupLauncher>,
        registry: ModuleRegistry,
    ) -> Self {
        Self {
            store,
            settings,
            launcher,
            registry,
            privileged: is_root::is_root(),
        }
    }

    /// Opens the store (creating the schema) and builds an orchestrator on it.
    /// Fails when the store cannot be reached.
    pub async fn open(
        settings: StoreSettings,
        launcher: Arc<dyn GroupLauncher>,
        registry: ModuleRegistry,
    ) -> Result<Self, ScanError> {
        let store = store::open_store(&settings).await?;
        Ok(Self::new(store, settings, launcher, registry))
    }

    /// Overrides the detected privilege level.
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub async fn run(&self, request: ScanRequest) -> Result<ScanOutcome, ScanError> {
        enter(ScanStage::Init);
        let mut modules: Vec<String> = self
            .registry
            .resolve_selection(&request.selected_modules, &request.excluded_modules)?;
        let request: ScanRequest = request.resolve_list_files()?;

        let NormalizedTargets {
            targets,
            url_base_path,
        } = target::normalize(&request.targets, request.scan_ip_range);
        if targets.is_empty() {
            return Err(ScanError::NoTargets);
        }

        let scan_id: ScanId = ScanId::generate();
        let base: ScanRequest = ScanRequest {
            url_base_path,
            ..request
        };
        let mut working: Vec<String> = targets;
        info!("Scan {scan_id}: {} target(s), modules: {}", working.len(), modules.join(", "));

        if base.scan_subdomains {
            enter(ScanStage::SubdomainPass);
            if self.bootstrap_available(SUBDOMAIN_MODULE) {
                self.run_pass(SUBDOMAIN_MODULE, &base, &working, &scan_id).await;
                let found: Vec<String> = self.discovered_subdomains(&working, &scan_id).await;
                info!("Subdomain pass added {} target(s)", found.len());
                extend_unique(&mut working, found);
            }
            remove_module(&mut modules, SUBDOMAIN_MODULE);
        }

        if base.ping_before_scan {
            enter(ScanStage::ReachabilityPass);
            if !self.privileged {
                warn!("Reachability pass needs root privileges, skipping it");
            } else if self.bootstrap_available(REACHABILITY_MODULE) {
                self.run_pass(REACHABILITY_MODULE, &base, &working, &scan_id).await;
                working = self
                    .keep_with_events(working, REACHABILITY_MODULE, &scan_id)
                    .await;
                info!("{} target(s) answered", working.len());
            }
            remove_module(&mut modules, REACHABILITY_MODULE);
        }

        if !base.skip_service_discovery {
            enter(ScanStage::PortDiscoveryPass);
            if self.bootstrap_available(PORT_DISCOVERY_MODULE) {
                let discovery = ScanRequest {
                    skip_service_discovery: true,
                    ..base.clone()
                };
                self.run_pass(PORT_DISCOVERY_MODULE, &discovery, &working, &scan_id)
                    .await;
                working = self
                    .keep_with_events(working, PORT_DISCOVERY_MODULE, &scan_id)
                    .await;
                info!("{} target(s) with open ports", working.len());
            }
            remove_module(&mut modules, PORT_DISCOVERY_MODULE);
        }

        enter(ScanStage::MainScan);
        let success: bool = if working.is_empty() {
            warn!("No targets left after filtering");
            false
        } else if modules.is_empty() {
            info!("No modules left for the main scan");
            true
        } else {
            let main: ScanRequest = base.with_targets(working.clone()).with_modules(modules);
            let groups: Vec<TargetGroup> = grouping::group_targets(&working, main.hardware_usage);
            self.dispatch(groups, &main, &scan_id).await
        };

        enter(ScanStage::Done);
        Ok(ScanOutcome {
            scan_id,
            success,
            targets_scanned: working,
        })
    }

    fn bootstrap_available(&self, module_name: &str) -> bool {
        let available: bool = self.registry.contains(module_name);
        if !available {
            warn!("{module_name} is not registered, skipping its pass");
        }
        available
    }

    async fn run_pass(
        &self,
        module_name: &str,
        base: &ScanRequest,
        targets: &[String],
        scan_id: &ScanId,
    ) {
        let pass: ScanRequest = base
            .with_targets(targets.to_vec())
            .with_modules(vec![module_name.to_string()]);
        let groups: Vec<TargetGroup> = grouping::group_targets(targets, pass.hardware_usage);

        if !self.dispatch(groups, &pass, scan_id).await {
            warn!("Some {module_name} groups failed");
        }
    }

    async fn dispatch(&self, groups: Vec<TargetGroup>, request: &ScanRequest, scan_id: &ScanId) -> bool {
        dispatch::dispatch(
            self.launcher.as_ref(),
            self.store.as_ref(),
            &self.settings,
            groups,
            request,
            scan_id,
        )
        .await
    }

    /// Strict filter: a target without a single event from `module_name` is dropped.
    async fn keep_with_events(
        &self,
        targets: Vec<String>,
        module_name: &str,
        scan_id: &ScanId,
    ) -> Vec<String> {
        let mut kept: Vec<String> = Vec::with_capacity(targets.len());
        for target in targets {
            if self.store.query(&target, module_name, scan_id).await.is_empty() {
                info!("Dropping {target}: no {module_name} result");
            } else {
                kept.push(target);
            }
        }
        kept
    }

    async fn discovered_subdomains(&self, targets: &[String], scan_id: &ScanId) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for target in targets {
            for record in self.store.query(target, SUBDOMAIN_MODULE, scan_id).await {
                found.extend(subdomains_in(&record));
            }
        }
        found
    }
}

fn enter(stage: ScanStage) {
    info!("Stage: {stage}");
}

/// Reads `event.subdomains` out of a stored `json_event`.
fn subdomains_in(record: &Value) -> Vec<String> {
    record
        .get("event")
        .and_then(|event| event.get("subdomains"))
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn extend_unique(targets: &mut Vec<String>, extra: Vec<String>) {
    let mut seen: HashSet<String> = targets.iter().cloned().collect();
    for target in extra {
        if seen.insert(target.clone()) {
            targets.push(target);
        }
    }
}

fn remove_module(modules: &mut Vec<String>, module_name: &str) {
    modules.retain(|m| m != module_name);
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
