use std::sync::Arc;

use anyhow::Context;
use sweepr_common::config::{ScanRequest, StoreConfig, StoreSettings, parse_port_list};
use sweepr_common::module::ModuleRegistry;
use sweepr_common::store::EventStore;
use sweepr_core::dispatch::{GroupLauncher, InProcessLauncher, ProcessLauncher};
use sweepr_core::orchestrator::{Orchestrator, ScanOutcome};
use sweepr_core::store;
use sweepr_plugins::default_registry;
use tracing::{info, warn};

use super::ScanArgs;

pub async fn scan(args: ScanArgs) -> anyhow::Result<bool> {
    let request: ScanRequest = build_request(&args)?;
    let settings: StoreSettings = args.db.settings();
    let registry: ModuleRegistry = default_registry();

    info!("Event log: {} ({})", describe(&settings), settings.backend.engine());

    let orchestrator: Orchestrator = if args.in_process {
        let store: Arc<dyn EventStore> = store::open_store(&settings).await?;
        let launcher = Arc::new(InProcessLauncher::new(registry.clone(), Arc::clone(&store)));
        Orchestrator::new(store, settings, launcher, registry)
    } else {
        let launcher: Arc<dyn GroupLauncher> =
            Arc::new(ProcessLauncher::current_exe().context("locating the sweepr binary")?);
        Orchestrator::open(settings, launcher, registry).await?
    };

    let outcome: ScanOutcome = orchestrator.run(request).await?;
    if outcome.success {
        info!(
            "Scan {} finished over {} target(s)",
            outcome.scan_id,
            outcome.targets_scanned.len()
        );
    } else {
        warn!("Scan {} finished with failures", outcome.scan_id);
    }
    Ok(outcome.success)
}

fn build_request(args: &ScanArgs) -> anyhow::Result<ScanRequest> {
    let ports: Vec<u16> = match &args.ports {
        Some(list) => parse_port_list(list).map_err(anyhow::Error::msg)?,
        None => Vec::new(),
    };
    let excluded_ports: Vec<u16> = match &args.exclude_ports {
        Some(list) => parse_port_list(list).map_err(anyhow::Error::msg)?,
        None => Vec::new(),
    };

    Ok(ScanRequest {
        targets: args.targets.clone(),
        targets_list: args.targets_list.clone(),
        selected_modules: args.modules.clone(),
        excluded_modules: args.exclude_modules.clone(),
        ports,
        excluded_ports,
        usernames: args.usernames.clone(),
        usernames_list: args.usernames_list.clone(),
        passwords: args.passwords.clone(),
        passwords_list: args.passwords_list.clone(),
        http_headers: args.headers.clone(),
        user_agent: args.user_agent.clone(),
        timeout: args.timeout,
        retries: args.retries,
        retry_delay: args.retry_delay,
        thread_per_host: args.thread_per_host,
        parallel_module_scan: args.parallel_module_scan,
        hardware_usage: args.hardware_usage,
        socks_proxy: args.socks_proxy.clone(),
        ping_before_scan: args.ping_before_scan,
        scan_ip_range: args.scan_ip_range,
        scan_subdomains: args.scan_subdomains,
        skip_service_discovery: !args.service_discovery,
        grab_banners: args.grab_banners,
        url_base_path: String::new(),
    })
}

fn describe(settings: &StoreSettings) -> String {
    match &settings.backend {
        StoreConfig::Sqlite { path, .. } => path.display().to_string(),
        // The url may carry credentials.
        StoreConfig::Postgres { .. } => "postgres".to_string(),
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
