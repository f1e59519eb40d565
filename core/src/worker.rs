//! # Target-Module Worker
//!
//! Drives one target group inside a single process. Every (target, module) pair
//! becomes a tokio task; at most `parallel_module_scan` of them run at once,
//! gated by one semaphore shared across the whole group.
//!
//! A failing or panicking task is logged and otherwise ignored. The group driver
//! always waits for every task it spawned before returning.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use sweepr_common::config::ScanRequest;
use sweepr_common::event::ScanId;
use sweepr_common::module::{ModuleContext, ModuleRegistry, ScanModule};
use sweepr_common::network::dialer::Dialer;
use sweepr_common::store::EventStore;

/// What one group run amounted to. Informational only: task failures never fail
/// the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Runs every module selected in `request` against every target in `targets`.
pub async fn run_group(
    process_number: usize,
    targets: &[String],
    request: Arc<ScanRequest>,
    scan_id: &ScanId,
    registry: &ModuleRegistry,
    store: Arc<dyn EventStore>,
) -> GroupReport {
    let mut report = GroupReport::default();
    let total_tasks: usize = targets.len() * request.selected_modules.len();
    let semaphore = Arc::new(Semaphore::new(request.parallel_module_scan.max(1)));
    let mut tasks: JoinSet<(String, String, anyhow::Result<()>)> = JoinSet::new();
    let mut task_number: usize = 0;

    debug!(
        "Process {process_number}: {total_tasks} tasks over {} targets",
        targets.len()
    );

    for target in targets {
        for module_name in &request.selected_modules {
            task_number += 1;

            let Some(module) = registry.instantiate(module_name) else {
                warn!("Module {module_name} is not registered, skipping {target}");
                report.skipped += 1;
                continue;
            };

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Task gate closed unexpectedly: {e}");
                    report.skipped += 1;
                    continue;
                }
            };

            let ctx = ModuleContext {
                target: target.clone(),
                module_name: module_name.clone(),
                scan_id: scan_id.clone(),
                request: Arc::clone(&request),
                dialer: Dialer::new(request.socks_proxy.clone(), request.timeout()),
                store: Arc::clone(&store),
                process_number,
                task_number,
                total_tasks,
            };

            tasks.spawn(async move {
                let _permit = permit;
                debug!(
                    "[{}/{}] {} -> {} started",
                    ctx.task_number, ctx.total_tasks, ctx.module_name, ctx.target
                );
                let result = run_module(module, &ctx).await;
                (ctx.target, ctx.module_name, result)
            });
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((target, module_name, Ok(()))) => {
                debug!("{module_name} finished on {target}");
                report.completed += 1;
            }
            Ok((target, module_name, Err(e))) => {
                warn!("{module_name} failed on {target}: {e:#}");
                report.failed += 1;
            }
            Err(e) => {
                error!("Task aborted: {e}");
                report.failed += 1;
            }
        }
    }

    debug!(
        "Process {process_number} drained: {} completed, {} failed, {} skipped",
        report.completed, report.failed, report.skipped
    );
    report
}

async fn run_module(mut module: Box<dyn ScanModule>, ctx: &ModuleContext) -> anyhow::Result<()> {
    module.load(ctx).await?;
    module.build_loops(ctx)?;
    module.sort_loops();
    module.execute(ctx).await
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
