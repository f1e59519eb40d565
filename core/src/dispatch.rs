//! # Process Dispatcher
//!
//! Hands each target group to its own worker and waits for all of them.
//!
//! The default [`ProcessLauncher`] re-executes the current binary with the
//! `worker` subcommand and writes a JSON [`GroupAssignment`] to its stdin. The
//! child rebuilds its own store handle from the assignment, so processes share
//! nothing but the database.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use sweepr_common::config::{ScanRequest, StoreSettings};
use sweepr_common::event::ScanId;
use sweepr_common::grouping::TargetGroup;
use sweepr_common::module::ModuleRegistry;
use sweepr_common::store::EventStore;

use crate::store;
use crate::worker;

/// Subcommand the binary exposes for worker re-entry.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Everything a worker process needs to run one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub process_number: usize,
    pub scan_id: ScanId,
    pub targets: TargetGroup,
    pub request: ScanRequest,
    pub store: StoreSettings,
}

/// Runs one group somewhere and reports whether it finished cleanly.
#[async_trait]
pub trait GroupLauncher: Send + Sync {
    async fn launch(&self, assignment: GroupAssignment) -> bool;
}

/// Runs each group in a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-enters the running executable as `<exe> worker`.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec![WORKER_SUBCOMMAND.to_string()],
        ))
    }

    async fn run_child(&self, assignment: &GroupAssignment) -> anyhow::Result<bool> {
        let payload: Vec<u8> = serde_json::to_vec(assignment)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            warn!("Process {} exited with {status}", assignment.process_number);
        }
        Ok(status.success())
    }
}

#[async_trait]
impl GroupLauncher for ProcessLauncher {
    async fn launch(&self, assignment: GroupAssignment) -> bool {
        match self.run_child(&assignment).await {
            Ok(success) => success,
            Err(e) => {
                error!(
                    "Failed to run process {} ({}): {e:#}",
                    assignment.process_number,
                    self.program.display()
                );
                false
            }
        }
    }
}

/// Runs each group as a task on the current runtime, sharing one store handle.
#[derive(Clone)]
pub struct InProcessLauncher {
    registry: ModuleRegistry,
    store: Arc<dyn EventStore>,
}

impl InProcessLauncher {
    pub fn new(registry: ModuleRegistry, store: Arc<dyn EventStore>) -> Self {
        Self { registry, store }
    }
}

#[async_trait]
impl GroupLauncher for InProcessLauncher {
    async fn launch(&self, assignment: GroupAssignment) -> bool {
        let registry: ModuleRegistry = self.registry.clone();
        let store: Arc<dyn EventStore> = Arc::clone(&self.store);
        let process_number: usize = assignment.process_number;

        let handle = tokio::spawn(async move {
            worker::run_group(
                assignment.process_number,
                &assignment.targets,
                Arc::new(assignment.request),
                &assignment.scan_id,
                &registry,
                store,
            )
            .await
        });

        match handle.await {
            Ok(_) => true,
            Err(e) => {
                error!("Group {process_number} aborted: {e}");
                false
            }
        }
    }
}

/// Purges stale rows for every pair about to run, launches every group at once,
/// and waits for all of them. True only if every group succeeded.
pub async fn dispatch(
    launcher: &dyn GroupLauncher,
    store: &dyn EventStore,
    settings: &StoreSettings,
    groups: Vec<TargetGroup>,
    request: &ScanRequest,
    scan_id: &ScanId,
) -> bool {
    purge_before_run(store, &groups, &request.selected_modules, scan_id).await;

    info!(
        "Dispatching {} group(s) for {}",
        groups.len(),
        request.selected_modules.join(", ")
    );

    let launches = groups
        .into_iter()
        .enumerate()
        .map(|(index, targets)| GroupAssignment {
            process_number: index + 1,
            scan_id: scan_id.clone(),
            targets,
            request: request.clone(),
            store: settings.clone(),
        })
        .map(|assignment| launcher.launch(assignment));

    let results: Vec<bool> = join_all(launches).await;
    let failed: usize = results.iter().filter(|ok| !**ok).count();
    if failed > 0 {
        warn!("{failed} of {} group(s) failed", results.len());
    }
    failed == 0
}

async fn purge_before_run(
    store: &dyn EventStore,
    groups: &[TargetGroup],
    modules: &[String],
    scan_id: &ScanId,
) {
    let mut removed: u64 = 0;
    for target in groups.iter().flatten() {
        for module_name in modules {
            match store.purge_stale(target, module_name, scan_id).await {
                Ok(count) => removed += count,
                Err(e) => warn!("Could not purge old {module_name} rows for {target}: {e}"),
            }
        }
    }
    if removed > 0 {
        debug!("Purged {removed} stale row(s)");
    }
}

/// Worker process entry: reads a [`GroupAssignment`] from stdin and runs it.
pub async fn run_worker_from_stdin(registry: &ModuleRegistry) -> anyhow::Result<()> {
    let mut payload = String::new();
    tokio::io::stdin().read_to_string(&mut payload).await?;
    let assignment: GroupAssignment = serde_json::from_str(&payload)?;

    let store: Arc<dyn EventStore> = store::attach_store(&assignment.store).await?;
    let report = worker::run_group(
        assignment.process_number,
        &assignment.targets,
        Arc::new(assignment.request),
        &assignment.scan_id,
        registry,
        store,
    )
    .await;

    debug!("Process {} done: {report:?}", assignment.process_number);
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
