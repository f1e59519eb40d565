use sweepr_core::dispatch;
use sweepr_plugins::default_registry;

pub async fn worker() -> anyhow::Result<()> {
    dispatch::run_worker_from_stdin(&default_registry()).await
}
