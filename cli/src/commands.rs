pub mod report;
pub mod scan;
pub mod worker;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use sweepr_common::config::{
    DEFAULT_DB_PATH, DEFAULT_HARDWARE_USAGE, DEFAULT_PARALLEL_MODULE_SCAN, DEFAULT_RETRIES,
    DEFAULT_THREAD_PER_HOST, DEFAULT_TIMEOUT_SECS, ENV_DB_BUSY_TIMEOUT_MS, ENV_DB_ENGINE,
    ENV_DB_MAX_RETRIES, ENV_DB_ON_EXHAUSTED, ENV_DB_PATH, ENV_DB_RETRY_DELAY_MS, ENV_DB_URL,
    StoreSettings,
};
use sweepr_common::network::dialer::ProxyConfig;

#[derive(Parser)]
#[command(name = "sweepr")]
#[command(version, about = "Modular network reconnaissance with a shared event log.")]
pub struct CommandLine {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan targets with one or more modules
    #[command(alias = "s")]
    Scan(Box<ScanArgs>),
    /// Print every stored event for a target as JSON
    #[command(alias = "r")]
    Report {
        target: String,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Run one target group handed over on stdin
    #[command(hide = true)]
    Worker,
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[derive(Args)]
pub struct ScanArgs {
    /// Hosts, addresses, ranges, CIDR blocks or URLs (comma separated)
    #[arg(short = 'i', long, value_delimiter = ',')]
    pub targets: Vec<String>,
    /// File with one target per line
    #[arg(short = 'l', long)]
    pub targets_list: Option<PathBuf>,
    /// Modules to run, or "all"
    #[arg(short = 'm', long, value_delimiter = ',', required = true)]
    pub modules: Vec<String>,
    #[arg(short = 'x', long, value_delimiter = ',')]
    pub exclude_modules: Vec<String>,
    /// Ports to scan, e.g. "22,80,8000-8100"
    #[arg(short = 'g', long)]
    pub ports: Option<String>,
    #[arg(long)]
    pub exclude_ports: Option<String>,
    #[arg(short = 'u', long, value_delimiter = ',')]
    pub usernames: Vec<String>,
    #[arg(long)]
    pub usernames_list: Option<PathBuf>,
    #[arg(short = 'p', long, value_delimiter = ',')]
    pub passwords: Vec<String>,
    #[arg(long)]
    pub passwords_list: Option<PathBuf>,
    /// Extra HTTP header, e.g. "X-Token: abc" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Per-request timeout in seconds
    #[arg(short = 'w', long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: f64,
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,
    /// Seconds between retries
    #[arg(long, default_value_t = 0.0)]
    pub retry_delay: f64,
    /// Concurrent requests a module may issue against one target
    #[arg(short = 't', long, default_value_t = DEFAULT_THREAD_PER_HOST)]
    pub thread_per_host: usize,
    /// Target-module tasks running at once within a group
    #[arg(short = 'M', long, default_value_t = DEFAULT_PARALLEL_MODULE_SCAN)]
    pub parallel_module_scan: usize,
    /// 0-100: higher values give fewer, larger target groups
    #[arg(long, default_value_t = DEFAULT_HARDWARE_USAGE,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    pub hardware_usage: u8,
    /// socks5://[user:pass@]host[:port]
    #[arg(long)]
    pub socks_proxy: Option<ProxyConfig>,
    /// Expand single addresses to their surrounding block
    #[arg(short = 'r', long)]
    pub scan_ip_range: bool,
    /// Look for subdomains first and scan them too
    #[arg(short = 's', long)]
    pub scan_subdomains: bool,
    /// Keep only targets with at least one open port
    #[arg(short = 'd', long)]
    pub service_discovery: bool,
    /// Record the greeting line of each open port
    #[arg(long)]
    pub grab_banners: bool,
    /// Keep only targets that answer ICMP echo (needs root)
    #[arg(long)]
    pub ping_before_scan: bool,
    /// Run every group on this process instead of spawning workers
    #[arg(long)]
    pub in_process: bool,
    #[command(flatten)]
    pub db: DbArgs,
}

/// Event log settings. Each flag falls back to its environment variable.
#[derive(Args)]
pub struct DbArgs {
    /// sqlite or postgres
    #[arg(long, env = ENV_DB_ENGINE)]
    pub db_engine: Option<String>,
    #[arg(long, env = ENV_DB_PATH, default_value = DEFAULT_DB_PATH)]
    pub db_path: String,
    #[arg(long, env = ENV_DB_URL)]
    pub db_url: Option<String>,
    #[arg(long, env = ENV_DB_MAX_RETRIES)]
    pub db_max_retries: Option<u32>,
    #[arg(long, env = ENV_DB_RETRY_DELAY_MS)]
    pub db_retry_delay_ms: Option<u64>,
    /// silent or fail-loud
    #[arg(long, env = ENV_DB_ON_EXHAUSTED)]
    pub db_on_exhausted: Option<String>,
    #[arg(long, env = ENV_DB_BUSY_TIMEOUT_MS)]
    pub db_busy_timeout_ms: Option<u64>,
}

impl DbArgs {
    pub fn settings(&self) -> StoreSettings {
        StoreSettings::from_lookup(|key| self.lookup(key))
    }

    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            ENV_DB_ENGINE => self.db_engine.clone(),
            ENV_DB_PATH => Some(self.db_path.clone()),
            ENV_DB_URL => self.db_url.clone(),
            ENV_DB_MAX_RETRIES => self.db_max_retries.map(|v| v.to_string()),
            ENV_DB_RETRY_DELAY_MS => self.db_retry_delay_ms.map(|v| v.to_string()),
            ENV_DB_ON_EXHAUSTED => self.db_on_exhausted.clone(),
            ENV_DB_BUSY_TIMEOUT_MS => self.db_busy_timeout_ms.map(|v| v.to_string()),
            _ => None,
        }
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
