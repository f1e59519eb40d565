//! Scan request and storage settings.
//!
//! Both are plain serializable values. A scan request is handed to every worker
//! process as JSON, so anything a module needs has to live here.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TargetError;
use crate::network::dialer::ProxyConfig;

pub const DEFAULT_TIMEOUT_SECS: f64 = 3.0;
pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_THREAD_PER_HOST: usize = 100;
pub const DEFAULT_PARALLEL_MODULE_SCAN: usize = 1;
pub const DEFAULT_HARDWARE_USAGE: u8 = 21;

/// Everything one invocation was asked to do.
///
/// Stages never mutate a request they were given. They derive a new one with
/// [`ScanRequest::with_targets`] or [`ScanRequest::with_modules`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    pub targets: Vec<String>,
    pub targets_list: Option<PathBuf>,
    pub selected_modules: Vec<String>,
    pub excluded_modules: Vec<String>,
    pub ports: Vec<u16>,
    pub excluded_ports: Vec<u16>,
    pub usernames: Vec<String>,
    pub usernames_list: Option<PathBuf>,
    pub passwords: Vec<String>,
    pub passwords_list: Option<PathBuf>,
    pub http_headers: Vec<String>,
    pub user_agent: Option<String>,
    /// Seconds.
    pub timeout: f64,
    pub retries: u32,
    /// Seconds.
    pub retry_delay: f64,
    pub thread_per_host: usize,
    pub parallel_module_scan: usize,
    pub hardware_usage: u8,
    pub socks_proxy: Option<ProxyConfig>,
    pub ping_before_scan: bool,
    pub scan_ip_range: bool,
    pub scan_subdomains: bool,
    pub skip_service_discovery: bool,
    /// Read the first line a listener sends after `port_scan` connects.
    pub grab_banners: bool,
    /// Filled in by the normalizer from the last URL target.
    pub url_base_path: String,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            targets_list: None,
            selected_modules: Vec::new(),
            excluded_modules: Vec::new(),
            ports: Vec::new(),
            excluded_ports: Vec::new(),
            usernames: Vec::new(),
            usernames_list: None,
            passwords: Vec::new(),
            passwords_list: None,
            http_headers: Vec::new(),
            user_agent: None,
            timeout: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
            retry_delay: 0.0,
            thread_per_host: DEFAULT_THREAD_PER_HOST,
            parallel_module_scan: DEFAULT_PARALLEL_MODULE_SCAN,
            hardware_usage: DEFAULT_HARDWARE_USAGE,
            socks_proxy: None,
            ping_before_scan: false,
            scan_ip_range: false,
            scan_subdomains: false,
            skip_service_discovery: true,
            grab_banners: false,
            url_base_path: String::new(),
        }
    }
}

impl ScanRequest {
    pub fn with_targets(&self, targets: Vec<String>) -> Self {
        Self {
            targets,
            ..self.clone()
        }
    }

    pub fn with_modules(&self, selected_modules: Vec<String>) -> Self {
        Self {
            selected_modules,
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        secs_to_duration(self.retry_delay)
    }

    /// Reads every `*_list` file and appends its lines to the matching inline list.
    pub fn resolve_list_files(&self) -> Result<Self, TargetError> {
        let mut resolved: ScanRequest = self.clone();

        if let Some(path) = resolved.targets_list.take() {
            resolved.targets.extend(read_list_file(&path)?);
        }
        if let Some(path) = resolved.usernames_list.take() {
            resolved.usernames.extend(read_list_file(&path)?);
        }
        if let Some(path) = resolved.passwords_list.take() {
            resolved.passwords.extend(read_list_file(&path)?);
        }

        Ok(resolved)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Non-empty trimmed lines of a list file.
pub fn read_list_file(path: &Path) -> Result<Vec<String>, TargetError> {
    let content: String =
        std::fs::read_to_string(path).map_err(|source| TargetError::ListFile {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Parses "22,80,8000-8010" into a sorted, de-duplicated port list.
pub fn parse_port_list(s: &str) -> Result<Vec<u16>, String> {
    let mut ports: Vec<u16> = Vec::new();

    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u16 = parse_port(start)?;
                let end: u16 = parse_port(end)?;
                if start > end {
                    return Err(format!("port range {part} is reversed"));
                }
                ports.extend(start..=end);
            }
            None => ports.push(parse_port(part)?),
        }
    }

    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

fn parse_port(s: &str) -> Result<u16, String> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("'{s}' is not a valid port")),
        Ok(port) => Ok(port),
    }
}

// ----- storage -----

pub const ENV_DB_ENGINE: &str = "SWEEPR_DB_ENGINE";
pub const ENV_DB_PATH: &str = "SWEEPR_DB_PATH";
pub const ENV_DB_URL: &str = "SWEEPR_DB_URL";
pub const ENV_DB_MAX_RETRIES: &str = "SWEEPR_DB_MAX_RETRIES";
pub const ENV_DB_RETRY_DELAY_MS: &str = "SWEEPR_DB_RETRY_DELAY_MS";
pub const ENV_DB_ON_EXHAUSTED: &str = "SWEEPR_DB_ON_EXHAUSTED";
pub const ENV_DB_BUSY_TIMEOUT_MS: &str = "SWEEPR_DB_BUSY_TIMEOUT_MS";

pub const DEFAULT_DB_PATH: &str = "sweepr.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_PG_MAX_CONNECTIONS: u32 = 5;

/// Which engine holds the event log, and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite {
        path: PathBuf,
        journal_mode: String,
        synchronous: String,
        busy_timeout_ms: u64,
    },
    Postgres {
        url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        StoreConfig::Sqlite {
            path: path.into(),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    pub fn postgres(url: impl Into<String>) -> Self {
        StoreConfig::Postgres {
            url: url.into(),
            max_connections: DEFAULT_PG_MAX_CONNECTIONS,
        }
    }

    pub fn engine(&self) -> &'static str {
        match self {
            StoreConfig::Sqlite { .. } => "sqlite",
            StoreConfig::Postgres { .. } => "postgres",
        }
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let engine: String = lookup(ENV_DB_ENGINE).unwrap_or_else(|| "sqlite".to_string());

        if engine.eq_ignore_ascii_case("postgres") || engine.eq_ignore_ascii_case("postgresql") {
            let url: String =
                lookup(ENV_DB_URL).unwrap_or_else(|| "postgres://localhost/sweepr".to_string());
            return StoreConfig::postgres(url);
        }

        let path: String = lookup(ENV_DB_PATH).unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        StoreConfig::Sqlite {
            path: PathBuf::from(path),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            busy_timeout_ms: lookup(ENV_DB_BUSY_TIMEOUT_MS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

/// What a write does once contention has outlasted every attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustionPolicy {
    /// Log a warning and report the write as dropped.
    #[default]
    Silent,
    /// Return an error to the caller.
    FailLoud,
}

impl FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "drop" => Ok(ExhaustionPolicy::Silent),
            "fail-loud" | "loud" | "fail" => Ok(ExhaustionPolicy::FailLoud),
            other => Err(format!("unknown exhaustion policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts for one write, including the first.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            on_exhausted: ExhaustionPolicy::Silent,
        }
    }
}

impl RetryPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Never fewer than one attempt.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let defaults: RetryPolicy = RetryPolicy::default();
        Self {
            max_retries: lookup(ENV_DB_MAX_RETRIES)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_delay_ms: lookup(ENV_DB_RETRY_DELAY_MS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_delay_ms),
            on_exhausted: lookup(ENV_DB_ON_EXHAUSTED)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.on_exhausted),
        }
    }
}

/// Backend plus retry behavior. Shipped to worker processes alongside the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub backend: StoreConfig,
    pub retry: RetryPolicy,
}

impl StoreSettings {
    pub fn new(backend: StoreConfig) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            backend: StoreConfig::from_lookup(&lookup),
            retry: RetryPolicy::from_lookup(&lookup),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn request_defaults() {
        let req = ScanRequest::default();
        assert_eq!(req.timeout(), Duration::from_secs(3));
        assert_eq!(req.retries, 1);
        assert_eq!(req.thread_per_host, 100);
        assert_eq!(req.parallel_module_scan, 1);
        assert_eq!(req.hardware_usage, 21);
        assert!(req.skip_service_discovery);
        assert!(!req.grab_banners);
        assert_eq!(req.retry_delay(), Duration::ZERO);
    }

    #[test]
    fn derived_requests_leave_the_original_untouched() {
        let base = ScanRequest {
            targets: vec!["a".into()],
            selected_modules: vec!["port_scan".into()],
            ..Default::default()
        };
        let narrowed = base.with_modules(vec!["icmp_scan".into()]);
        let retargeted = base.with_targets(vec!["b".into()]);

        assert_eq!(base.selected_modules, vec!["port_scan"]);
        assert_eq!(narrowed.selected_modules, vec!["icmp_scan"]);
        assert_eq!(narrowed.targets, vec!["a"]);
        assert_eq!(retargeted.targets, vec!["b"]);
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let req: ScanRequest =
            serde_json::from_str(r#"{"targets":["x"],"selected_modules":["port_scan"]}"#).unwrap();
        assert_eq!(req.thread_per_host, DEFAULT_THREAD_PER_HOST);
        assert_eq!(req.targets, vec!["x"]);
    }

    #[test]
    fn list_files_are_appended() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.9\n\n  b.example \n").unwrap();

        let req = ScanRequest {
            targets: vec!["a.example".into()],
            targets_list: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let resolved = req.resolve_list_files().unwrap();
        assert_eq!(resolved.targets, vec!["a.example", "10.0.0.9", "b.example"]);
        assert!(resolved.targets_list.is_none());
    }

    #[test]
    fn missing_list_file_is_an_error() {
        let req = ScanRequest {
            usernames_list: Some(PathBuf::from("/definitely/not/here.txt")),
            ..Default::default()
        };
        assert!(matches!(
            req.resolve_list_files(),
            Err(TargetError::ListFile { .. })
        ));
    }

    #[test]
    fn port_lists() {
        assert_eq!(parse_port_list("80, 22,20-23").unwrap(), vec![20, 21, 22, 23, 80]);
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("90-80").is_err());
        assert!(parse_port_list("http").is_err());
    }

    #[test]
    fn settings_defaults_without_env() {
        let settings = StoreSettings::from_lookup(lookup_from(&[]));
        assert_eq!(settings.backend, StoreConfig::sqlite(DEFAULT_DB_PATH));
        assert_eq!(settings.retry, RetryPolicy::default());
    }

    #[test]
    fn settings_from_env_values() {
        let settings = StoreSettings::from_lookup(lookup_from(&[
            (ENV_DB_ENGINE, "postgres"),
            (ENV_DB_URL, "postgres://db/scans"),
            (ENV_DB_MAX_RETRIES, "7"),
            (ENV_DB_RETRY_DELAY_MS, "5"),
            (ENV_DB_ON_EXHAUSTED, "fail-loud"),
        ]));
        assert_eq!(settings.backend, StoreConfig::postgres("postgres://db/scans"));
        assert_eq!(settings.retry.max_retries, 7);
        assert_eq!(settings.retry.retry_delay(), Duration::from_millis(5));
        assert_eq!(settings.retry.on_exhausted, ExhaustionPolicy::FailLoud);
    }

    #[test]
    fn sqlite_busy_timeout_override() {
        let settings = StoreSettings::from_lookup(lookup_from(&[(ENV_DB_BUSY_TIMEOUT_MS, "900")]));
        match settings.backend {
            StoreConfig::Sqlite {
                busy_timeout_ms, ..
            } => assert_eq!(busy_timeout_ms, 900),
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn zero_retries_still_attempts_once() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(policy.attempts(), 1);
    }
}
