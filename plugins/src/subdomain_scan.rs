//! Wordlist subdomain sweep.
//!
//! Every `label.target` candidate is sent as a DNS A query to the system
//! resolver. Names that resolve are reported together in a single event whose
//! `subdomains` array feeds the orchestrator's subdomain pass.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use sweepr_common::module::{ModuleContext, ScanModule};
use sweepr_protocols::dns;

pub const NAME: &str = "subdomain_scan";

pub const WORDLIST: &[&str] = &[
    "www", "mail", "webmail", "smtp", "imap", "pop", "ftp", "ns1", "ns2", "dns", "vpn",
    "remote", "api", "app", "dev", "staging", "test", "beta", "admin", "portal", "intranet",
    "blog", "shop", "docs", "git", "cdn", "static", "m", "secure", "cloud",
];

const RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_RESOLVER: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
const RECV_BUFFER: usize = 1500;

#[derive(Debug, Default)]
pub struct SubdomainScan {
    resolver: Option<SocketAddr>,
    candidates: Vec<String>,
}

#[async_trait]
impl ScanModule for SubdomainScan {
    async fn load(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        let conf: String = tokio::fs::read_to_string(RESOLV_CONF).await.unwrap_or_default();
        let resolver: IpAddr = nameserver_from(&conf).unwrap_or(IpAddr::V4(FALLBACK_RESOLVER));
        self.resolver = Some(SocketAddr::new(resolver, dns::DNS_PORT));
        Ok(())
    }

    fn build_loops(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self.candidates = candidates_for(&ctx.target);
        Ok(())
    }

    fn sort_loops(&mut self) {
        self.candidates.sort();
        self.candidates.dedup();
    }

    async fn execute(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let Some(resolver) = self.resolver else {
            anyhow::bail!("no resolver loaded");
        };
        if self.candidates.is_empty() {
            return Ok(());
        }

        let wait: Duration = ctx.timeout();
        let mut found: Vec<String> = stream::iter(self.candidates.iter().cloned())
            .map(|name| async move {
                match lookup(resolver, &name, wait).await {
                    Ok(true) => Some(name.clone()),
                    Ok(false) => None,
                    Err(e) => {
                        debug!("{name}: {e:#}");
                        None
                    }
                }
            })
            .buffer_unordered(ctx.thread_per_host())
            .filter_map(|name| async move { name })
            .collect()
            .await;
        found.sort();

        debug!("{}: {} subdomain(s) resolved", ctx.target, found.len());
        if !found.is_empty() {
            ctx.emit(None, json!({"subdomains": found})).await?;
        }
        Ok(())
    }
}

/// Candidates for a domain. Address literals have no subdomains.
fn candidates_for(target: &str) -> Vec<String> {
    let domain: &str = target.trim().trim_end_matches('.');
    if domain.is_empty() || domain.parse::<IpAddr>().is_ok() || !domain.contains('.') {
        return Vec::new();
    }
    WORDLIST
        .iter()
        .map(|label| format!("{label}.{domain}"))
        .collect()
}

fn nameserver_from(conf: &str) -> Option<IpAddr> {
    conf.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<IpAddr>().ok())
        .next()
}

/// True when `name` has at least one A record.
async fn lookup(resolver: SocketAddr, name: &str, wait: Duration) -> anyhow::Result<bool> {
    let bind_addr: &str = if resolver.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(resolver).await?;

    let id: u16 = rand::random();
    socket.send(&dns::create_a_packet(name, id)?).await?;

    let mut buf = vec![0u8; RECV_BUFFER];
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let n: usize = match timeout(remaining, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Ok(false),
        };
        match dns::parse_a_response(&buf[..n]) {
            Ok(answer) if answer.id == id => return Ok(!answer.addrs.is_empty()),
            _ => continue,
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
