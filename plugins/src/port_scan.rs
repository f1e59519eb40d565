//! TCP connect scan over the requested ports.
//!
//! Connections go through the task's dialer, so a configured SOCKS5 proxy is
//! honored. With `grab_banners` set, the first bytes an open port sends are
//! recorded as its banner.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::debug;

use sweepr_common::module::{ModuleContext, ScanModule};

pub const NAME: &str = "port_scan";

/// Scanned when the request names no ports.
pub const COMMON_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 443, 445, 465, 587, 993, 995, 1433, 1521,
    1723, 2049, 3306, 3389, 5432, 5900, 6379, 8000, 8080, 8443, 9200, 27017,
];

/// Temp event listing every open port, for modules that run later in the scan.
pub const OPEN_PORTS_SIGNAL: &str = "open_ports";

const BANNER_LEN: usize = 256;
const BANNER_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct PortScan {
    ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenPort {
    port: u16,
    banner: Option<String>,
}

#[async_trait]
impl ScanModule for PortScan {
    fn build_loops(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let request = &ctx.request;
        let candidates: &[u16] = if request.ports.is_empty() {
            COMMON_PORTS
        } else {
            &request.ports
        };

        self.ports = candidates
            .iter()
            .copied()
            .filter(|port| !request.excluded_ports.contains(port))
            .collect();
        Ok(())
    }

    fn sort_loops(&mut self) {
        self.ports.sort_unstable();
        self.ports.dedup();
    }

    async fn execute(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let grab_banner: bool = ctx.request.grab_banners;

        let mut open: Vec<OpenPort> = stream::iter(self.ports.iter().copied())
            .map(|port| probe(ctx, port, grab_banner))
            .buffer_unordered(ctx.thread_per_host())
            .filter_map(|found| async move { found })
            .collect()
            .await;
        open.sort_by_key(|found| found.port);

        debug!("{}: {} open port(s)", ctx.target, open.len());
        if open.is_empty() {
            return Ok(());
        }

        let ports: Vec<u16> = open.iter().map(|found| found.port).collect();
        ctx.emit_temp(OPEN_PORTS_SIGNAL, json!(ports)).await?;

        for found in open {
            let event = match &found.banner {
                Some(banner) => json!({"port": found.port, "state": "open", "banner": banner}),
                None => json!({"port": found.port, "state": "open"}),
            };
            ctx.emit(Some(found.port), event).await?;
        }
        Ok(())
    }
}

async fn probe(ctx: &ModuleContext, port: u16, grab_banner: bool) -> Option<OpenPort> {
    let attempts: u32 = ctx.request.retries.max(1);

    for attempt in 1..=attempts {
        match ctx.dialer.connect(&ctx.target, port).await {
            Ok(mut stream) => {
                let banner: Option<String> = if grab_banner {
                    read_banner(&mut stream).await
                } else {
                    None
                };
                return Some(OpenPort { port, banner });
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => return None,
            Err(_) if attempt < attempts => tokio::time::sleep(ctx.request.retry_delay()).await,
            Err(_) => {}
        }
    }
    None
}

async fn read_banner(stream: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = [0u8; BANNER_LEN];
    match timeout(BANNER_WAIT, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            let text: String = String::from_utf8_lossy(&buf[..n]).trim().to_string();
            Some(text).filter(|t| !t.is_empty())
        }
        _ => None,
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
