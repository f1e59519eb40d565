//! Reachability probe.
//!
//! IPv4 targets get ICMP echo requests over a raw transport channel, which needs
//! root. IPv6 targets fall back to a TCP handshake: any answer, even a reset,
//! means the host is up.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::transport::{
    self, TransportChannelType, TransportProtocol, icmp_packet_iter,
};
use serde_json::json;
use tracing::debug;

use sweepr_common::module::{ModuleContext, ScanModule};
use sweepr_protocols::icmp;

pub const NAME: &str = "icmp_scan";

const TRANSPORT_BUFFER_SIZE: usize = 4096;
const CHANNEL_TYPE_ICMP: TransportChannelType =
    TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Icmp));
const ECHO_PAYLOAD: &[u8] = b"sweepr-echo";
const HANDSHAKE_PORTS: &[u16] = &[443, 80];

#[derive(Debug, Default)]
pub struct IcmpScan {
    addr: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Icmp,
    Handshake,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Icmp => "icmp",
            Method::Handshake => "tcp_handshake",
        }
    }
}

#[async_trait]
impl ScanModule for IcmpScan {
    async fn load(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self.addr = Some(resolve(&ctx.target).await?);
        Ok(())
    }

    fn build_loops(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        anyhow::ensure!(self.addr.is_some(), "{} was not resolved", ctx.target);
        Ok(())
    }

    async fn execute(&mut self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let addr: IpAddr = self.addr.context("target not resolved")?;
        let attempts: u32 = ctx.request.retries.max(1);
        let wait: Duration = ctx.timeout();

        let (alive, method) = match addr {
            IpAddr::V4(v4) => {
                let alive = tokio::task::spawn_blocking(move || ping_v4(v4, wait, attempts))
                    .await
                    .context("echo task panicked")??;
                (alive, Method::Icmp)
            }
            IpAddr::V6(_) => (handshake_probe(ctx, addr).await, Method::Handshake),
        };

        debug!("{} ({addr}) alive: {alive}", ctx.target);
        if alive {
            ctx.emit(None, json!({"alive": true, "address": addr.to_string(), "method": method.as_str()}))
                .await?;
        }
        Ok(())
    }
}

async fn resolve(target: &str) -> anyhow::Result<IpAddr> {
    if let Ok(addr) = target.parse::<IpAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host((target, 0))
        .await
        .with_context(|| format!("resolving {target}"))?
        .map(|socket| socket.ip())
        .next()
        .with_context(|| format!("{target} has no addresses"))
}

/// Sends up to `attempts` echo requests, waiting `wait` for each reply.
fn ping_v4(addr: Ipv4Addr, wait: Duration, attempts: u32) -> anyhow::Result<bool> {
    let (mut tx, mut rx) = transport::transport_channel(TRANSPORT_BUFFER_SIZE, CHANNEL_TYPE_ICMP)
        .context("opening raw ICMP channel")?;
    let mut replies = icmp_packet_iter(&mut rx);
    let identifier: u16 = rand::random();
    let target = IpAddr::V4(addr);

    for sequence in 0..attempts {
        let request: Vec<u8> = icmp::create_echo_request(identifier, sequence as u16, ECHO_PAYLOAD)?;
        let packet = IcmpPacket::new(&request).context("viewing echo request")?;
        tx.send_to(packet, target)?;

        let deadline: Instant = Instant::now() + wait;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match replies.next_with_timeout(remaining)? {
                Some((reply, source)) if source == target => {
                    if icmp::parse_echo_reply(&reply).is_some_and(|(id, _)| id == identifier) {
                        return Ok(true);
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    Ok(false)
}

/// Treats a completed or refused TCP handshake on any of a few common ports as
/// proof of life.
async fn handshake_probe(ctx: &ModuleContext, addr: IpAddr) -> bool {
    let host: String = addr.to_string();
    for port in HANDSHAKE_PORTS {
        match ctx.dialer.connect(&host, *port).await {
            Ok(_) => return true,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused && ctx.dialer.proxy().is_none() => {
                return true;
            }
            Err(_) => {}
        }
    }
    false
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
