//! Built-in capability modules.

pub mod icmp_scan;
pub mod port_scan;
pub mod subdomain_scan;

#[cfg(test)]
mod testing;

use sweepr_common::module::ModuleRegistry;

use icmp_scan::IcmpScan;
use port_scan::PortScan;
use subdomain_scan::SubdomainScan;

/// Registry holding every module shipped with sweepr.
pub fn default_registry() -> ModuleRegistry {
    ModuleRegistry::new()
        .register(port_scan::NAME, || Box::new(PortScan::default()))
        .register(icmp_scan::NAME, || Box::new(IcmpScan::default()))
        .register(subdomain_scan::NAME, || Box::new(SubdomainScan::default()))
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
