//! Splits a flat target list into the groups handed to worker processes.

/// Ordered targets consumed by exactly one worker process.
pub type TargetGroup = Vec<String>;

/// Partitions `targets` in order.
///
/// `hardware_usage` is a percentage clamped to `1..=100`. Each group holds
/// `ceil(len * usage / 100)` targets, so higher usage yields fewer, larger
/// groups and there are never more than 100 of them.
pub fn group_targets(targets: &[String], hardware_usage: u8) -> Vec<TargetGroup> {
    if targets.is_empty() {
        return Vec::new();
    }

    let usage: usize = hardware_usage.clamp(1, 100) as usize;
    let group_size: usize = (targets.len() * usage).div_ceil(100).max(1);

    targets
        .chunks(group_size)
        .filter(|chunk| !chunk.is_empty())
        .map(<[String]>::to_vec)
        .collect()
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
