//! Procfs counter parsing.

use crate::error::Result;
use crate::hypervisor::{BlockStats, InterfaceStats};
use std::path::Path;

/// Bytes per sector in `/proc/diskstats`.
const SECTOR_SIZE: u64 = 512;

/// Aggregate CPU time from the first line of `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    /// Ticks spent doing work.
    pub busy: u64,
    /// All ticks, idle included.
    pub total: u64,
}

impl CpuTimes {
    /// Busy share of the ticks elapsed since `previous`, in percent.
    pub fn load_since(&self, previous: &CpuTimes) -> f64 {
        if self.total <= previous.total || self.busy < previous.busy {
            return 0.0;
        }
        let load = (self.busy - previous.busy) as f64 / (self.total - previous.total) as f64 * 100.0;
        load.clamp(0.0, 100.0)
    }
}

/// Read `<proc_root>/stat`.
pub fn read_cpu_times(proc_root: &Path) -> Result<CpuTimes> {
    Ok(parse_cpu_times(&std::fs::read_to_string(proc_root.join("stat"))?))
}

/// Parse the aggregate `cpu` line.
pub fn parse_cpu_times(content: &str) -> CpuTimes {
    let Some(line) = content.lines().find(|l| l.starts_with("cpu ")) else {
        return CpuTimes::default();
    };
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();

    let total: u64 = fields.iter().take(8).sum();
    // idle + iowait
    let idle = fields.get(3).copied().unwrap_or(0) + fields.get(4).copied().unwrap_or(0);
    CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    }
}

/// Read `<proc_root>/net/dev`.
pub fn read_net_dev(proc_root: &Path) -> Result<Vec<(String, InterfaceStats)>> {
    Ok(parse_net_dev(&std::fs::read_to_string(
        proc_root.join("net").join("dev"),
    )?))
}

/// Parse interface counters, skipping loopback.
pub fn parse_net_dev(content: &str) -> Vec<(String, InterfaceStats)> {
    content
        .lines()
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let name = name.trim();
            if name == "lo" {
                return None;
            }
            let f: Vec<u64> = counters
                .split_whitespace()
                .map(|v| v.parse().ok())
                .collect::<Option<Vec<u64>>>()?;
            if f.len() < 16 {
                return None;
            }
            Some((
                name.to_string(),
                InterfaceStats {
                    rx_bytes: f[0],
                    rx_packets: f[1],
                    rx_errs: f[2],
                    rx_drop: f[3],
                    tx_bytes: f[8],
                    tx_packets: f[9],
                    tx_errs: f[10],
                    tx_drop: f[11],
                },
            ))
        })
        .collect()
}

/// Read `<proc_root>/diskstats`.
pub fn read_diskstats(proc_root: &Path) -> Result<Vec<(String, BlockStats)>> {
    Ok(parse_diskstats(&std::fs::read_to_string(
        proc_root.join("diskstats"),
    )?))
}

/// Parse block device counters, skipping loop and ram devices.
pub fn parse_diskstats(content: &str) -> Vec<(String, BlockStats)> {
    content
        .lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.len() < 10 {
                return None;
            }
            let name = f[2];
            if name.starts_with("loop") || name.starts_with("ram") {
                return None;
            }
            let n = |i: usize| f[i].parse::<u64>().ok();
            Some((
                name.to_string(),
                BlockStats {
                    rd_req: n(3)?,
                    rd_bytes: n(5)? * SECTOR_SIZE,
                    wr_req: n(7)?,
                    wr_bytes: n(9)? * SECTOR_SIZE,
                },
            ))
        })
        .collect()
}
