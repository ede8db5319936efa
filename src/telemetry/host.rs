//! Host performance sampling.

use super::proc::{self, CpuTimes};
use super::{block_rates, traffic_rates, wait_for_boundary, with_fields, DeltaTracker};
use crate::bus::Emitter;
use crate::error::Result;
use crate::hypervisor::{BlockStats, InterfaceStats};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use virtnode_protocol::HostPerfKind;

/// Key of the host's aggregate CPU sample.
const CPU_KEY: &str = "cpu";

/// Rates computed in one host cycle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HostBatches {
    /// CPU load and memory, at most one entry.
    pub cpu_memory: Vec<Value>,
    /// Traffic rates per interface.
    pub traffic: Vec<Value>,
    /// I/O rates per block device.
    pub disk_io: Vec<Value>,
    /// Usage per mounted filesystem.
    pub disk_usage: Vec<Value>,
}

/// Samples the host's own counters each cycle.
pub struct HostPerfEngine {
    emitter: Emitter,
    system: System,
    proc_root: PathBuf,
    interval: Duration,
    housekeeping_interval: Duration,
    last_housekeeping: Instant,
    cpu: DeltaTracker<&'static str, CpuTimes>,
    traffic: DeltaTracker<String, InterfaceStats>,
    disk: DeltaTracker<String, BlockStats>,
}

impl HostPerfEngine {
    /// Create an engine reading counters under `proc_root`.
    pub fn new(
        emitter: Emitter,
        proc_root: impl Into<PathBuf>,
        interval: Duration,
        housekeeping_interval: Duration,
    ) -> Self {
        Self {
            emitter,
            system: System::new(),
            proc_root: proc_root.into(),
            interval,
            housekeeping_interval,
            last_housekeeping: Instant::now(),
            cpu: DeltaTracker::new(),
            traffic: DeltaTracker::new(),
            disk: DeltaTracker::new(),
        }
    }

    /// Sample on interval boundaries until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        tracing::info!(interval = ?self.interval, "host telemetry started");
        while wait_for_boundary(self.interval, shutdown) {
            let now = Instant::now();
            match self.collect(now) {
                Ok(batches) => self.emit(batches),
                Err(e) => tracing::warn!(error = %e, "host telemetry cycle failed"),
            }
            if now.saturating_duration_since(self.last_housekeeping) >= self.housekeeping_interval {
                self.housekeep(now);
                self.last_housekeeping = now;
            }
        }
        tracing::info!("host telemetry stopped");
    }

    /// Sample host counters at `now`.
    ///
    /// Every source is read before any baseline moves, so a failed read
    /// leaves all of them at the last complete cycle.
    pub fn collect(&mut self, now: Instant) -> Result<HostBatches> {
        let times = proc::read_cpu_times(&self.proc_root)?;
        let interfaces = proc::read_net_dev(&self.proc_root)?;
        let devices = proc::read_diskstats(&self.proc_root)?;

        let mut batches = HostBatches::default();
        if let Some((previous, _)) = self.cpu.observe(CPU_KEY, times, now) {
            self.system.refresh_memory();
            let total = self.system.total_memory();
            let available = self.system.available_memory();
            let memory_rate = if total > 0 {
                (total - available.min(total)) as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            batches.cpu_memory.push(json!({
                "cpu_load": times.load_since(&previous),
                "memory_total": total,
                "memory_available": available,
                "memory_rate": memory_rate,
            }));
        }

        for (name, stats) in interfaces {
            if let Some((previous, elapsed)) = self.traffic.observe(name.clone(), stats, now) {
                batches.traffic.push(with_fields(
                    json!({ "name": name }),
                    traffic_rates(&stats, &previous, elapsed),
                ));
            }
        }

        for (name, stats) in devices {
            if let Some((previous, elapsed)) = self.disk.observe(name.clone(), stats, now) {
                batches.disk_io.push(with_fields(
                    json!({ "device": name }),
                    block_rates(&stats, &previous, elapsed),
                ));
            }
        }

        if !batches.disk_io.is_empty() {
            batches.disk_usage = disk_usage();
        }

        Ok(batches)
    }

    /// Publish non-empty batches.
    pub fn emit(&self, batches: HostBatches) {
        let mut outgoing = Vec::new();
        if !batches.cpu_memory.is_empty() {
            outgoing.push((HostPerfKind::CpuMemory, Value::Array(batches.cpu_memory)));
        }
        if !batches.traffic.is_empty() {
            outgoing.push((HostPerfKind::Traffic, Value::Array(batches.traffic)));
        }
        if !batches.disk_io.is_empty() {
            outgoing.push((
                HostPerfKind::DiskUsageIo,
                json!({ "usage": batches.disk_usage, "io": batches.disk_io }),
            ));
        }

        for (kind, batch) in outgoing {
            if let Err(e) = self.emitter.host_performance(kind, batch) {
                tracing::warn!(?kind, error = %e, "failed to emit host performance batch");
            }
        }
    }

    /// Drop state of devices not sampled within two intervals of `now`.
    pub fn housekeep(&mut self, now: Instant) {
        let max_age = self.interval * 2;
        let purged = self.cpu.purge_older_than(max_age, now)
            + self.traffic.purge_older_than(max_age, now)
            + self.disk.purge_older_than(max_age, now);
        if purged > 0 {
            tracing::debug!(purged, "purged stale host samples");
        }
    }
}

/// Usage of every mounted filesystem.
pub fn disk_usage() -> Vec<Value> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            let available = disk.available_space();
            json!({
                "mountpoint": disk.mount_point().display().to_string(),
                "device": disk.name().to_string_lossy(),
                "total": total,
                "available": available,
                "used": total.saturating_sub(available),
            })
        })
        .collect()
}
