//! Guest performance sampling.

use super::{block_rates, cpu_load, traffic_rates, wait_for_boundary, with_fields, DeltaTracker};
use crate::bus::Emitter;
use crate::error::Result;
use crate::hypervisor::{BlockStats, DomainMapping, Hypervisor, InterfaceStats};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use virtnode_protocol::GuestPerfKind;

/// Rates computed in one cycle, one entry per key that had a prior sample.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GuestBatches {
    /// CPU load and memory per guest.
    pub cpu_memory: Vec<Value>,
    /// Traffic rates per guest interface.
    pub traffic: Vec<Value>,
    /// I/O rates per guest disk.
    pub disk_io: Vec<Value>,
}

/// Samples every running guest each cycle.
pub struct GuestPerfEngine {
    hypervisor: Arc<dyn Hypervisor>,
    emitter: Emitter,
    interval: Duration,
    housekeeping_interval: Duration,
    last_housekeeping: Instant,
    cpu: DeltaTracker<String, u64>,
    traffic: DeltaTracker<String, InterfaceStats>,
    disk: DeltaTracker<String, BlockStats>,
}

impl GuestPerfEngine {
    /// Create an engine sampling every `interval`.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        emitter: Emitter,
        interval: Duration,
        housekeeping_interval: Duration,
    ) -> Self {
        Self {
            hypervisor,
            emitter,
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
        tracing::info!(interval = ?self.interval, "guest telemetry started");
        while wait_for_boundary(self.interval, shutdown) {
            let now = Instant::now();
            match self.collect(now) {
                Ok(batches) => self.emit(batches),
                Err(e) => tracing::warn!(error = %e, "guest telemetry cycle failed"),
            }
            if now.saturating_duration_since(self.last_housekeeping) >= self.housekeeping_interval {
                self.housekeep(now);
                self.last_housekeeping = now;
            }
        }
        tracing::info!("guest telemetry stopped");
    }

    /// Sample every running guest at `now`.
    ///
    /// A guest whose counters cannot be read is skipped for this cycle.
    pub fn collect(&mut self, now: Instant) -> Result<GuestBatches> {
        let mapping = DomainMapping::refresh(self.hypervisor.as_ref())?;
        let mut batches = GuestBatches::default();

        for guest in mapping.guests().filter(|g| g.active) {
            if let Some((previous, elapsed)) = self.cpu.observe(guest.uuid.clone(), guest.cpu_time_ns, now) {
                let memory_rate = if guest.max_memory_kib > 0 {
                    guest.memory_kib as f64 / guest.max_memory_kib as f64 * 100.0
                } else {
                    0.0
                };
                batches.cpu_memory.push(json!({
                    "uuid": guest.uuid,
                    "cpu_load": cpu_load(guest.cpu_time_ns, previous, elapsed, guest.cpu_count),
                    "memory_kib": guest.memory_kib,
                    "max_memory_kib": guest.max_memory_kib,
                    "memory_rate": memory_rate,
                }));
            }

            if let Err(e) = self.sample_devices(&guest.uuid, now, &mut batches) {
                tracing::debug!(uuid = %guest.uuid, error = %e, "skipping guest devices this cycle");
            }
        }

        Ok(batches)
    }

    fn sample_devices(&mut self, uuid: &str, now: Instant, batches: &mut GuestBatches) -> Result<()> {
        for interface in self.hypervisor.interfaces(uuid)? {
            let stats = self.hypervisor.interface_stats(uuid, &interface)?;
            let key = format!("{}:{}", uuid, interface);
            if let Some((previous, elapsed)) = self.traffic.observe(key, stats, now) {
                batches.traffic.push(with_fields(
                    json!({ "uuid": uuid, "name": interface }),
                    traffic_rates(&stats, &previous, elapsed),
                ));
            }
        }

        for disk in self.hypervisor.disk_devices(uuid)? {
            let stats = self.hypervisor.block_stats(uuid, &disk.target)?;
            let key = format!("{}:{}", uuid, disk.target);
            if let Some((previous, elapsed)) = self.disk.observe(key, stats, now) {
                batches.disk_io.push(with_fields(
                    json!({ "uuid": uuid, "device": disk.target }),
                    block_rates(&stats, &previous, elapsed),
                ));
            }
        }
        Ok(())
    }

    /// Publish non-empty batches.
    pub fn emit(&self, batches: GuestBatches) {
        for (kind, batch) in [
            (GuestPerfKind::CpuMemory, batches.cpu_memory),
            (GuestPerfKind::Traffic, batches.traffic),
            (GuestPerfKind::DiskIo, batches.disk_io),
        ] {
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = self.emitter.guest_performance(kind, Value::Array(batch)) {
                tracing::warn!(?kind, error = %e, "failed to emit guest performance batch");
            }
        }
    }

    /// Drop state of keys not sampled within two intervals of `now`.
    pub fn housekeep(&mut self, now: Instant) {
        let max_age = self.interval * 2;
        let purged = self.cpu.purge_older_than(max_age, now)
            + self.traffic.purge_older_than(max_age, now)
            + self.disk.purge_older_than(max_age, now);
        if purged > 0 {
            tracing::debug!(purged, "purged stale guest samples");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::host::HostIdentity;
    use crate::hypervisor::{DiskDevice, DomainState, MockHypervisor};
    use std::path::PathBuf;

    fn engine(hv: &Arc<MockHypervisor>, bus: &Arc<MemoryBus>) -> GuestPerfEngine {
        let emitter = Emitter::new(bus.clone(), "C:Event", HostIdentity::with_node_id(1));
        GuestPerfEngine::new(
            hv.clone(),
            emitter,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        )
    }

    fn guest_with_devices(hv: &MockHypervisor, uuid: &str) {
        hv.add_guest(uuid, DomainState::Running);
        hv.set_disks(
            uuid,
            vec![DiskDevice {
                target: "vda".to_string(),
                source: PathBuf::from("/data/a.qcow2"),
                boot_order: Some(1),
            }],
        );
        hv.set_interface_stats(uuid, "vnet0", InterfaceStats::default());
        hv.set_block_stats(uuid, "vda", BlockStats::default());
    }

    #[test]
    fn test_first_cycle_emits_nothing() {
        let hv = Arc::new(MockHypervisor::new());
        let bus = Arc::new(MemoryBus::new());
        guest_with_devices(&hv, "a");

        let mut engine = engine(&hv, &bus);
        let batches = engine.collect(Instant::now()).unwrap();
        assert_eq!(batches, GuestBatches::default());

        engine.emit(batches);
        assert!(bus.published("C:Event").is_empty());
    }

    #[test]
    fn test_second_cycle_reports_rates() {
        let hv = Arc::new(MockHypervisor::new());
        let bus = Arc::new(MemoryBus::new());
        guest_with_devices(&hv, "a");

        let mut engine = engine(&hv, &bus);
        let t0 = Instant::now();
        engine.collect(t0).unwrap();

        // Two CPUs, 30 CPU-seconds in 60 seconds
        hv.set_cpu_time("a", 30_000_000_000);
        hv.set_interface_stats(
            "a",
            "vnet0",
            InterfaceStats {
                rx_bytes: 6000,
                tx_bytes: 1200,
                ..Default::default()
            },
        );
        hv.set_block_stats(
            "a",
            "vda",
            BlockStats {
                wr_bytes: 60 * 4096,
                ..Default::default()
            },
        );

        let batches = engine.collect(t0 + Duration::from_secs(60)).unwrap();
        assert_eq!(batches.cpu_memory[0]["cpu_load"], 25.0);
        assert_eq!(batches.traffic[0]["name"], "vnet0");
        assert_eq!(batches.traffic[0]["rx_bytes"], 100.0);
        assert_eq!(batches.traffic[0]["tx_bytes"], 20.0);
        assert_eq!(batches.disk_io[0]["wr_bytes"], 4096.0);

        engine.emit(batches);
        let events = bus.published("C:Event");
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e["kind"] == 4));
    }

    #[test]
    fn test_inactive_guests_are_not_sampled() {
        let hv = Arc::new(MockHypervisor::new());
        let bus = Arc::new(MemoryBus::new());
        hv.add_guest("off", DomainState::Shutoff);

        let mut engine = engine(&hv, &bus);
        let t0 = Instant::now();
        engine.collect(t0).unwrap();
        let batches = engine.collect(t0 + Duration::from_secs(60)).unwrap();
        assert!(batches.cpu_memory.is_empty());
    }

    #[test]
    fn test_housekeeping_forgets_departed_guests() {
        let hv = Arc::new(MockHypervisor::new());
        let bus = Arc::new(MemoryBus::new());
        guest_with_devices(&hv, "a");

        let mut engine = engine(&hv, &bus);
        let t0 = Instant::now();
        engine.collect(t0).unwrap();
        assert_eq!(engine.cpu.len(), 1);
        assert_eq!(engine.traffic.len(), 1);

        engine.housekeep(t0 + Duration::from_secs(121));
        assert!(engine.cpu.is_empty());
        assert!(engine.traffic.is_empty());
        assert!(engine.disk.is_empty());
    }
}
