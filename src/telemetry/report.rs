//! Heartbeat and guest state reports.

use super::{proc, sleep_unless_shutdown};
use crate::bus::Emitter;
use crate::error::Result;
use crate::hypervisor::{DomainMapping, Hypervisor};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use virtnode_protocol::{GuestState, HostEvent};

/// Periodic host liveness and capacity report.
pub struct Heartbeat {
    emitter: Emitter,
    system: System,
    proc_root: PathBuf,
    interval: Duration,
}

impl Heartbeat {
    /// Create a reporter emitting every `interval`.
    pub fn new(emitter: Emitter, proc_root: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            emitter,
            system: System::new(),
            proc_root: proc_root.into(),
            interval,
        }
    }

    /// Report until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        tracing::info!(interval = ?self.interval, "heartbeat started");
        while !shutdown.load(Ordering::Acquire) {
            let message = self.snapshot();
            if let Err(e) = self.emitter.host_event(HostEvent::Heartbeat, message) {
                tracing::warn!(error = %e, "failed to emit heartbeat");
            }
            if !sleep_unless_shutdown(self.interval, shutdown) {
                break;
            }
        }
        tracing::info!("heartbeat stopped");
    }

    /// Static identity plus live load, memory, interfaces and disks.
    pub fn snapshot(&mut self) -> Value {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let identity = self.emitter.identity();
        let load = System::load_average();
        let interfaces: Vec<String> = proc::read_net_dev(&self.proc_root)
            .map(|list| list.into_iter().map(|(name, _)| name).collect())
            .unwrap_or_default();

        json!({
            "node_id": identity.node_id,
            "hostname": identity.hostname,
            "version": crate::VERSION,
            "cpu_count": self.system.cpus().len(),
            "memory_total": self.system.total_memory(),
            "memory_available": self.system.available_memory(),
            "boot_time": System::boot_time(),
            "uptime": System::uptime(),
            "load_avg": [load.one, load.five, load.fifteen],
            "interfaces": interfaces,
            "disks": super::host::disk_usage(),
        })
    }
}

/// Periodic per-guest state report.
pub struct StateReporter {
    hypervisor: Arc<dyn Hypervisor>,
    emitter: Emitter,
    interval: Duration,
}

impl StateReporter {
    /// Create a reporter emitting every `interval`.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, emitter: Emitter, interval: Duration) -> Self {
        Self {
            hypervisor,
            emitter,
            interval,
        }
    }

    /// Report until `shutdown` is raised.
    pub fn run(&self, shutdown: &AtomicBool) {
        tracing::info!(interval = ?self.interval, "guest state report started");
        while !shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.report() {
                tracing::warn!(error = %e, "guest state report failed");
            }
            if !sleep_unless_shutdown(self.interval, shutdown) {
                break;
            }
        }
        tracing::info!("guest state report stopped");
    }

    /// Emit one `guest_event` per defined guest. Returns how many.
    pub fn report(&self) -> Result<usize> {
        report_guest_states(self.hypervisor.as_ref(), &self.emitter)
    }
}

/// Emit the current state of every defined guest. Returns how many.
pub fn report_guest_states(hypervisor: &dyn Hypervisor, emitter: &Emitter) -> Result<usize> {
    let mapping = DomainMapping::refresh(hypervisor)?;
    for guest in mapping.guests() {
        let state = GuestState::from(guest.state);
        emitter.guest_event(state, json!({ "uuid": guest.uuid, "state": state.code() }))?;
    }
    Ok(mapping.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::host::HostIdentity;
    use crate::hypervisor::{DomainState, MockHypervisor};

    #[test]
    fn test_state_report_covers_every_guest() {
        let hv = Arc::new(MockHypervisor::new());
        hv.add_guest("a", DomainState::Running);
        hv.add_guest("b", DomainState::Paused);
        let bus = Arc::new(MemoryBus::new());
        let emitter = Emitter::new(bus.clone(), "C:Event", HostIdentity::with_node_id(3));

        let reporter = StateReporter::new(hv, emitter, Duration::from_secs(60));
        assert_eq!(reporter.report().unwrap(), 2);

        let mut states: Vec<(String, u64)> = bus
            .published("C:Event")
            .iter()
            .map(|e| {
                assert_eq!(e["kind"], 1);
                (e["message"]["uuid"].as_str().unwrap().to_string(), e["type"].as_u64().unwrap())
            })
            .collect();
        states.sort();
        assert_eq!(states, [("a".to_string(), 2), ("b".to_string(), 4)]);
    }

    #[test]
    fn test_heartbeat_carries_identity() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let identity = HostIdentity {
            node_id: 11,
            hostname: "hv-1".to_string(),
        };
        let emitter = Emitter::new(bus.clone(), "C:Event", identity);

        let mut heartbeat = Heartbeat::new(emitter, dir.path(), Duration::from_secs(10));
        let snapshot = heartbeat.snapshot();
        assert_eq!(snapshot["node_id"], 11);
        assert_eq!(snapshot["hostname"], "hv-1");
        assert_eq!(snapshot["version"], crate::VERSION);
        assert!(snapshot["interfaces"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_loop_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let emitter = Emitter::new(bus.clone(), "C:Event", HostIdentity::with_node_id(1));
        let shutdown = Arc::new(AtomicBool::new(false));

        let runner = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                Heartbeat::new(emitter, dir.path().to_path_buf(), Duration::from_secs(3600)).run(&shutdown);
                dir
            })
        };
        while bus.published("C:Event").is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::Release);
        runner.join().unwrap();

        assert_eq!(bus.published("C:Event")[0]["kind"], 2);
    }
}
