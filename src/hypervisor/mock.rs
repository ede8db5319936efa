//! In-memory hypervisor.
//!
//! Keeps guests in a map, applies lifecycle calls to their state, and
//! records every mutating call as a line of text so callers can assert on
//! what was asked of the hypervisor.

use super::{
    BlockIoTune, BlockStats, DiskDevice, DomainState, GuestInfo, Hypervisor, InterfaceStats,
    LifecycleCallback, LifecycleEvent, MigrateFlags,
};
use crate::error::{Error, Result};
use crate::reactor::EventLoopImpl;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct MockGuest {
    info: GuestInfo,
    autostart: bool,
    disks: Vec<DiskDevice>,
    interfaces: Vec<(String, InterfaceStats)>,
    block_stats: HashMap<String, BlockStats>,
    snapshots: Vec<String>,
}

#[derive(Default)]
struct MockState {
    guests: HashMap<String, MockGuest>,
    calls: Vec<String>,
    failing: HashSet<String>,
    event_impl: Option<Arc<dyn EventLoopImpl>>,
    lifecycle: Vec<Arc<LifecycleCallback>>,
    next_snapshot: u64,
}

/// Hypervisor backed by a map of guests.
#[derive(Default)]
pub struct MockHypervisor {
    state: Mutex<MockState>,
}

impl MockHypervisor {
    /// Create a hypervisor with no guests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a guest with two vCPUs and 1 GiB of memory.
    pub fn add_guest(&self, uuid: &str, state: DomainState) {
        let guest = MockGuest {
            info: GuestInfo {
                uuid: uuid.to_string(),
                name: uuid.to_string(),
                state,
                active: is_active(state),
                cpu_count: 2,
                cpu_time_ns: 0,
                max_memory_kib: 1024 * 1024,
                memory_kib: 1024 * 1024,
            },
            autostart: false,
            disks: Vec::new(),
            interfaces: Vec::new(),
            block_stats: HashMap::new(),
            snapshots: Vec::new(),
        };
        self.state.lock().guests.insert(uuid.to_string(), guest);
    }

    /// Replace a guest's disks.
    pub fn set_disks(&self, uuid: &str, disks: Vec<DiskDevice>) {
        if let Some(guest) = self.state.lock().guests.get_mut(uuid) {
            guest.disks = disks;
        }
    }

    /// Set a guest's cumulative CPU time.
    pub fn set_cpu_time(&self, uuid: &str, cpu_time_ns: u64) {
        if let Some(guest) = self.state.lock().guests.get_mut(uuid) {
            guest.info.cpu_time_ns = cpu_time_ns;
        }
    }

    /// Set an interface's counters, adding the interface if needed.
    pub fn set_interface_stats(&self, uuid: &str, interface: &str, stats: InterfaceStats) {
        if let Some(guest) = self.state.lock().guests.get_mut(uuid) {
            match guest.interfaces.iter_mut().find(|(name, _)| name == interface) {
                Some((_, current)) => *current = stats,
                None => guest.interfaces.push((interface.to_string(), stats)),
            }
        }
    }

    /// Set a disk's counters.
    pub fn set_block_stats(&self, uuid: &str, device: &str, stats: BlockStats) {
        if let Some(guest) = self.state.lock().guests.get_mut(uuid) {
            guest.block_stats.insert(device.to_string(), stats);
        }
    }

    /// Make every call to `operation` fail.
    pub fn fail(&self, operation: &str) {
        self.state.lock().failing.insert(operation.to_string());
    }

    /// Mutating calls made so far, one line each.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Current state of a guest.
    pub fn state_of(&self, uuid: &str) -> Option<DomainState> {
        self.state.lock().guests.get(uuid).map(|g| g.info.state)
    }

    /// Current autostart setting of a guest.
    pub fn autostart_of(&self, uuid: &str) -> Option<bool> {
        self.state.lock().guests.get(uuid).map(|g| g.autostart)
    }

    /// Snapshots of a guest.
    pub fn snapshots_of(&self, uuid: &str) -> Vec<String> {
        self.state
            .lock()
            .guests
            .get(uuid)
            .map(|g| g.snapshots.clone())
            .unwrap_or_default()
    }

    /// Event loop handed over through [`Hypervisor::register_event_impl`].
    pub fn event_impl(&self) -> Option<Arc<dyn EventLoopImpl>> {
        self.state.lock().event_impl.clone()
    }

    /// Deliver a lifecycle event to every subscriber.
    pub fn emit_lifecycle(&self, event: LifecycleEvent) {
        let callbacks = self.state.lock().lifecycle.clone();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Record `call`, then apply `f` to the guest unless the operation is
    /// set to fail.
    fn with_guest<T>(
        &self,
        operation: &str,
        uuid: &str,
        call: String,
        f: impl FnOnce(&mut MockGuest) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing.contains(operation) {
            return Err(Error::hypervisor(format!("{} failed for {}", operation, uuid)));
        }
        let guest = state
            .guests
            .get_mut(uuid)
            .ok_or_else(|| Error::hypervisor(format!("domain not found: {}", uuid)))?;
        f(guest)
    }

    fn set_state(&self, operation: &str, uuid: &str, to: DomainState) -> Result<()> {
        self.with_guest(operation, uuid, format!("{} {}", operation, uuid), |g| {
            g.info.state = to;
            g.info.active = is_active(to);
            Ok(())
        })
    }

    fn read_guest<T>(&self, uuid: &str, f: impl FnOnce(&MockGuest) -> T) -> Result<T> {
        let state = self.state.lock();
        state
            .guests
            .get(uuid)
            .map(f)
            .ok_or_else(|| Error::hypervisor(format!("domain not found: {}", uuid)))
    }
}

fn is_active(state: DomainState) -> bool {
    !matches!(state, DomainState::Shutoff | DomainState::NoState | DomainState::Crashed)
}

fn xml_element<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(xml[start..end].trim())
}

impl Hypervisor for MockHypervisor {
    fn list_guests(&self) -> Result<Vec<GuestInfo>> {
        let state = self.state.lock();
        if state.failing.contains("list_guests") {
            return Err(Error::hypervisor("list_guests failed"));
        }
        Ok(state.guests.values().map(|g| g.info.clone()).collect())
    }

    fn define(&self, xml: &str) -> Result<String> {
        let uuid = xml_element(xml, "uuid")
            .ok_or_else(|| Error::hypervisor("domain XML has no uuid"))?
            .to_string();
        let name = xml_element(xml, "name").unwrap_or(&uuid).to_string();

        let mut state = self.state.lock();
        state.calls.push(format!("define {}", uuid));
        if state.failing.contains("define") {
            return Err(Error::hypervisor(format!("define failed for {}", uuid)));
        }
        state.guests.entry(uuid.clone()).or_insert_with(|| MockGuest {
            info: GuestInfo {
                uuid: uuid.clone(),
                name,
                state: DomainState::Shutoff,
                active: false,
                cpu_count: 1,
                cpu_time_ns: 0,
                max_memory_kib: 1024 * 1024,
                memory_kib: 1024 * 1024,
            },
            autostart: true,
            disks: Vec::new(),
            interfaces: Vec::new(),
            block_stats: HashMap::new(),
            snapshots: Vec::new(),
        });
        Ok(uuid)
    }

    fn undefine(&self, uuid: &str) -> Result<()> {
        self.with_guest("undefine", uuid, format!("undefine {}", uuid), |_| Ok(()))?;
        self.state.lock().guests.remove(uuid);
        Ok(())
    }

    fn start(&self, uuid: &str) -> Result<()> {
        self.set_state("start", uuid, DomainState::Running)
    }

    fn set_autostart(&self, uuid: &str, enabled: bool) -> Result<()> {
        self.with_guest(
            "set_autostart",
            uuid,
            format!("set_autostart {} {}", uuid, enabled),
            |g| {
                g.autostart = enabled;
                Ok(())
            },
        )
    }

    fn shutdown(&self, uuid: &str) -> Result<()> {
        self.set_state("shutdown", uuid, DomainState::Shutoff)
    }

    fn destroy(&self, uuid: &str) -> Result<()> {
        self.set_state("destroy", uuid, DomainState::Shutoff)
    }

    fn reboot(&self, uuid: &str) -> Result<()> {
        self.set_state("reboot", uuid, DomainState::Running)
    }

    fn reset(&self, uuid: &str) -> Result<()> {
        self.set_state("reset", uuid, DomainState::Running)
    }

    fn suspend(&self, uuid: &str) -> Result<()> {
        self.set_state("suspend", uuid, DomainState::Paused)
    }

    fn resume(&self, uuid: &str) -> Result<()> {
        self.set_state("resume", uuid, DomainState::Running)
    }

    fn set_user_password(&self, uuid: &str, user: &str, _password: &str) -> Result<()> {
        self.with_guest(
            "set_user_password",
            uuid,
            format!("set_user_password {} {}", uuid, user),
            |_| Ok(()),
        )
    }

    fn attach_device(&self, uuid: &str, xml: &str) -> Result<()> {
        self.with_guest("attach_device", uuid, format!("attach_device {} {}", uuid, xml), |_| {
            Ok(())
        })
    }

    fn detach_device(&self, uuid: &str, xml: &str) -> Result<()> {
        self.with_guest("detach_device", uuid, format!("detach_device {} {}", uuid, xml), |_| {
            Ok(())
        })
    }

    fn disk_devices(&self, uuid: &str) -> Result<Vec<DiskDevice>> {
        self.read_guest(uuid, |g| g.disks.clone())
    }

    fn interfaces(&self, uuid: &str) -> Result<Vec<String>> {
        self.read_guest(uuid, |g| g.interfaces.iter().map(|(n, _)| n.clone()).collect())
    }

    fn block_resize(&self, uuid: &str, device: &str, size: u64) -> Result<()> {
        self.with_guest(
            "block_resize",
            uuid,
            format!("block_resize {} {} {}", uuid, device, size),
            |_| Ok(()),
        )
    }

    fn set_block_io_tune(&self, uuid: &str, device: &str, tune: &BlockIoTune) -> Result<()> {
        self.with_guest(
            "set_block_io_tune",
            uuid,
            format!(
                "set_block_io_tune {} {} total_bytes_sec={} total_iops_sec={}",
                uuid, device, tune.total_bytes_sec, tune.total_iops_sec
            ),
            |_| Ok(()),
        )
    }

    fn set_interface_bandwidth(
        &self,
        uuid: &str,
        interface: &str,
        kib_per_sec: u64,
    ) -> Result<()> {
        self.with_guest(
            "set_interface_bandwidth",
            uuid,
            format!("set_interface_bandwidth {} {} {}", uuid, interface, kib_per_sec),
            |_| Ok(()),
        )
    }

    fn set_vcpus(&self, uuid: &str, count: u32) -> Result<()> {
        self.with_guest("set_vcpus", uuid, format!("set_vcpus {} {}", uuid, count), |g| {
            g.info.cpu_count = count;
            Ok(())
        })
    }

    fn set_memory(&self, uuid: &str, kib: u64) -> Result<()> {
        self.with_guest("set_memory", uuid, format!("set_memory {} {}", uuid, kib), |g| {
            g.info.max_memory_kib = kib;
            g.info.memory_kib = kib;
            Ok(())
        })
    }

    fn migrate(&self, uuid: &str, uri: &str, flags: MigrateFlags) -> Result<()> {
        self.with_guest(
            "migrate",
            uuid,
            format!("migrate {} {} {:?}", uuid, uri, flags),
            |_| Ok(()),
        )?;
        if flags.contains(MigrateFlags::UNDEFINE_SOURCE) {
            self.state.lock().guests.remove(uuid);
        }
        Ok(())
    }

    fn snapshot_create(&self, uuid: &str, _xml: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.next_snapshot += 1;
        let name = format!("snap-{}", state.next_snapshot);
        drop(state);

        self.with_guest("snapshot_create", uuid, format!("snapshot_create {}", uuid), |g| {
            g.snapshots.push(name.clone());
            Ok(name.clone())
        })
    }

    fn snapshot_delete(&self, uuid: &str, snapshot: &str) -> Result<()> {
        self.with_guest(
            "snapshot_delete",
            uuid,
            format!("snapshot_delete {} {}", uuid, snapshot),
            |g| {
                let before = g.snapshots.len();
                g.snapshots.retain(|s| s != snapshot);
                if g.snapshots.len() == before {
                    return Err(Error::hypervisor(format!("no snapshot {}", snapshot)));
                }
                Ok(())
            },
        )
    }

    fn snapshot_revert(&self, uuid: &str, snapshot: &str) -> Result<()> {
        self.with_guest(
            "snapshot_revert",
            uuid,
            format!("snapshot_revert {} {}", uuid, snapshot),
            |g| {
                if !g.snapshots.iter().any(|s| s == snapshot) {
                    return Err(Error::hypervisor(format!("no snapshot {}", snapshot)));
                }
                Ok(())
            },
        )
    }

    fn interface_stats(&self, uuid: &str, interface: &str) -> Result<InterfaceStats> {
        self.read_guest(uuid, |g| {
            g.interfaces
                .iter()
                .find(|(n, _)| n == interface)
                .map(|(_, s)| *s)
        })?
        .ok_or_else(|| Error::hypervisor(format!("no interface {}", interface)))
    }

    fn block_stats(&self, uuid: &str, device: &str) -> Result<BlockStats> {
        self.read_guest(uuid, |g| g.block_stats.get(device).copied())?
            .ok_or_else(|| Error::hypervisor(format!("no block device {}", device)))
    }

    fn register_event_impl(&self, event_loop: Arc<dyn EventLoopImpl>) -> Result<()> {
        self.state.lock().event_impl = Some(event_loop);
        Ok(())
    }

    fn register_lifecycle_callback(&self, callback: LifecycleCallback) -> Result<()> {
        self.state.lock().lifecycle.push(Arc::new(callback));
        Ok(())
    }
}
