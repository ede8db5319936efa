//! Hypervisor boundary.
//!
//! This module defines what the agent needs from the virtualization library:
//! guest enumeration, lifecycle and device control, migration, snapshots,
//! statistics, and event-loop registration. The library itself is an
//! external collaborator; [`MockHypervisor`] is the in-process
//! implementation used for embedding and tests.
//!
//! Nothing here caches guest membership. Every caller that needs to resolve a
//! UUID builds a fresh [`DomainMapping`].

pub mod events;
pub mod mock;

use crate::error::{Error, Result};
use crate::reactor::EventLoopImpl;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;
use virtnode_protocol::GuestState;

pub use events::LifecycleEvent;
pub use mock::MockHypervisor;

/// Domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainState {
    /// No state.
    NoState,
    /// Running.
    Running,
    /// Blocked on a resource.
    Blocked,
    /// Paused by the user.
    Paused,
    /// Being shut down.
    Shutdown,
    /// Powered off.
    Shutoff,
    /// Crashed.
    Crashed,
    /// Suspended by guest power management.
    PmSuspended,
}

impl From<DomainState> for GuestState {
    fn from(state: DomainState) -> Self {
        match state {
            DomainState::NoState => GuestState::NoState,
            DomainState::Running => GuestState::Running,
            DomainState::Blocked => GuestState::Blocked,
            DomainState::Paused => GuestState::Paused,
            DomainState::Shutdown => GuestState::Shutdown,
            DomainState::Shutoff => GuestState::Shutoff,
            DomainState::Crashed => GuestState::Crashed,
            DomainState::PmSuspended => GuestState::PmSuspended,
        }
    }
}

/// One guest as seen by a single enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    /// Stable identifier.
    pub uuid: String,
    /// Domain name.
    pub name: String,
    /// Hypervisor state.
    pub state: DomainState,
    /// Whether the guest is running (in any sub-state).
    pub active: bool,
    /// Virtual CPUs.
    pub cpu_count: u32,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_time_ns: u64,
    /// Memory ceiling in KiB.
    pub max_memory_kib: u64,
    /// Current memory in KiB.
    pub memory_kib: u64,
}

/// Cumulative counters of one guest network interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

/// Cumulative counters of one guest block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub rd_req: u64,
    pub rd_bytes: u64,
    pub wr_req: u64,
    pub wr_bytes: u64,
}

/// A disk in a guest's persisted configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    /// Target device name (e.g. `vda`).
    pub target: String,
    /// Backing image path, as given to the storage backend.
    pub source: PathBuf,
    /// Explicit boot order, if any.
    pub boot_order: Option<u32>,
}

/// Pick the boot disk from a device list.
///
/// Lowest explicit boot order wins; without one, `vda`; otherwise the first
/// disk.
pub fn boot_disk(disks: &[DiskDevice]) -> Option<&DiskDevice> {
    disks
        .iter()
        .filter(|d| d.boot_order.is_some())
        .min_by_key(|d| d.boot_order)
        .or_else(|| disks.iter().find(|d| d.target == "vda"))
        .or_else(|| disks.first())
}

/// Block I/O throttling applied by a quota instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct BlockIoTune {
    pub total_bytes_sec: u64,
    pub read_bytes_sec: u64,
    pub write_bytes_sec: u64,
    pub total_iops_sec: u64,
    pub read_iops_sec: u64,
    pub write_iops_sec: u64,
}

/// Migration flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MigrateFlags(u32);

impl MigrateFlags {
    /// Transfer while the guest runs.
    pub const LIVE: MigrateFlags = MigrateFlags(1);
    /// Hypervisors talk to each other directly.
    pub const PEER2PEER: MigrateFlags = MigrateFlags(2);
    /// Tunnel data through the hypervisor connection.
    pub const TUNNELLED: MigrateFlags = MigrateFlags(4);
    /// Persist the guest on the destination.
    pub const PERSIST_DEST: MigrateFlags = MigrateFlags(8);
    /// Remove the definition from the source.
    pub const UNDEFINE_SOURCE: MigrateFlags = MigrateFlags(16);
    /// Copy disk contents as part of the transfer.
    pub const NON_SHARED_DISK: MigrateFlags = MigrateFlags(64);
    /// Move the definition only.
    pub const OFFLINE: MigrateFlags = MigrateFlags(1024);

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: MigrateFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MigrateFlags {
    type Output = MigrateFlags;

    fn bitor(self, rhs: MigrateFlags) -> MigrateFlags {
        MigrateFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for MigrateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::LIVE, "LIVE"),
            (Self::PEER2PEER, "PEER2PEER"),
            (Self::TUNNELLED, "TUNNELLED"),
            (Self::PERSIST_DEST, "PERSIST_DEST"),
            (Self::UNDEFINE_SOURCE, "UNDEFINE_SOURCE"),
            (Self::NON_SHARED_DISK, "NON_SHARED_DISK"),
            (Self::OFFLINE, "OFFLINE"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "MigrateFlags({})", names.join(" | "))
    }
}

/// Receives domain lifecycle events.
pub type LifecycleCallback = Box<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Operations the agent performs against the virtualization library.
///
/// All calls are blocking. A `false`/failed return from the library is an
/// [`Error::Hypervisor`]; no compensating rollback is attempted.
pub trait Hypervisor: Send + Sync {
    /// Enumerate every defined guest.
    fn list_guests(&self) -> Result<Vec<GuestInfo>>;

    /// Define a guest from its XML description. Returns its UUID.
    fn define(&self, xml: &str) -> Result<String>;

    /// Remove a guest definition.
    fn undefine(&self, uuid: &str) -> Result<()>;

    /// Start a defined guest.
    fn start(&self, uuid: &str) -> Result<()>;

    /// Whether the guest starts with the hypervisor service.
    fn set_autostart(&self, uuid: &str, enabled: bool) -> Result<()>;

    /// Request a graceful shutdown.
    fn shutdown(&self, uuid: &str) -> Result<()>;

    /// Power off immediately.
    fn destroy(&self, uuid: &str) -> Result<()>;

    /// Request a graceful reboot.
    fn reboot(&self, uuid: &str) -> Result<()>;

    /// Hard reset.
    fn reset(&self, uuid: &str) -> Result<()>;

    /// Pause execution.
    fn suspend(&self, uuid: &str) -> Result<()>;

    /// Resume execution.
    fn resume(&self, uuid: &str) -> Result<()>;

    /// Set a guest account's password through the guest agent.
    fn set_user_password(&self, uuid: &str, user: &str, password: &str) -> Result<()>;

    /// Attach a device described by `xml`, live and persistently.
    fn attach_device(&self, uuid: &str, xml: &str) -> Result<()>;

    /// Detach a device described by `xml`, live and persistently.
    fn detach_device(&self, uuid: &str, xml: &str) -> Result<()>;

    /// Disks from the guest's persisted configuration.
    fn disk_devices(&self, uuid: &str) -> Result<Vec<DiskDevice>>;

    /// Host-side names of the guest's network interfaces.
    fn interfaces(&self, uuid: &str) -> Result<Vec<String>>;

    /// Grow an attached disk while the guest runs.
    fn block_resize(&self, uuid: &str, device: &str, size: u64) -> Result<()>;

    /// Apply I/O throttling to an attached disk.
    fn set_block_io_tune(&self, uuid: &str, device: &str, tune: &BlockIoTune) -> Result<()>;

    /// Cap an interface's inbound and outbound average rate in KiB/s.
    fn set_interface_bandwidth(&self, uuid: &str, interface: &str, kib_per_sec: u64)
        -> Result<()>;

    /// Change the virtual CPU count.
    fn set_vcpus(&self, uuid: &str, count: u32) -> Result<()>;

    /// Change the memory size in KiB.
    fn set_memory(&self, uuid: &str, kib: u64) -> Result<()>;

    /// Migrate to the hypervisor at `uri`.
    fn migrate(&self, uuid: &str, uri: &str, flags: MigrateFlags) -> Result<()>;

    /// Create a snapshot. Returns the snapshot name.
    fn snapshot_create(&self, uuid: &str, xml: &str) -> Result<String>;

    /// Delete a snapshot.
    fn snapshot_delete(&self, uuid: &str, snapshot: &str) -> Result<()>;

    /// Revert the guest to a snapshot.
    fn snapshot_revert(&self, uuid: &str, snapshot: &str) -> Result<()>;

    /// Counters of one interface.
    fn interface_stats(&self, uuid: &str, interface: &str) -> Result<InterfaceStats>;

    /// Counters of one disk.
    fn block_stats(&self, uuid: &str, device: &str) -> Result<BlockStats>;

    /// Hand the library the event loop it should register with.
    fn register_event_impl(&self, event_loop: Arc<dyn EventLoopImpl>) -> Result<()>;

    /// Subscribe to domain lifecycle events.
    fn register_lifecycle_callback(&self, callback: LifecycleCallback) -> Result<()>;
}

/// A point-in-time enumeration of guests keyed by UUID.
#[derive(Debug, Clone, Default)]
pub struct DomainMapping {
    guests: HashMap<String, GuestInfo>,
}

impl DomainMapping {
    /// Enumerate the hypervisor's guests now.
    pub fn refresh(hypervisor: &dyn Hypervisor) -> Result<Self> {
        let guests = hypervisor
            .list_guests()?
            .into_iter()
            .map(|g| (g.uuid.clone(), g))
            .collect();
        Ok(Self { guests })
    }

    /// Look up a guest.
    ///
    /// # Errors
    ///
    /// [`Error::GuestNotFound`] if `uuid` was not part of this enumeration.
    pub fn get(&self, uuid: &str) -> Result<&GuestInfo> {
        self.guests
            .get(uuid)
            .ok_or_else(|| Error::GuestNotFound(uuid.to_string()))
    }

    /// Whether `uuid` was part of this enumeration.
    pub fn contains(&self, uuid: &str) -> bool {
        self.guests.contains_key(uuid)
    }

    /// Guests in no particular order.
    pub fn guests(&self) -> impl Iterator<Item = &GuestInfo> {
        self.guests.values()
    }

    /// Number of guests.
    pub fn len(&self) -> usize {
        self.guests.len()
    }

    /// Whether no guests are defined.
    pub fn is_empty(&self) -> bool {
        self.guests.is_empty()
    }
}
