//! Message types for virtnode agent / controller communication.
//!
//! The controller publishes instructions on a bus channel and the agent
//! publishes events back on another. Both directions carry JSON objects.
//!
//! # Instruction
//!
//! ```text
//! {
//!   "_object": "disk",            // target kind
//!   "action": "create",           // verb
//!   "uuid": "...",                // absent for create/global
//!   "node_id": 1234,              // optional, filters the target agent
//!   "passback_parameters": {...}, // echoed verbatim in the response
//!   ...                           // kind-specific fields
//! }
//! ```
//!
//! # Event envelope
//!
//! ```text
//! {"kind": 3, "type": 0, "timestamp": 1700000000, "host": "...", "node_id": 1234, "message": {...}}
//! ```

#![deny(missing_docs)]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Liveness probe sent by the controller.
pub const PING: &str = "ping";

/// Liveness answer published by the agent.
pub const PONG: &str = "pong";

// ============================================================================
// Instruction addressing
// ============================================================================

/// Kind of object an instruction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A virtual machine.
    Guest,
    /// A disk image, attached or not.
    Disk,
    /// A guest snapshot.
    Snapshot,
    /// An operating system template image.
    OsTemplateImage,
    /// Host-wide operations with no target UUID.
    Global,
}

impl ObjectKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Guest => "guest",
            ObjectKind::Disk => "disk",
            ObjectKind::Snapshot => "snapshot",
            ObjectKind::OsTemplateImage => "os_template_image",
            ObjectKind::Global => "global",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(ObjectKind::Guest),
            "disk" => Ok(ObjectKind::Disk),
            "snapshot" => Ok(ObjectKind::Snapshot),
            "os_template_image" => Ok(ObjectKind::OsTemplateImage),
            "global" => Ok(ObjectKind::Global),
            other => Err(format!("unknown object kind '{}'", other)),
        }
    }
}

/// Instruction verb.
///
/// Not every verb is valid for every [`ObjectKind`]; the agent validates the
/// pair before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Create the target.
    Create,
    /// Start a defined guest.
    Boot,
    /// Graceful reboot.
    Reboot,
    /// Hard reset.
    ForceReboot,
    /// ACPI shutdown.
    Shutdown,
    /// Hard power off.
    ForceShutdown,
    /// Pause vCPUs.
    Suspend,
    /// Resume vCPUs.
    Resume,
    /// Delete the target.
    Delete,
    /// Set a guest user's password.
    ResetPassword,
    /// Attach a disk to a guest.
    AttachDisk,
    /// Detach a disk from a guest.
    DetachDisk,
    /// Move a guest to another host.
    Migrate,
    /// Grow a disk.
    Resize,
    /// Set disk I/O limits.
    Quota,
    /// Set guest network bandwidth.
    AllocateBandwidth,
    /// Change guest vCPU / memory allocation.
    AdjustAbility,
    /// Revert a guest to a snapshot.
    Revert,
    /// Convert a snapshot into a template image.
    Convert,
    /// Emit a fresh guest state report.
    RefreshGuestState,
}

impl Action {
    /// Every known action, in wire-name order of declaration.
    pub const ALL: [Action; 20] = [
        Action::Create,
        Action::Boot,
        Action::Reboot,
        Action::ForceReboot,
        Action::Shutdown,
        Action::ForceShutdown,
        Action::Suspend,
        Action::Resume,
        Action::Delete,
        Action::ResetPassword,
        Action::AttachDisk,
        Action::DetachDisk,
        Action::Migrate,
        Action::Resize,
        Action::Quota,
        Action::AllocateBandwidth,
        Action::AdjustAbility,
        Action::Revert,
        Action::Convert,
        Action::RefreshGuestState,
    ];

    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Boot => "boot",
            Action::Reboot => "reboot",
            Action::ForceReboot => "force_reboot",
            Action::Shutdown => "shutdown",
            Action::ForceShutdown => "force_shutdown",
            Action::Suspend => "suspend",
            Action::Resume => "resume",
            Action::Delete => "delete",
            Action::ResetPassword => "reset_password",
            Action::AttachDisk => "attach_disk",
            Action::DetachDisk => "detach_disk",
            Action::Migrate => "migrate",
            Action::Resize => "resize",
            Action::Quota => "quota",
            Action::AllocateBandwidth => "allocate_bandwidth",
            Action::AdjustAbility => "adjust_ability",
            Action::Revert => "revert",
            Action::Convert => "convert",
            Action::RefreshGuestState => "refresh_guest_state",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action '{}'", s))
    }
}

/// Disk-image storage transport.
///
/// Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StorageMode {
    /// Local filesystem.
    Local = 0,
    /// Network filesystem mounted at the same path on every host.
    SharedMount = 1,
    /// Ceph RBD block store.
    Ceph = 2,
    /// GlusterFS volume.
    GlusterFs = 3,
}

impl StorageMode {
    /// Whether disk images are visible from every host without copying.
    pub fn is_shared(&self) -> bool {
        !matches!(self, StorageMode::Local)
    }
}

impl TryFrom<u8> for StorageMode {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(StorageMode::Local),
            1 => Ok(StorageMode::SharedMount),
            2 => Ok(StorageMode::Ceph),
            3 => Ok(StorageMode::GlusterFs),
            other => Err(format!("unknown storage mode {}", other)),
        }
    }
}

impl From<StorageMode> for u8 {
    fn from(mode: StorageMode) -> u8 {
        mode as u8
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageMode::Local => "local",
            StorageMode::SharedMount => "shared_mount",
            StorageMode::Ceph => "ceph",
            StorageMode::GlusterFs => "glusterfs",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Inbound instruction
// ============================================================================

/// An instruction as it arrives on the bus, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInstruction {
    /// Target kind (`_object` on the wire).
    #[serde(rename = "_object", default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,

    /// Verb.
    #[serde(default)]
    pub action: String,

    /// Target UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Agent the instruction is addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Value>,

    /// Opaque caller token, echoed in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passback_parameters: Option<Value>,

    /// Kind-specific payload.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawInstruction {
    /// Parse a bus payload.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Whether this is a liveness probe.
    pub fn is_ping(&self) -> bool {
        self.object.is_none() && self.action == PING
    }

    /// Whether this is a liveness answer (ours or another agent's).
    pub fn is_pong(&self) -> bool {
        self.object.is_none() && self.action == PONG
    }

    /// Whether the instruction is addressed to `node_id`.
    ///
    /// Instructions without a `node_id` are addressed to every agent.
    /// Numeric and string encodings of the id are both accepted.
    pub fn is_for_node(&self, node_id: u64) -> bool {
        match &self.node_id {
            None | Some(Value::Null) => true,
            Some(Value::Number(n)) => n.as_u64() == Some(node_id),
            Some(Value::String(s)) => s.parse::<u64>().ok() == Some(node_id),
            Some(_) => false,
        }
    }

    /// Decode a kind-specific field.
    ///
    /// Returns `None` when the field is absent; `Some(Err)` when present but
    /// of the wrong shape.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Option<Result<T, serde_json::Error>> {
        self.fields
            .get(name)
            .map(|v| serde_json::from_value(v.clone()))
    }
}

/// Liveness answer payload.
pub fn pong() -> Value {
    serde_json::json!({ "action": PONG })
}

// ============================================================================
// Outbound events
// ============================================================================

/// Top-level event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EmitKind {
    /// Log line for the operator.
    Log = 0,
    /// Guest state / lifecycle change.
    GuestEvent = 1,
    /// Host heartbeat.
    HostEvent = 2,
    /// Instruction acknowledgment.
    Response = 3,
    /// Guest performance batch.
    GuestCollectionPerformance = 4,
    /// Host performance batch.
    HostCollectionPerformance = 5,
}

/// Severity of a [`EmitKind::Log`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable.
    Critical = 0,
    /// Operation failed.
    Error = 1,
    /// Degraded.
    Warn = 2,
    /// Informational.
    Info = 3,
    /// Diagnostic.
    Debug = 4,
}

/// Host event subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostEvent {
    /// Periodic liveness + capacity report.
    Heartbeat = 0,
}

/// Guest performance batch categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GuestPerfKind {
    /// CPU load and memory.
    CpuMemory = 0,
    /// Per-interface traffic rates.
    Traffic = 1,
    /// Per-disk I/O rates.
    DiskIo = 2,
}

/// Host performance batch categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostPerfKind {
    /// CPU load and memory.
    CpuMemory = 0,
    /// Per-interface traffic rates.
    Traffic = 1,
    /// Per-mount usage plus per-device I/O rates.
    DiskUsageIo = 2,
}

/// Guest state codes reported to the controller.
///
/// Codes 1-8 are observed hypervisor states; the rest are agent-side
/// transitional states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GuestState {
    /// State unknown.
    NoState = 0,
    /// Starting up.
    Booting = 1,
    /// Running.
    Running = 2,
    /// Blocked on a resource.
    Blocked = 3,
    /// Paused.
    Paused = 4,
    /// Shutting down.
    Shutdown = 5,
    /// Powered off.
    Shutoff = 6,
    /// Crashed.
    Crashed = 7,
    /// Suspended by power management.
    PmSuspended = 8,
    /// Migration in progress.
    Migrating = 9,
    /// Configuration change in progress.
    Update = 10,
    /// Creation in progress.
    Creating = 11,
    /// Snapshot conversion in progress.
    SnapshotConverting = 12,
    /// Left in an inconsistent state by a failed operation.
    Dirty = 255,
}

impl GuestState {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the state is an agent-side transitional state.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            GuestState::Migrating
                | GuestState::Update
                | GuestState::Creating
                | GuestState::SnapshotConverting
        )
    }
}

/// Event envelope published on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// [`EmitKind`] code.
    pub kind: u8,
    /// Subtype code within the kind.
    #[serde(rename = "type")]
    pub subtype: u8,
    /// Unix seconds.
    pub timestamp: u64,
    /// Reporting host name.
    pub host: String,
    /// Reporting agent's node id.
    pub node_id: u64,
    /// Kind-specific body.
    pub message: Value,
}

/// Body of an [`EmitKind::Response`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Target kind of the acknowledged instruction.
    #[serde(rename = "_object")]
    pub object: String,
    /// Action of the acknowledged instruction.
    pub action: String,
    /// Target UUID, `"unknown"` when the instruction was unparseable.
    pub uuid: String,
    /// `true` on success.
    pub state: bool,
    /// Operation-specific result.
    #[serde(default)]
    pub data: Value,
    /// Echoed caller token.
    #[serde(default)]
    pub passback_parameters: Value,
}

/// Placeholder used when an inbound field could not be recovered.
pub const UNKNOWN: &str = "unknown";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_instruction_parses_wire_names() {
        let raw = RawInstruction::from_value(json!({
            "_object": "disk",
            "action": "create",
            "storage_mode": 0,
            "image_path": "/data/a.qcow2",
            "size": 10,
            "passback_parameters": {"token": 7}
        }))
        .unwrap();

        assert_eq!(raw.object.as_deref(), Some("disk"));
        assert_eq!(raw.action, "create");
        assert!(raw.uuid.is_none());
        assert_eq!(raw.passback_parameters, Some(json!({"token": 7})));

        let mode: StorageMode = raw.field("storage_mode").unwrap().unwrap();
        assert_eq!(mode, StorageMode::Local);
        let size: u64 = raw.field("size").unwrap().unwrap();
        assert_eq!(size, 10);
        assert!(raw.field::<u64>("missing").is_none());
    }

    #[test]
    fn test_ping_pong_detection() {
        let ping = RawInstruction::from_value(json!({"action": "ping"})).unwrap();
        assert!(ping.is_ping());
        assert!(!ping.is_pong());

        let pong = RawInstruction::from_value(pong()).unwrap();
        assert!(pong.is_pong());

        // An object-scoped action named "ping" is not a liveness probe.
        let scoped = RawInstruction::from_value(json!({"_object": "guest", "action": "ping"})).unwrap();
        assert!(!scoped.is_ping());
    }

    #[test]
    fn test_node_filter_accepts_number_and_string() {
        let mut raw = RawInstruction::default();
        assert!(raw.is_for_node(42));

        raw.node_id = Some(json!(42));
        assert!(raw.is_for_node(42));
        assert!(!raw.is_for_node(43));

        raw.node_id = Some(json!("42"));
        assert!(raw.is_for_node(42));
    }

    #[test]
    fn test_action_names_are_unique() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("explode".parse::<Action>().is_err());
    }

    #[test]
    fn test_storage_mode_rejects_unknown_code() {
        assert!(serde_json::from_value::<StorageMode>(json!(9)).is_err());
        assert_eq!(serde_json::to_value(StorageMode::GlusterFs).unwrap(), json!(3));
        assert!(StorageMode::Ceph.is_shared());
        assert!(!StorageMode::Local.is_shared());
    }

    #[test]
    fn test_guest_state_codes() {
        assert_eq!(GuestState::Running.code(), 2);
        assert_eq!(GuestState::Dirty.code(), 255);
        assert!(GuestState::Creating.is_transitional());
        assert!(!GuestState::Shutoff.is_transitional());
    }
}
