//! Typed instructions.
//!
//! A [`RawInstruction`] is checked once against its `(ObjectKind, Action)`
//! pair and turned into an [`Instruction`]. Handlers never look at wire
//! field names.

use crate::error::{Error, Result};
use crate::hypervisor::BlockIoTune;
use crate::storage::{StorageMode, StorageTarget};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use virtnode_protocol::{Action, ObjectKind, RawInstruction};

/// Where an instruction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// On the dispatch loop; acknowledged by the loop.
    Inline,
    /// On a worker; acknowledged by the worker.
    Offloaded,
}

/// Guest power operations that need nothing but the UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    Boot,
    Reboot,
    ForceReboot,
    Shutdown,
    ForceShutdown,
    Suspend,
    Resume,
}

/// A data disk created alongside a new guest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataDisk {
    /// Logical image path.
    pub image_path: PathBuf,
    /// Size in GiB.
    pub size: u64,
}

/// Everything needed to build a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSpec {
    /// UUID announced by the controller, if any. Must match the definition.
    pub uuid: Option<String>,
    /// Domain XML.
    pub xml: String,
    /// Storage mode and volume of every image below.
    pub mode: StorageMode,
    pub volume: Option<String>,
    /// Template the system image is layered on.
    pub template_path: PathBuf,
    /// System image to create.
    pub system_image_path: PathBuf,
    /// Additional empty disks.
    pub data_disks: Vec<DataDisk>,
}

/// A disk attached to a running guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Guest the disk is attached to.
    pub guest_uuid: String,
    /// Target device inside the guest (e.g. `vdb`).
    pub device: String,
}

/// A validated instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    CreateGuest(GuestSpec),
    Power {
        uuid: String,
        op: PowerOp,
    },
    DeleteGuest {
        uuid: String,
        mode: StorageMode,
        volume: Option<String>,
    },
    ResetPassword {
        uuid: String,
        user: String,
        password: String,
    },
    AttachDisk {
        uuid: String,
        xml: String,
    },
    DetachDisk {
        uuid: String,
        xml: String,
    },
    Migrate {
        uuid: String,
        destination: String,
        mode: StorageMode,
        volume: Option<String>,
    },
    /// Bandwidth in bits per second, applied to every interface.
    AllocateBandwidth {
        uuid: String,
        bandwidth: u64,
    },
    AdjustAbility {
        uuid: String,
        cpu: Option<u32>,
        memory_mib: Option<u64>,
    },
    CreateDisk {
        image: StorageTarget,
        size: u64,
    },
    ResizeDisk {
        image: StorageTarget,
        size: u64,
        attachment: Option<Attachment>,
        quota: Option<BlockIoTune>,
    },
    DeleteDisk {
        image: StorageTarget,
    },
    QuotaDisk {
        attachment: Attachment,
        quota: BlockIoTune,
    },
    CreateSnapshot {
        uuid: String,
        xml: Option<String>,
    },
    DeleteSnapshot {
        uuid: String,
        snapshot: String,
    },
    RevertSnapshot {
        uuid: String,
        snapshot: String,
    },
    ConvertSnapshot {
        uuid: String,
        snapshot: String,
        template: StorageTarget,
    },
    DeleteTemplate {
        image: StorageTarget,
    },
    RefreshGuestState,
}

impl Instruction {
    /// Validate the fields of `raw` for its `(_object, action)` pair.
    pub fn parse(raw: &RawInstruction) -> Result<Self> {
        let object = raw
            .object
            .as_deref()
            .ok_or_else(|| Error::validation("missing '_object'"))?;
        let kind: ObjectKind = object.parse().map_err(Error::Validation)?;
        let action: Action = raw.action.parse().map_err(Error::Validation)?;
        let f = Fields { raw, kind, action };

        let instruction = match (kind, action) {
            (ObjectKind::Guest, Action::Create) => Instruction::CreateGuest(GuestSpec {
                uuid: raw.uuid.clone(),
                xml: f.required("xml")?,
                mode: f.required("storage_mode")?,
                volume: f.optional("dfs_volume")?,
                template_path: f.required("template_path")?,
                system_image_path: f.required("system_image_path")?,
                data_disks: f.optional("data_disks")?.unwrap_or_default(),
            }),
            (ObjectKind::Guest, Action::Boot) => f.power(PowerOp::Boot)?,
            (ObjectKind::Guest, Action::Reboot) => f.power(PowerOp::Reboot)?,
            (ObjectKind::Guest, Action::ForceReboot) => f.power(PowerOp::ForceReboot)?,
            (ObjectKind::Guest, Action::Shutdown) => f.power(PowerOp::Shutdown)?,
            (ObjectKind::Guest, Action::ForceShutdown) => f.power(PowerOp::ForceShutdown)?,
            (ObjectKind::Guest, Action::Suspend) => f.power(PowerOp::Suspend)?,
            (ObjectKind::Guest, Action::Resume) => f.power(PowerOp::Resume)?,
            (ObjectKind::Guest, Action::Delete) => Instruction::DeleteGuest {
                uuid: f.uuid()?,
                mode: f.required("storage_mode")?,
                volume: f.optional("dfs_volume")?,
            },
            (ObjectKind::Guest, Action::ResetPassword) => Instruction::ResetPassword {
                uuid: f.uuid()?,
                user: f.required("user")?,
                password: f.required("password")?,
            },
            (ObjectKind::Guest, Action::AttachDisk) => Instruction::AttachDisk {
                uuid: f.uuid()?,
                xml: f.required("xml")?,
            },
            (ObjectKind::Guest, Action::DetachDisk) => Instruction::DetachDisk {
                uuid: f.uuid()?,
                xml: f.required("xml")?,
            },
            (ObjectKind::Guest, Action::Migrate) => Instruction::Migrate {
                uuid: f.uuid()?,
                destination: f.required("duri")?,
                mode: f.required("storage_mode")?,
                volume: f.optional("dfs_volume")?,
            },
            (ObjectKind::Guest, Action::AllocateBandwidth) => Instruction::AllocateBandwidth {
                uuid: f.uuid()?,
                bandwidth: f.required("bandwidth")?,
            },
            (ObjectKind::Guest, Action::AdjustAbility) => {
                let cpu = f.optional("cpu")?;
                let memory_mib = f.optional("memory")?;
                if cpu.is_none() && memory_mib.is_none() {
                    return Err(f.invalid("needs 'cpu' or 'memory'"));
                }
                Instruction::AdjustAbility {
                    uuid: f.uuid()?,
                    cpu,
                    memory_mib,
                }
            }
            (ObjectKind::Disk, Action::Create) => Instruction::CreateDisk {
                image: f.target("image_path")?,
                size: f.required("size")?,
            },
            (ObjectKind::Disk, Action::Resize) => Instruction::ResizeDisk {
                image: f.target("image_path")?,
                size: f.required("size")?,
                attachment: f.attachment()?,
                quota: f.optional("quota")?,
            },
            (ObjectKind::Disk, Action::Delete) => Instruction::DeleteDisk {
                image: f.target("image_path")?,
            },
            (ObjectKind::Disk, Action::Quota) => Instruction::QuotaDisk {
                attachment: f
                    .attachment()?
                    .ok_or_else(|| f.invalid("needs 'guest_uuid' and 'device'"))?,
                quota: serde_json::from_value(serde_json::Value::Object(raw.fields.clone()))
                    .map_err(|e| f.invalid(&e.to_string()))?,
            },
            (ObjectKind::Snapshot, Action::Create) => Instruction::CreateSnapshot {
                uuid: f.uuid()?,
                xml: f.optional("xml")?,
            },
            (ObjectKind::Snapshot, Action::Delete) => Instruction::DeleteSnapshot {
                uuid: f.uuid()?,
                snapshot: f.required("snapshot_id")?,
            },
            (ObjectKind::Snapshot, Action::Revert) => Instruction::RevertSnapshot {
                uuid: f.uuid()?,
                snapshot: f.required("snapshot_id")?,
            },
            (ObjectKind::Snapshot, Action::Convert) => Instruction::ConvertSnapshot {
                uuid: f.uuid()?,
                snapshot: f.required("snapshot_id")?,
                template: f.target("template_path")?,
            },
            (ObjectKind::OsTemplateImage, Action::Delete) => Instruction::DeleteTemplate {
                image: f.target("template_path")?,
            },
            (ObjectKind::Global, Action::RefreshGuestState) => Instruction::RefreshGuestState,
            _ => return Err(f.invalid("unsupported combination")),
        };
        Ok(instruction)
    }

    /// Where the instruction runs.
    pub fn policy(&self) -> Policy {
        match self {
            Instruction::CreateGuest(_)
            | Instruction::Migrate { .. }
            | Instruction::AllocateBandwidth { .. }
            | Instruction::AdjustAbility { .. }
            | Instruction::CreateSnapshot { .. }
            | Instruction::DeleteSnapshot { .. }
            | Instruction::RevertSnapshot { .. }
            | Instruction::ConvertSnapshot { .. } => Policy::Offloaded,
            _ => Policy::Inline,
        }
    }

    /// Guest that must exist before the instruction runs.
    pub fn guest_uuid(&self) -> Option<&str> {
        match self {
            Instruction::Power { uuid, .. }
            | Instruction::DeleteGuest { uuid, .. }
            | Instruction::ResetPassword { uuid, .. }
            | Instruction::AttachDisk { uuid, .. }
            | Instruction::DetachDisk { uuid, .. }
            | Instruction::Migrate { uuid, .. }
            | Instruction::AllocateBandwidth { uuid, .. }
            | Instruction::AdjustAbility { uuid, .. }
            | Instruction::CreateSnapshot { uuid, .. }
            | Instruction::DeleteSnapshot { uuid, .. }
            | Instruction::RevertSnapshot { uuid, .. }
            | Instruction::ConvertSnapshot { uuid, .. } => Some(uuid),
            Instruction::ResizeDisk { attachment, .. } => {
                attachment.as_ref().map(|a| a.guest_uuid.as_str())
            }
            Instruction::QuotaDisk { attachment, .. } => Some(&attachment.guest_uuid),
            Instruction::CreateGuest(_)
            | Instruction::CreateDisk { .. }
            | Instruction::DeleteDisk { .. }
            | Instruction::DeleteTemplate { .. }
            | Instruction::RefreshGuestState => None,
        }
    }

    /// Whether a missing guest means the work is already done.
    pub fn is_guest_delete(&self) -> bool {
        matches!(self, Instruction::DeleteGuest { .. })
    }
}

/// Field access with errors naming the instruction.
struct Fields<'a> {
    raw: &'a RawInstruction,
    kind: ObjectKind,
    action: Action,
}

impl Fields<'_> {
    fn invalid(&self, msg: &str) -> Error {
        Error::validation(format!("{} {}: {}", self.kind, self.action, msg))
    }

    fn uuid(&self) -> Result<String> {
        self.raw
            .uuid
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| self.invalid("missing 'uuid'"))
    }

    fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.raw.field::<Option<T>>(name) {
            None => Ok(None),
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(self.invalid(&format!("field '{}': {}", name, e))),
        }
    }

    fn required<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.optional(name)?
            .ok_or_else(|| self.invalid(&format!("missing '{}'", name)))
    }

    fn power(&self, op: PowerOp) -> Result<Instruction> {
        Ok(Instruction::Power {
            uuid: self.uuid()?,
            op,
        })
    }

    fn target(&self, path_field: &str) -> Result<StorageTarget> {
        Ok(StorageTarget {
            mode: self.required("storage_mode")?,
            path: self.required(path_field)?,
            volume: self.optional("dfs_volume")?,
        })
    }

    fn attachment(&self) -> Result<Option<Attachment>> {
        let guest_uuid: Option<String> = self.optional("guest_uuid")?;
        let device: Option<String> = self.optional("device")?;
        Ok(match (guest_uuid, device) {
            (Some(guest_uuid), Some(device)) => Some(Attachment { guest_uuid, device }),
            (None, None) => None,
            _ => return Err(self.invalid("'guest_uuid' and 'device' go together")),
        })
    }
}
