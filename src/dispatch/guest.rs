//! Guest lifecycle and configuration handlers.

use super::instruction::{GuestSpec, PowerOp};
use super::Context;
use crate::error::{Error, Result};
use crate::hypervisor::{boot_disk, DomainMapping};
use crate::storage::{ImageStore, StorageMode};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use virtnode_protocol::GuestState;

pub fn power(ctx: &Context, uuid: &str, op: PowerOp) -> Result<Value> {
    let hv = ctx.hypervisor.as_ref();
    match op {
        PowerOp::Boot => hv.start(uuid)?,
        PowerOp::Reboot => hv.reboot(uuid)?,
        PowerOp::ForceReboot => hv.reset(uuid)?,
        PowerOp::Shutdown => hv.shutdown(uuid)?,
        PowerOp::ForceShutdown => hv.destroy(uuid)?,
        PowerOp::Suspend => hv.suspend(uuid)?,
        PowerOp::Resume => hv.resume(uuid)?,
    }
    tracing::info!(uuid = %uuid, op = ?op, "guest power operation done");
    Ok(Value::Null)
}

/// Tear down a guest and delete its system image.
///
/// The image path comes from the guest's own device list, read before the
/// definition is removed.
pub fn delete(ctx: &Context, uuid: &str, mode: StorageMode, volume: Option<&str>) -> Result<Value> {
    let hv = ctx.hypervisor.as_ref();
    let mapping = DomainMapping::refresh(hv)?;
    let guest = mapping.get(uuid)?;

    let disks = hv.disk_devices(uuid)?;
    let system_image = boot_disk(&disks).map(|d| d.source.clone());

    if guest.active {
        hv.destroy(uuid)?;
    }
    hv.undefine(uuid)?;

    match system_image {
        Some(path) => {
            ctx.stores.store(mode, volume)?.delete_image(&path)?;
            tracing::info!(uuid = %uuid, image = %path.display(), "guest deleted");
        }
        None => tracing::warn!(uuid = %uuid, "guest deleted, it had no disks"),
    }
    Ok(Value::Null)
}

pub fn reset_password(ctx: &Context, uuid: &str, user: &str, password: &str) -> Result<Value> {
    ctx.hypervisor.set_user_password(uuid, user, password)?;
    tracing::info!(uuid = %uuid, user = %user, "password reset");
    Ok(Value::Null)
}

pub fn attach_disk(ctx: &Context, uuid: &str, xml: &str) -> Result<Value> {
    ctx.hypervisor.attach_device(uuid, xml)?;
    Ok(Value::Null)
}

pub fn detach_disk(ctx: &Context, uuid: &str, xml: &str) -> Result<Value> {
    ctx.hypervisor.detach_device(uuid, xml)?;
    Ok(Value::Null)
}

/// Cap every interface of the guest at `bandwidth` bits per second.
pub fn allocate_bandwidth(ctx: &Context, uuid: &str, bandwidth: u64) -> Result<Value> {
    let kib_per_sec = bandwidth / 8 / 1024;
    let interfaces = ctx.hypervisor.interfaces(uuid)?;
    for interface in &interfaces {
        ctx.hypervisor
            .set_interface_bandwidth(uuid, interface, kib_per_sec)?;
    }
    tracing::info!(uuid = %uuid, kib_per_sec, interfaces = interfaces.len(), "bandwidth allocated");
    Ok(json!({ "interfaces": interfaces }))
}

pub fn adjust_ability(
    ctx: &Context,
    uuid: &str,
    cpu: Option<u32>,
    memory_mib: Option<u64>,
) -> Result<Value> {
    ctx.announce(GuestState::Update, uuid);
    let result = (|| -> Result<Value> {
        if let Some(cpu) = cpu {
            ctx.hypervisor.set_vcpus(uuid, cpu)?;
        }
        if let Some(memory_mib) = memory_mib {
            ctx.hypervisor.set_memory(uuid, memory_mib * 1024)?;
        }
        Ok(Value::Null)
    })();
    ctx.report_state(uuid);
    result
}

/// Build a guest: system image, data disks, definition, first boot.
///
/// Refused up front while the host load is above the creation limit.
/// Anything created before a failure is removed again. If that cleanup
/// fails too the guest is reported [`GuestState::Dirty`].
pub fn create(ctx: &Context, spec: &GuestSpec) -> Result<Value> {
    ctx.load_gate.admit()?;
    if let Some(uuid) = &spec.uuid {
        ctx.announce(GuestState::Creating, uuid);
    }

    let store = ctx.stores.store(spec.mode, spec.volume.as_deref())?;
    let mut build = Build::new(store.as_ref(), spec);

    match build.run(ctx, spec) {
        Ok(uuid) => {
            tracing::info!(uuid = %uuid, "guest created");
            Ok(json!({ "uuid": uuid }))
        }
        Err(e) => {
            tracing::error!(uuid = ?spec.uuid, error = %e, "guest creation failed, cleaning up");
            let uuid = build.defined.clone().or_else(|| spec.uuid.clone());
            if !build.clean_up(ctx) {
                if let Some(uuid) = uuid {
                    ctx.announce(GuestState::Dirty, &uuid);
                }
            }
            Err(e)
        }
    }
}

/// What a guest build has created so far.
struct Build<'a> {
    store: &'a dyn ImageStore,
    images: Vec<PathBuf>,
    defined: Option<String>,
    base_dir: Option<PathBuf>,
}

impl<'a> Build<'a> {
    fn new(store: &'a dyn ImageStore, spec: &GuestSpec) -> Self {
        // Only a base directory this build creates is ours to remove
        let base_dir = spec
            .system_image_path
            .parent()
            .filter(|_| matches!(spec.mode, StorageMode::Local | StorageMode::SharedMount))
            .filter(|dir| !dir.as_os_str().is_empty() && !dir.exists())
            .map(Path::to_path_buf);

        Self {
            store,
            images: Vec::new(),
            defined: None,
            base_dir,
        }
    }

    fn run(&mut self, ctx: &Context, spec: &GuestSpec) -> Result<String> {
        self.store
            .make_overlay(&spec.system_image_path, &spec.template_path)?;
        self.images.push(spec.system_image_path.clone());

        for disk in &spec.data_disks {
            self.store.make_image(&disk.image_path, disk.size)?;
            self.images.push(disk.image_path.clone());
        }

        let uuid = ctx.hypervisor.define(&spec.xml)?;
        self.defined = Some(uuid.clone());
        if let Some(announced) = &spec.uuid {
            if *announced != uuid {
                return Err(Error::validation(format!(
                    "definition uuid {} does not match instruction uuid {}",
                    uuid, announced
                )));
            }
        }

        ctx.hypervisor.set_autostart(&uuid, false)?;
        ctx.hypervisor.start(&uuid)?;
        Ok(uuid)
    }

    /// Undo the build. Returns `false` if something was left behind.
    fn clean_up(&mut self, ctx: &Context) -> bool {
        let mut clean = true;

        if let Some(uuid) = self.defined.take() {
            if let Err(e) = ctx.hypervisor.undefine(&uuid) {
                tracing::error!(uuid = %uuid, error = %e, "failed to undefine partial guest");
                clean = false;
            }
        }

        for image in self.images.drain(..).rev() {
            if let Err(e) = self.store.delete_image(&image) {
                tracing::error!(image = %image.display(), error = %e, "failed to delete partial image");
                clean = false;
            }
        }

        if let Some(dir) = self.base_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(path = %dir.display(), error = %e, "failed to remove guest directory");
                    clean = false;
                }
            }
        }

        clean
    }
}
