//! Disk and template image handlers.

use super::instruction::Attachment;
use super::Context;
use crate::error::Result;
use crate::hypervisor::{BlockIoTune, DomainMapping};
use crate::storage::{live_resize_units, StorageTarget};
use serde_json::Value;

pub fn create(ctx: &Context, image: &StorageTarget, size: u64) -> Result<Value> {
    ctx.stores.store_for(image)?.make_image(&image.path, size)?;
    tracing::info!(path = %image.path.display(), mode = %image.mode, size_gib = size, "disk created");
    Ok(Value::Null)
}

/// Grow a disk.
///
/// A disk attached to a running guest is resized live by the hypervisor,
/// after which `quota` (if any) is applied again. Otherwise the image is
/// resized through the storage backend.
pub fn resize(
    ctx: &Context,
    image: &StorageTarget,
    size: u64,
    attachment: Option<&Attachment>,
    quota: Option<&BlockIoTune>,
) -> Result<Value> {
    if let Some(attachment) = attachment {
        if is_attached_to_running_guest(ctx, attachment)? {
            ctx.hypervisor.block_resize(
                &attachment.guest_uuid,
                &attachment.device,
                live_resize_units(size),
            )?;
            if let Some(quota) = quota {
                ctx.hypervisor
                    .set_block_io_tune(&attachment.guest_uuid, &attachment.device, quota)?;
            }
            tracing::info!(
                uuid = %attachment.guest_uuid,
                device = %attachment.device,
                size,
                "disk resized online"
            );
            return Ok(Value::Null);
        }
    }

    ctx.stores.store_for(image)?.resize_image(&image.path, size)?;
    tracing::info!(path = %image.path.display(), size_gib = size, "disk resized offline");
    Ok(Value::Null)
}

fn is_attached_to_running_guest(ctx: &Context, attachment: &Attachment) -> Result<bool> {
    let mapping = DomainMapping::refresh(ctx.hypervisor.as_ref())?;
    if !mapping.get(&attachment.guest_uuid)?.active {
        return Ok(false);
    }
    Ok(ctx
        .hypervisor
        .disk_devices(&attachment.guest_uuid)?
        .iter()
        .any(|d| d.target == attachment.device))
}

/// Delete a disk or template image. Absent images are not an error.
pub fn delete(ctx: &Context, image: &StorageTarget) -> Result<Value> {
    ctx.stores.store_for(image)?.delete_image(&image.path)?;
    Ok(Value::Null)
}

pub fn quota(ctx: &Context, attachment: &Attachment, quota: &BlockIoTune) -> Result<Value> {
    ctx.hypervisor
        .set_block_io_tune(&attachment.guest_uuid, &attachment.device, quota)?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{context, Fixture};
    use crate::hypervisor::{DiskDevice, DomainState};
    use std::path::PathBuf;

    fn attached(fx: &Fixture, state: DomainState) -> Attachment {
        fx.hv.add_guest("g", state);
        fx.hv.set_disks(
            "g",
            vec![DiskDevice {
                target: "vdb".to_string(),
                source: PathBuf::from("/data/b.qcow2"),
                boot_order: None,
            }],
        );
        Attachment {
            guest_uuid: "g".to_string(),
            device: "vdb".to_string(),
        }
    }

    #[test]
    fn test_online_resize_scales_size_and_reapplies_quota() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        let attachment = attached(&fx, DomainState::Running);
        let quota = BlockIoTune {
            total_iops_sec: 300,
            ..Default::default()
        };

        resize(
            &ctx,
            &StorageTarget::local("/data/b.qcow2"),
            5,
            Some(&attachment),
            Some(&quota),
        )
        .unwrap();

        assert_eq!(
            fx.hv.calls(),
            [
                "block_resize g vdb 5242880",
                "set_block_io_tune g vdb total_bytes_sec=0 total_iops_sec=300",
            ]
        );
        assert!(fx.tool_args().is_empty());
    }

    #[test]
    fn test_stopped_guest_resizes_through_storage() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        let attachment = attached(&fx, DomainState::Shutoff);

        resize(&ctx, &StorageTarget::local("/data/b.qcow2"), 5, Some(&attachment), None).unwrap();

        assert!(fx.hv.calls().is_empty());
        assert_eq!(fx.tool_args(), ["resize -f qcow2 /data/b.qcow2 5G"]);
    }

    #[test]
    fn test_detached_device_resizes_through_storage() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        let mut attachment = attached(&fx, DomainState::Running);
        attachment.device = "vdc".to_string();

        resize(&ctx, &StorageTarget::local("/data/c.qcow2"), 8, Some(&attachment), None).unwrap();
        assert_eq!(fx.tool_args(), ["resize -f qcow2 /data/c.qcow2 8G"]);
    }

    #[test]
    fn test_create_makes_parent_directory() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        let path = fx.dir.path().join("pool/a.qcow2");

        create(&ctx, &StorageTarget::local(&path), 10).unwrap();
        assert!(fx.dir.path().join("pool").is_dir());
        assert_eq!(fx.tool_args(), [format!("create -f qcow2 {} 10G", path.display())]);
    }

    #[test]
    fn test_delete_missing_image_succeeds() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        delete(&ctx, &StorageTarget::local(fx.dir.path().join("absent.qcow2"))).unwrap();
    }
}
