//! Guest migration.
//!
//! How a guest moves depends on whether the destination can already see
//! its disks:
//!
//! | storage | guest    | transfer                                         |
//! |---------|----------|--------------------------------------------------|
//! | local   | running  | live, disks copied; images pre-created remotely  |
//! | local   | stopped  | rejected, there is no copy path                  |
//! | shared  | running  | live, tunnelled peer-to-peer                     |
//! | shared  | stopped  | offline, definition only                         |

use super::Context;
use crate::error::{Error, Result};
use crate::hypervisor::{DiskDevice, DomainMapping, MigrateFlags};
use crate::storage::{ImageStore, StorageMode, GIB};
use serde_json::{json, Value};
use std::path::Path;
use virtnode_protocol::GuestState;

/// Flags for migrating a guest on `mode` storage.
///
/// # Errors
///
/// [`Error::Validation`] for a stopped guest on local storage.
pub fn flags(mode: StorageMode, active: bool) -> Result<MigrateFlags> {
    let keep_on_destination = MigrateFlags::PERSIST_DEST | MigrateFlags::UNDEFINE_SOURCE;

    match (mode.is_shared(), active) {
        (false, true) => Ok(MigrateFlags::LIVE | MigrateFlags::NON_SHARED_DISK | keep_on_destination),
        (false, false) => Err(Error::validation(
            "a stopped guest on local storage cannot be migrated",
        )),
        (true, true) => Ok(MigrateFlags::LIVE
            | MigrateFlags::PEER2PEER
            | MigrateFlags::TUNNELLED
            | keep_on_destination),
        (true, false) => Ok(MigrateFlags::OFFLINE
            | MigrateFlags::PEER2PEER
            | MigrateFlags::TUNNELLED
            | keep_on_destination),
    }
}

/// Host part of a hypervisor URI such as `qemu+ssh://root@node-2:22/system`.
pub fn destination_host(uri: &str) -> Result<&str> {
    let invalid = || Error::validation(format!("cannot find a host in '{}'", uri));

    let (_, rest) = uri.split_once("://").ok_or_else(invalid)?;
    let authority = rest.split('/').next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    if host.is_empty() {
        return Err(invalid());
    }
    Ok(host)
}

pub fn migrate(
    ctx: &Context,
    uuid: &str,
    destination: &str,
    mode: StorageMode,
    volume: Option<&str>,
) -> Result<Value> {
    let mapping = DomainMapping::refresh(ctx.hypervisor.as_ref())?;
    let flags = flags(mode, mapping.get(uuid)?.active)?;

    let copied = if flags.contains(MigrateFlags::NON_SHARED_DISK) {
        let store = ctx.stores.store(mode, volume)?;
        let disks = ctx.hypervisor.disk_devices(uuid)?;
        prepare_destination(ctx, store.as_ref(), destination_host(destination)?, &disks)?;
        Some((store, disks))
    } else {
        None
    };

    ctx.announce(GuestState::Migrating, uuid);
    tracing::info!(uuid = %uuid, destination = %destination, ?flags, "migrating guest");
    if let Err(e) = ctx.hypervisor.migrate(uuid, destination, flags) {
        ctx.report_state(uuid);
        return Err(e);
    }

    // The copies on the destination are now authoritative
    if let Some((store, disks)) = copied {
        for disk in &disks {
            if let Err(e) = store.delete_image(&disk.source) {
                tracing::warn!(uuid = %uuid, image = %disk.source.display(), error = %e, "failed to remove migrated source image");
            }
        }
    }

    tracing::info!(uuid = %uuid, destination = %destination, "guest migrated");
    Ok(json!({ "uuid": uuid, "destination": destination }))
}

/// Create empty images of matching virtual size on `host` for every disk.
fn prepare_destination(
    ctx: &Context,
    store: &dyn ImageStore,
    host: &str,
    disks: &[DiskDevice],
) -> Result<()> {
    for disk in disks {
        let size_gib = store.disk_info(&disk.source)?.virtual_size.div_ceil(GIB).max(1);
        let path = disk.source.display().to_string();

        if let Some(parent) = disk.source.parent().filter(|p| *p != Path::new("")) {
            ctx.remote.run(
                host,
                &["mkdir".to_string(), "-p".to_string(), parent.display().to_string()],
            )?;
        }
        ctx.remote.run(
            host,
            &[
                ctx.qemu_img.display().to_string(),
                "create".to_string(),
                "-f".to_string(),
                "qcow2".to_string(),
                path,
                format!("{}G", size_gib),
            ],
        )?;
        tracing::debug!(host = %host, image = %disk.source.display(), size_gib, "destination image created");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{context, Fixture};
    use crate::hypervisor::DomainState;
    use crate::testutil::fake_tool;

    #[test]
    fn test_flag_selection() {
        let local_live = flags(StorageMode::Local, true).unwrap();
        assert!(local_live.contains(MigrateFlags::LIVE | MigrateFlags::NON_SHARED_DISK));
        assert!(!local_live.contains(MigrateFlags::TUNNELLED));

        assert!(flags(StorageMode::Local, false).unwrap_err().is_validation());

        let shared_live = flags(StorageMode::GlusterFs, true).unwrap();
        assert!(shared_live.contains(MigrateFlags::LIVE | MigrateFlags::TUNNELLED));
        assert!(!shared_live.contains(MigrateFlags::NON_SHARED_DISK));

        let shared_offline = flags(StorageMode::SharedMount, false).unwrap();
        assert!(shared_offline.contains(MigrateFlags::OFFLINE | MigrateFlags::PEER2PEER));
        assert!(!shared_offline.contains(MigrateFlags::LIVE));

        for flags in [local_live, shared_live, shared_offline] {
            assert!(flags.contains(MigrateFlags::PERSIST_DEST | MigrateFlags::UNDEFINE_SOURCE));
        }
    }

    #[test]
    fn test_destination_host() {
        assert_eq!(destination_host("qemu+ssh://node-2/system").unwrap(), "node-2");
        assert_eq!(destination_host("qemu+ssh://root@node-2:2222/system").unwrap(), "node-2");
        assert_eq!(destination_host("qemu+tcp://10.0.0.8/system").unwrap(), "10.0.0.8");
        assert!(destination_host("node-2").is_err());
        assert!(destination_host("qemu+ssh:///system").is_err());
    }

    #[test]
    fn test_local_migration_precreates_and_removes_source() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        let image = fx.dir.path().join("guests/a/system.qcow2");
        std::fs::create_dir_all(image.parent().unwrap()).unwrap();
        std::fs::write(&image, b"qcow2").unwrap();
        fake_tool(
            fx.dir.path(),
            r#"echo '{"filename": "x", "format": "qcow2", "virtual-size": 5368709121}'"#,
        );

        fx.hv.add_guest("a", DomainState::Running);
        fx.hv.set_disks(
            "a",
            vec![DiskDevice {
                target: "vda".to_string(),
                source: image.clone(),
                boot_order: None,
            }],
        );

        migrate(&ctx, "a", "qemu+ssh://node-2/system", StorageMode::Local, None).unwrap();

        let remote = fx.remote.commands();
        assert_eq!(remote.len(), 2);
        assert_eq!(remote[0].0, "node-2");
        assert_eq!(remote[0].1[0], "mkdir");
        // Rounded up to whole GiB
        assert_eq!(remote[1].1.last().unwrap(), "6G");

        assert!(fx.hv.calls()[0].contains("NON_SHARED_DISK"));
        assert!(fx.hv.state_of("a").is_none());
        assert!(!image.exists());
    }

    #[test]
    fn test_failed_migration_keeps_source() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        fx.hv.add_guest("a", DomainState::Running);
        fx.hv.fail("migrate");

        assert!(migrate(&ctx, "a", "qemu+ssh://node-2/system", StorageMode::GlusterFs, Some("vol")).is_err());
        assert_eq!(fx.hv.state_of("a"), Some(DomainState::Running));
        assert!(fx.remote.commands().is_empty());

        let last = fx.bus.published("C:Event").pop().unwrap();
        assert_eq!(last["type"], GuestState::Running.code());
    }
}
