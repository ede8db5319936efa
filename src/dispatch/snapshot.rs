//! Snapshot handlers.

use super::Context;
use crate::error::{Error, Result};
use crate::hypervisor::boot_disk;
use crate::storage::StorageTarget;
use serde_json::{json, Value};
use virtnode_protocol::GuestState;

/// Snapshot description used when the instruction carries none.
const DEFAULT_SNAPSHOT_XML: &str = "<domainsnapshot><description>virtnode</description></domainsnapshot>";

pub fn create(ctx: &Context, uuid: &str, xml: Option<&str>) -> Result<Value> {
    let name = ctx
        .hypervisor
        .snapshot_create(uuid, xml.unwrap_or(DEFAULT_SNAPSHOT_XML))?;
    tracing::info!(uuid = %uuid, snapshot = %name, "snapshot created");
    Ok(json!({ "snapshot_id": name }))
}

pub fn delete(ctx: &Context, uuid: &str, snapshot: &str) -> Result<Value> {
    ctx.hypervisor.snapshot_delete(uuid, snapshot)?;
    tracing::info!(uuid = %uuid, snapshot = %snapshot, "snapshot deleted");
    Ok(json!({ "snapshot_id": snapshot }))
}

pub fn revert(ctx: &Context, uuid: &str, snapshot: &str) -> Result<Value> {
    ctx.hypervisor.snapshot_revert(uuid, snapshot)?;
    tracing::info!(uuid = %uuid, snapshot = %snapshot, "reverted to snapshot");
    ctx.report_state(uuid);
    Ok(json!({ "snapshot_id": snapshot }))
}

/// Write the guest's system disk as of `snapshot` to a template image.
///
/// The guest is reported as converting for the duration, then with its
/// actual state again whatever the outcome.
pub fn convert(ctx: &Context, uuid: &str, snapshot: &str, template: &StorageTarget) -> Result<Value> {
    ctx.announce(GuestState::SnapshotConverting, uuid);
    let result = convert_system_disk(ctx, uuid, snapshot, template);
    ctx.report_state(uuid);

    let size = result?;
    tracing::info!(
        uuid = %uuid,
        snapshot = %snapshot,
        template = %template.path.display(),
        size,
        "snapshot converted"
    );
    Ok(json!({
        "snapshot_id": snapshot,
        "template_path": template.path,
        "size": size,
    }))
}

fn convert_system_disk(ctx: &Context, uuid: &str, snapshot: &str, template: &StorageTarget) -> Result<u64> {
    let disks = ctx.hypervisor.disk_devices(uuid)?;
    let source = boot_disk(&disks)
        .ok_or_else(|| Error::validation(format!("guest {} has no disks", uuid)))?;

    let store = ctx.stores.store_for(template)?;
    store.convert_snapshot(&source.source, snapshot, &template.path)?;
    store.getsize(&template.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{context, Fixture};
    use crate::hypervisor::{DiskDevice, DomainState};
    use crate::testutil::fake_tool;

    #[test]
    fn test_create_then_revert_then_delete() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        fx.hv.add_guest("a", DomainState::Running);

        let created = create(&ctx, "a", None).unwrap();
        let name = created["snapshot_id"].as_str().unwrap().to_string();
        assert_eq!(fx.hv.snapshots_of("a"), [name.clone()]);

        revert(&ctx, "a", &name).unwrap();
        delete(&ctx, "a", &name).unwrap();
        assert!(fx.hv.snapshots_of("a").is_empty());

        assert!(revert(&ctx, "a", &name).is_err());
    }

    #[test]
    fn test_convert_reads_boot_disk_and_reports_state() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        let template = fx.dir.path().join("templates/t.qcow2");
        // A tool that writes the destination so its size can be read
        fake_tool(fx.dir.path(), "for last; do :; done; printf 'abcd' > \"$last\"");

        fx.hv.add_guest("a", DomainState::Paused);
        fx.hv.set_disks(
            "a",
            vec![DiskDevice {
                target: "vda".to_string(),
                source: fx.dir.path().join("a.qcow2"),
                boot_order: Some(1),
            }],
        );

        let data = convert(&ctx, "a", "snap-1", &StorageTarget::local(&template)).unwrap();
        assert_eq!(data["size"], 4);
        assert!(template.exists());

        let states: Vec<u64> = fx
            .bus
            .published("C:Event")
            .iter()
            .map(|e| e["type"].as_u64().unwrap())
            .collect();
        assert_eq!(
            states,
            [GuestState::SnapshotConverting.code() as u64, GuestState::Paused.code() as u64]
        );
    }

    #[test]
    fn test_convert_without_disks_fails_but_restores_state() {
        let fx = Fixture::new();
        let ctx = context(&fx);
        fx.hv.add_guest("a", DomainState::Running);

        let template = StorageTarget::local(fx.dir.path().join("t.qcow2"));
        assert!(convert(&ctx, "a", "snap-1", &template).unwrap_err().is_validation());
        let last = fx.bus.published("C:Event").pop().unwrap();
        assert_eq!(last["type"], GuestState::Running.code());
    }
}
