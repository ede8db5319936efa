//! Ceph RBD storage.

use super::{DiskInfo, ImageStore, QemuImg, StorageMode};
use crate::error::{Error, Result};
use crate::process;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Images in a ceph pool, addressed as `rbd:<pool>/<name>`.
#[derive(Debug, Clone)]
pub struct RbdStore {
    tool: QemuImg,
    rbd: PathBuf,
    pool: String,
}

impl RbdStore {
    /// Create a store for `pool`, using `rbd` for image removal.
    pub fn new(tool: QemuImg, rbd: impl Into<PathBuf>, pool: &str) -> Self {
        Self {
            tool,
            rbd: rbd.into(),
            pool: pool.to_string(),
        }
    }

    fn image_name(&self, path: &Path) -> String {
        let relative = path.strip_prefix("/").unwrap_or(path);
        format!("{}/{}", self.pool, relative.display())
    }
}

impl ImageStore for RbdStore {
    fn mode(&self) -> StorageMode {
        StorageMode::Ceph
    }

    fn image_url(&self, path: &Path) -> String {
        format!("rbd:{}", self.image_name(path))
    }

    fn make_image(&self, path: &Path, size_gib: u64) -> Result<()> {
        self.tool.create(path, &self.image_url(path), size_gib)
    }

    fn make_overlay(&self, path: &Path, backing: &Path) -> Result<()> {
        self.tool
            .create_overlay(path, &self.image_url(path), &self.image_url(backing))
    }

    fn convert_snapshot(&self, source: &Path, snapshot: &str, dest: &Path) -> Result<()> {
        self.tool.convert(
            dest,
            &self.image_url(source),
            Some(snapshot),
            &self.image_url(dest),
        )
    }

    fn resize_image(&self, path: &Path, size_gib: u64) -> Result<()> {
        self.tool.resize(path, &self.image_url(path), size_gib)
    }

    fn delete_image(&self, path: &Path) -> Result<()> {
        let image = self.image_name(path);
        let output = process::run(Command::new(&self.rbd).args(["rm", &image]))?;

        if output.success() {
            tracing::info!(image = %image, "deleted image");
            return Ok(());
        }

        let combined = output.combined();
        if combined.contains("No such file") || combined.contains("does not exist") {
            tracing::debug!(image = %image, "image already absent");
            return Ok(());
        }

        tracing::error!(image = %image, output = %combined, "failed to delete image");
        Err(Error::command_exec_failed(path, combined))
    }

    fn disk_info(&self, path: &Path) -> Result<DiskInfo> {
        self.tool.info(path, &self.image_url(path))
    }

    fn getsize(&self, path: &Path) -> Result<u64> {
        Ok(self.disk_info(path)?.virtual_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fake_named_tool, fake_tool};

    #[test]
    fn test_image_url_names_pool() {
        let store = RbdStore::new(QemuImg::new("true"), "true", "vms");
        assert_eq!(
            store.image_url(Path::new("/guest/system.qcow2")),
            "rbd:vms/guest/system.qcow2"
        );
    }

    #[test]
    fn test_delete_absent_image_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let rbd = fake_named_tool(
            dir.path(),
            "rbd",
            "echo 'rbd: delete error: (2) No such file or directory' >&2; exit 2",
        );
        let store = RbdStore::new(QemuImg::new("true"), rbd, "vms");
        store.delete_image(Path::new("gone")).unwrap();
    }

    #[test]
    fn test_delete_other_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let rbd = fake_named_tool(dir.path(), "rbd", "echo 'image has watchers' >&2; exit 16");
        let store = RbdStore::new(QemuImg::new("true"), rbd, "vms");

        let err = store.delete_image(Path::new("busy")).unwrap_err();
        assert!(err.to_string().contains("watchers"));
    }

    #[test]
    fn test_getsize_reads_virtual_size() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            r#"echo '{"virtual-size": 21474836480, "filename": "rbd:vms/a", "format": "qcow2"}'"#,
        );
        let store = RbdStore::new(QemuImg::new(tool), "true", "vms");
        assert_eq!(store.getsize(Path::new("a")).unwrap(), 20 * super::super::GIB);
    }
}
