//! Local and shared-mount image storage.

use super::{DiskInfo, ImageStore, QemuImg, StorageMode};
use crate::error::Result;
use std::path::Path;

/// Images addressed by plain filesystem path.
///
/// Serves both local disks and network filesystems mounted at the same path
/// on every host; the two only differ in how migration treats them.
#[derive(Debug, Clone)]
pub struct LocalStore {
    mode: StorageMode,
    tool: QemuImg,
}

impl LocalStore {
    /// Create a store for `mode` (local or shared mount).
    pub fn new(mode: StorageMode, tool: QemuImg) -> Self {
        debug_assert!(matches!(mode, StorageMode::Local | StorageMode::SharedMount));
        Self { mode, tool }
    }
}

impl ImageStore for LocalStore {
    fn mode(&self) -> StorageMode {
        self.mode
    }

    fn image_url(&self, path: &Path) -> String {
        path.display().to_string()
    }

    fn make_image(&self, path: &Path, size_gib: u64) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                tracing::debug!(path = %parent.display(), "creating image directory");
                std::fs::create_dir_all(parent)?;
            }
        }

        let existed = path.exists();
        let result = self.tool.create(path, &self.image_url(path), size_gib);
        if result.is_err() && !existed {
            // Don't leave a half-written image behind
            let _ = std::fs::remove_file(path);
        }
        result
    }

    fn make_overlay(&self, path: &Path, backing: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let existed = path.exists();
        let result = self
            .tool
            .create_overlay(path, &self.image_url(path), &self.image_url(backing));
        if result.is_err() && !existed {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    fn convert_snapshot(&self, source: &Path, snapshot: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let result = self.tool.convert(
            dest,
            &self.image_url(source),
            Some(snapshot),
            &self.image_url(dest),
        );
        if result.is_err() {
            let _ = std::fs::remove_file(dest);
        }
        result
    }

    fn resize_image(&self, path: &Path, size_gib: u64) -> Result<()> {
        self.tool.resize(path, &self.image_url(path), size_gib)
    }

    fn delete_image(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "deleted image");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "image already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn disk_info(&self, path: &Path) -> Result<DiskInfo> {
        self.tool.info(path, &self.image_url(path))
    }

    fn getsize(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}
