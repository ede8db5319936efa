//! GlusterFS volume storage.
//!
//! Images live on a named volume and are addressed by a path relative to
//! the volume root. Directory and file management goes through a
//! [`VolumeHandle`]; imaging goes through the tool's native
//! `gluster://host/volume/path` URLs.

use super::{DiskInfo, ImageStore, QemuImg, StorageMode};
use crate::error::Result;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File operations scoped to one volume.
pub trait VolumeHandle: Send + Sync {
    /// Whether `path` is a directory on the volume.
    fn is_dir(&self, path: &Path) -> bool;

    /// Create `path` and its parents on the volume.
    fn make_dirs(&self, path: &Path) -> io::Result<()>;

    /// Remove the file at `path`.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Size of the file at `path` in bytes.
    fn size(&self, path: &Path) -> io::Result<u64>;
}

/// Opens volume handles.
pub trait VolumeConnector: Send + Sync {
    /// Connect to `volume`.
    fn connect(&self, volume: &str) -> io::Result<Arc<dyn VolumeHandle>>;
}

/// Connector for volumes FUSE-mounted under a common root.
///
/// Volume `gv0` is expected at `<root>/gv0`.
#[derive(Debug, Clone)]
pub struct MountedVolumeConnector {
    root: PathBuf,
}

impl MountedVolumeConnector {
    /// Resolve volumes under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl VolumeConnector for MountedVolumeConnector {
    fn connect(&self, volume: &str) -> io::Result<Arc<dyn VolumeHandle>> {
        let mount = self.root.join(volume);
        if !mount.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("volume {} is not mounted at {}", volume, mount.display()),
            ));
        }
        tracing::info!(volume = %volume, mount = %mount.display(), "connected to volume");
        Ok(Arc::new(MountedVolume { mount }))
    }
}

/// A volume reached through its mount point.
struct MountedVolume {
    mount: PathBuf,
}

impl MountedVolume {
    fn resolve(&self, path: &Path) -> PathBuf {
        self.mount.join(path.strip_prefix("/").unwrap_or(path))
    }
}

impl VolumeHandle for MountedVolume {
    fn is_dir(&self, path: &Path) -> bool {
        self.resolve(path).is_dir()
    }

    fn make_dirs(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(self.resolve(path))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(self.resolve(path))
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(self.resolve(path))?.len())
    }
}

/// Images on a glusterfs volume.
///
/// The volume handle is opened on first use and kept for the life of the
/// store.
pub struct GlusterStore {
    tool: QemuImg,
    host: String,
    volume: String,
    connector: Arc<dyn VolumeConnector>,
    handle: Mutex<Option<Arc<dyn VolumeHandle>>>,
}

impl GlusterStore {
    /// Create a store for `volume` served by `host`.
    pub fn new(
        tool: QemuImg,
        host: &str,
        volume: &str,
        connector: Arc<dyn VolumeConnector>,
    ) -> Self {
        Self {
            tool,
            host: host.to_string(),
            volume: volume.to_string(),
            connector,
            handle: Mutex::new(None),
        }
    }

    /// Volume served by this store.
    pub fn volume(&self) -> &str {
        &self.volume
    }

    fn handle(&self) -> Result<Arc<dyn VolumeHandle>> {
        let mut handle = self.handle.lock();
        if let Some(h) = handle.as_ref() {
            return Ok(h.clone());
        }
        let h = self.connector.connect(&self.volume)?;
        *handle = Some(h.clone());
        Ok(h)
    }
}

impl ImageStore for GlusterStore {
    fn mode(&self) -> StorageMode {
        StorageMode::GlusterFs
    }

    fn image_url(&self, path: &Path) -> String {
        let relative = path.strip_prefix("/").unwrap_or(path);
        format!(
            "gluster://{}/{}/{}",
            self.host,
            self.volume,
            relative.display()
        )
    }

    fn make_image(&self, path: &Path, size_gib: u64) -> Result<()> {
        let handle = self.handle()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !handle.is_dir(parent) {
                tracing::debug!(volume = %self.volume, path = %parent.display(), "creating image directory");
                handle.make_dirs(parent)?;
            }
        }

        let result = self.tool.create(path, &self.image_url(path), size_gib);
        if result.is_err() {
            let _ = handle.remove(path);
        }
        result
    }

    fn make_overlay(&self, path: &Path, backing: &Path) -> Result<()> {
        let handle = self.handle()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !handle.is_dir(parent) {
                handle.make_dirs(parent)?;
            }
        }

        let result = self
            .tool
            .create_overlay(path, &self.image_url(path), &self.image_url(backing));
        if result.is_err() {
            let _ = handle.remove(path);
        }
        result
    }

    fn convert_snapshot(&self, source: &Path, snapshot: &str, dest: &Path) -> Result<()> {
        let handle = self.handle()?;
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() && !handle.is_dir(parent) {
                handle.make_dirs(parent)?;
            }
        }

        let result = self.tool.convert(
            dest,
            &self.image_url(source),
            Some(snapshot),
            &self.image_url(dest),
        );
        if result.is_err() {
            let _ = handle.remove(dest);
        }
        result
    }

    fn resize_image(&self, path: &Path, size_gib: u64) -> Result<()> {
        self.tool.resize(path, &self.image_url(path), size_gib)
    }

    fn delete_image(&self, path: &Path) -> Result<()> {
        match self.handle()?.remove(path) {
            Ok(()) => {
                tracing::info!(volume = %self.volume, path = %path.display(), "deleted image");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn disk_info(&self, path: &Path) -> Result<DiskInfo> {
        self.tool.info(path, &self.image_url(path))
    }

    fn getsize(&self, path: &Path) -> Result<u64> {
        Ok(self.handle()?.size(path)?)
    }
}
