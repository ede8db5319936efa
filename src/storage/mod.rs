//! Disk-image storage backends.
//!
//! This module gives every storage transport the same set of operations so
//! that instruction handlers never branch on where an image lives.
//!
//! # Backends
//!
//! - [`LocalStore`]: local disk and shared mounts, addressed by plain path
//! - [`GlusterStore`]: glusterfs volume, addressed by volume + relative path
//! - [`RbdStore`]: ceph RBD pool, addressed by pool + image name
//!
//! All backends shell out to `qemu-img` for imaging operations. A non-zero
//! exit is logged and surfaced as [`Error::CommandExecFailed`] carrying the
//! tool output.

pub mod gluster;
pub mod local;
pub mod qemu_img;
pub mod rbd;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use gluster::{GlusterStore, MountedVolumeConnector, VolumeConnector, VolumeHandle};
pub use local::LocalStore;
pub use qemu_img::QemuImg;
pub use rbd::RbdStore;
pub use virtnode_protocol::StorageMode;

/// Bytes per GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Scale a resize/quota message size for the live-resize primitive.
///
/// Messages carry disk sizes as whole numbers; the hypervisor's live
/// resize expects them multiplied by `1024 * 1024`.
pub fn live_resize_units(size: u64) -> u64 {
    size * 1024 * 1024
}

/// Image metadata as reported by `qemu-img info --output=json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiskInfo {
    /// Image file name or URL.
    pub filename: String,

    /// Image format (e.g. `qcow2`).
    pub format: String,

    /// Guest-visible size in bytes.
    pub virtual_size: u64,

    /// Allocated size on the host in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_size: Option<u64>,

    /// Cluster size for formats that have one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<u64>,

    /// Backing image, for overlays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_filename: Option<String>,

    /// Whether the image was not closed cleanly.
    #[serde(default)]
    pub dirty_flag: bool,
}

/// Uniform disk-image operations over one storage transport.
///
/// Paths are logical: a plain filesystem path for local modes, a path
/// relative to the volume (or pool) otherwise. Sizes are whole GiB.
pub trait ImageStore: Send + Sync {
    /// Storage mode served by this backend.
    fn mode(&self) -> StorageMode;

    /// Address handed to the image tool for `path`.
    fn image_url(&self, path: &Path) -> String;

    /// Create a qcow2 image of `size_gib`.
    fn make_image(&self, path: &Path, size_gib: u64) -> Result<()>;

    /// Create a qcow2 overlay of `path` on top of `backing`.
    fn make_overlay(&self, path: &Path, backing: &Path) -> Result<()>;

    /// Write the state of `source` at internal `snapshot` to a new
    /// standalone image at `dest`.
    fn convert_snapshot(&self, source: &Path, snapshot: &str, dest: &Path) -> Result<()>;

    /// Grow an image to `size_gib`.
    fn resize_image(&self, path: &Path, size_gib: u64) -> Result<()>;

    /// Delete an image. Deleting a missing image succeeds.
    fn delete_image(&self, path: &Path) -> Result<()>;

    /// Read image metadata.
    fn disk_info(&self, path: &Path) -> Result<DiskInfo>;

    /// Size of the image in bytes.
    fn getsize(&self, path: &Path) -> Result<u64>;
}

/// A storage mode plus logical path plus volume qualifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    /// Transport.
    pub mode: StorageMode,
    /// Logical image path.
    pub path: PathBuf,
    /// Volume (glusterfs) or pool (ceph). Ignored for local modes.
    pub volume: Option<String>,
}

impl StorageTarget {
    /// Target on local storage.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: StorageMode::Local,
            path: path.into(),
            volume: None,
        }
    }
}

/// Resolve a fresh backend for `mode`.
///
/// Networked modes require a volume.
pub fn open_store(
    mode: StorageMode,
    volume: Option<&str>,
    config: &StorageConfig,
    connector: Arc<dyn VolumeConnector>,
) -> Result<Arc<dyn ImageStore>> {
    let tool = QemuImg::new(&config.qemu_img);

    match mode {
        StorageMode::Local | StorageMode::SharedMount => Ok(Arc::new(LocalStore::new(mode, tool))),
        StorageMode::GlusterFs => {
            let volume = require_volume(mode, volume)?;
            Ok(Arc::new(GlusterStore::new(
                tool,
                &config.gluster_host,
                volume,
                connector,
            )))
        }
        StorageMode::Ceph => {
            let pool = require_volume(mode, volume)?;
            Ok(Arc::new(RbdStore::new(tool, &config.rbd, pool)))
        }
    }
}

fn require_volume(mode: StorageMode, volume: Option<&str>) -> Result<&str> {
    volume
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::validation(format!("storage mode {} requires a volume", mode)))
}

/// Per-engine backend resolver.
///
/// Keeps the most recently used networked backend so its volume connection
/// is reused by consecutive instructions against the same volume. Not meant
/// to be shared between engine instances.
pub struct StoreCache {
    config: StorageConfig,
    connector: Arc<dyn VolumeConnector>,
    networked: Mutex<Option<(StorageMode, String, Arc<dyn ImageStore>)>>,
}

impl StoreCache {
    /// Create a resolver.
    pub fn new(config: StorageConfig, connector: Arc<dyn VolumeConnector>) -> Self {
        Self {
            config,
            connector,
            networked: Mutex::new(None),
        }
    }

    /// Resolver using the FUSE-mount connector from `config`.
    pub fn from_config(config: StorageConfig) -> Self {
        let connector = Arc::new(MountedVolumeConnector::new(&config.gluster_mount_root));
        Self::new(config, connector)
    }

    /// Backend for `target`.
    pub fn store_for(&self, target: &StorageTarget) -> Result<Arc<dyn ImageStore>> {
        self.store(target.mode, target.volume.as_deref())
    }

    /// Backend for `mode` and `volume`.
    pub fn store(&self, mode: StorageMode, volume: Option<&str>) -> Result<Arc<dyn ImageStore>> {
        if matches!(mode, StorageMode::Local | StorageMode::SharedMount) {
            return open_store(mode, volume, &self.config, self.connector.clone());
        }

        let volume = require_volume(mode, volume)?;
        let mut cached = self.networked.lock();
        if let Some((cached_mode, cached_volume, store)) = cached.as_ref() {
            if *cached_mode == mode && cached_volume == volume {
                return Ok(store.clone());
            }
        }

        tracing::debug!(mode = %mode, volume = %volume, "opening storage backend");
        let store = open_store(mode, Some(volume), &self.config, self.connector.clone())?;
        *cached = Some((mode, volume.to_string(), store.clone()));
        Ok(store)
    }
}
