//! Agent configuration.
//!
//! Configuration is read from a TOML file. Every section and field has a
//! default, so a missing file or a partial file is valid.
//!
//! ```toml
//! node_id = 1234
//! log_format = "json"
//!
//! [bus]
//! instruction_channel = "C:Instruction"
//! receive_timeout = "1s"
//!
//! [telemetry]
//! guest_interval = "60s"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtnode/config.toml";

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit node id. Derived from the host's hardware address when unset.
    pub node_id: Option<u64>,

    /// Log output format.
    pub log_format: LogFormat,

    /// Message bus settings.
    pub bus: BusConfig,

    /// Storage backend settings.
    pub storage: StorageConfig,

    /// Telemetry cadence.
    pub telemetry: TelemetryConfig,

    /// Instruction dispatch settings.
    pub dispatch: DispatchConfig,
}

impl AgentConfig {
    /// Load configuration from `path`.
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.workers == 0 {
            return Err(Error::Config("dispatch.workers must be at least 1".into()));
        }
        if self.dispatch.queue_depth == 0 {
            return Err(Error::Config("dispatch.queue_depth must be at least 1".into()));
        }
        let limit = self.dispatch.create_load_limit;
        if !limit.is_finite() || limit < 0.0 {
            return Err(Error::Config(
                "dispatch.create_load_limit must be a non-negative number".into(),
            ));
        }
        for (name, value) in [
            ("telemetry.guest_interval", self.telemetry.guest_interval),
            ("telemetry.host_interval", self.telemetry.host_interval),
            ("telemetry.heartbeat_interval", self.telemetry.heartbeat_interval),
            ("telemetry.state_report_interval", self.telemetry.state_report_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

/// Message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Channel instructions arrive on (and pongs are published to).
    pub instruction_channel: String,

    /// Channel events are published to.
    pub event_channel: String,

    /// Upper bound on a single blocking receive.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Pause after a transport failure before retrying.
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            instruction_channel: "C:Instruction".to_string(),
            event_channel: "C:Event".to_string(),
            receive_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Storage backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Disk-image tool.
    pub qemu_img: PathBuf,

    /// Ceph RBD tool.
    pub rbd: PathBuf,

    /// Host serving glusterfs volumes to the image tool.
    pub gluster_host: String,

    /// Directory under which glusterfs volumes are FUSE-mounted, one
    /// subdirectory per volume.
    pub gluster_mount_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            qemu_img: PathBuf::from("/usr/bin/qemu-img"),
            rbd: PathBuf::from("/usr/bin/rbd"),
            gluster_host: "127.0.0.1".to_string(),
            gluster_mount_root: PathBuf::from("/mnt/glusterfs"),
        }
    }
}

/// Telemetry cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Guest performance sampling interval.
    #[serde(with = "humantime_serde")]
    pub guest_interval: Duration,

    /// Host performance sampling interval.
    #[serde(with = "humantime_serde")]
    pub host_interval: Duration,

    /// How often stale per-entity samples are purged.
    #[serde(with = "humantime_serde")]
    pub housekeeping_interval: Duration,

    /// Host heartbeat interval.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Guest state report interval.
    #[serde(with = "humantime_serde")]
    pub state_report_interval: Duration,

    /// Procfs root, for host interface and block counters.
    pub proc_root: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            guest_interval: Duration::from_secs(60),
            host_interval: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(10),
            state_report_interval: Duration::from_secs(60),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Instruction dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker threads for offloaded instructions.
    pub workers: usize,

    /// Offloaded instructions that may wait for a worker. Further ones
    /// are refused until the queue drains.
    pub queue_depth: usize,

    /// Five-minute load average above which guest creation is refused.
    pub create_load_limit: f64,

    /// SSH user for cross-host operations.
    pub ssh_user: String,

    /// SSH port for cross-host operations.
    pub ssh_port: u16,

    /// Connect timeout for cross-host operations.
    #[serde(with = "humantime_serde")]
    pub ssh_connect_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            create_load_limit: 0.6,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ssh_connect_timeout: Duration::from_secs(10),
        }
    }
}
