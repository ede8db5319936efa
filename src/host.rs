//! Host identity and load.

use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;

/// Where network interfaces are listed.
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Who this agent reports as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Node identifier instructions are filtered on.
    pub node_id: u64,
    /// Host name stamped on every event.
    pub hostname: String,
}

impl HostIdentity {
    /// Identity with an explicit node id and the system host name.
    pub fn with_node_id(node_id: u64) -> Self {
        Self {
            node_id,
            hostname: hostname(),
        }
    }

    /// Resolve the identity, deriving the node id from hardware when not
    /// configured.
    pub fn detect(configured: Option<u64>) -> Result<Self> {
        let node_id = match configured {
            Some(id) => id,
            None => node_id_from(Path::new(SYS_CLASS_NET))?,
        };
        Ok(Self::with_node_id(node_id))
    }
}

/// Source of the host's load average.
pub trait LoadSource: Send + Sync {
    /// Five-minute load average.
    fn five_minute(&self) -> f64;
}

/// Load average as reported by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad;

impl LoadSource for SystemLoad {
    fn five_minute(&self) -> f64 {
        sysinfo::System::load_average().five
    }
}

/// Refuses new guests while the host is busier than a limit.
#[derive(Clone)]
pub struct LoadGate {
    source: Arc<dyn LoadSource>,
    limit: f64,
}

impl LoadGate {
    /// Gate on `source` staying at or below `limit`.
    pub fn new(source: Arc<dyn LoadSource>, limit: f64) -> Self {
        Self { source, limit }
    }

    /// Gate on the system load average.
    pub fn system(limit: f64) -> Self {
        Self::new(Arc::new(SystemLoad), limit)
    }

    /// Check the current load.
    ///
    /// # Errors
    ///
    /// [`Error::Overloaded`] when the five-minute load is above the limit.
    pub fn admit(&self) -> Result<()> {
        let load = self.source.five_minute();
        if load > self.limit {
            tracing::warn!(load, limit = self.limit, "host too busy for a new guest");
            return Err(Error::overloaded(format!(
                "five-minute load {:.2} is above {:.2}",
                load, self.limit
            )));
        }
        Ok(())
    }
}

/// System host name, or `"localhost"` if it cannot be read.
pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Derive a node id from the hardware address of the first physical-looking
/// interface under `sys_class_net`, in name order.
///
/// The 48-bit address is read as an integer.
pub fn node_id_from(sys_class_net: &Path) -> Result<u64> {
    let mut names: Vec<String> = std::fs::read_dir(sys_class_net)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    for name in names {
        let address = match std::fs::read_to_string(sys_class_net.join(&name).join("address")) {
            Ok(address) => address,
            Err(_) => continue,
        };
        if let Some(id) = parse_mac(address.trim()) {
            if id != 0 {
                tracing::debug!(interface = %name, node_id = id, "derived node id");
                return Ok(id);
            }
        }
    }

    Err(Error::Config(format!(
        "no hardware address found under {}; set node_id explicitly",
        sys_class_net.display()
    )))
}

/// Parse `aa:bb:cc:dd:ee:ff` into an integer.
fn parse_mac(address: &str) -> Option<u64> {
    let octets: Vec<&str> = address.split(':').collect();
    if octets.len() != 6 {
        return None;
    }
    octets.iter().try_fold(0u64, |acc, octet| {
        u8::from_str_radix(octet, 16)
            .ok()
            .map(|b| (acc << 8) | b as u64)
    })
}
