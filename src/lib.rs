//! virtnode - compute-node agent for virtual machine fleets.
//!
//! The agent sits between a central controller and the local hypervisor.
//! It receives instructions over a message bus, carries them out against
//! the hypervisor and the storage backends, and reports guest state,
//! lifecycle events, heartbeats and performance samples back on the bus.

pub mod agent;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod hypervisor;
pub mod process;
pub mod reactor;
pub mod remote;
pub mod storage;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};

/// Agent version, reported in heartbeats.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
