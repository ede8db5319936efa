//! Agent runtime.
//!
//! Starts every engine on its own named thread around one shared shutdown
//! flag:
//!
//! - `reactor`: the event loop handed to the hypervisor library
//! - `guest-telemetry` / `host-telemetry`: performance sampling
//! - `heartbeat` / `state-report`: host liveness and guest state reports
//! - `dispatch`: the instruction loop and its worker pool
//!
//! Lifecycle events arrive on the reactor thread and are forwarded to the
//! event channel as they happen.

use crate::bus::{Emitter, MessageBus};
use crate::config::AgentConfig;
use crate::dispatch::{Context, Dispatcher};
use crate::error::Result;
use crate::host::{HostIdentity, LoadGate};
use crate::hypervisor::{Hypervisor, LifecycleEvent};
use crate::reactor::Reactor;
use crate::remote::SshExec;
use crate::storage::StoreCache;
use crate::telemetry::guest::GuestPerfEngine;
use crate::telemetry::host::HostPerfEngine;
use crate::telemetry::report::{Heartbeat, StateReporter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A started agent. Dropping it without [`RunningAgent::stop`] leaves the
/// threads running.
pub struct RunningAgent {
    identity: HostIdentity,
    shutdown: Arc<AtomicBool>,
    reactor: Arc<Reactor>,
    threads: Vec<(String, JoinHandle<()>)>,
}

/// Start all engines against `hypervisor` and `bus`.
pub fn start(
    config: &AgentConfig,
    hypervisor: Arc<dyn Hypervisor>,
    bus: Arc<dyn MessageBus>,
) -> Result<RunningAgent> {
    config.validate()?;
    let identity = HostIdentity::detect(config.node_id)?;
    tracing::info!(node_id = identity.node_id, hostname = %identity.hostname, "starting agent");

    let emitter = Emitter::new(bus.clone(), config.bus.event_channel.clone(), identity.clone());
    let shutdown = Arc::new(AtomicBool::new(false));
    let reactor = Arc::new(Reactor::new()?);

    // The library needs the loop before any callback can be registered
    hypervisor.register_event_impl(reactor.clone())?;
    let lifecycle_emitter = emitter.clone();
    hypervisor.register_lifecycle_callback(Box::new(move |event: LifecycleEvent| {
        tracing::debug!(uuid = %event.uuid, event = event.event, detail = event.detail, "lifecycle event");
        if let Err(e) = lifecycle_emitter.guest_event(event.guest_state(), event.to_message()) {
            tracing::warn!(uuid = %event.uuid, error = %e, "failed to emit lifecycle event");
        }
    }))?;

    let mut agent = RunningAgent {
        identity,
        shutdown: shutdown.clone(),
        reactor: reactor.clone(),
        threads: Vec::new(),
    };

    {
        let shutdown = shutdown.clone();
        agent.spawn("reactor", move || {
            if let Err(e) = reactor.run(&shutdown) {
                tracing::error!(error = %e, "reactor failed");
            }
        })?;
    }

    let telemetry = &config.telemetry;
    let mut guest_perf = GuestPerfEngine::new(
        hypervisor.clone(),
        emitter.clone(),
        telemetry.guest_interval,
        telemetry.housekeeping_interval,
    );
    agent.spawn_engine("guest-telemetry", move |s| guest_perf.run(s))?;

    let mut host_perf = HostPerfEngine::new(
        emitter.clone(),
        telemetry.proc_root.clone(),
        telemetry.host_interval,
        telemetry.housekeeping_interval,
    );
    agent.spawn_engine("host-telemetry", move |s| host_perf.run(s))?;

    let mut heartbeat = Heartbeat::new(
        emitter.clone(),
        telemetry.proc_root.clone(),
        telemetry.heartbeat_interval,
    );
    agent.spawn_engine("heartbeat", move |s| heartbeat.run(s))?;

    let reporter = StateReporter::new(
        hypervisor.clone(),
        emitter.clone(),
        telemetry.state_report_interval,
    );
    agent.spawn_engine("state-report", move |s| reporter.run(s))?;

    let ctx = Context {
        hypervisor,
        emitter,
        stores: StoreCache::from_config(config.storage.clone()),
        remote: Arc::new(SshExec::from_config(&config.dispatch)),
        qemu_img: config.storage.qemu_img.clone(),
        load_gate: LoadGate::system(config.dispatch.create_load_limit),
    };
    let mut dispatcher = Dispatcher::new(ctx, bus, config.bus.clone(), &config.dispatch)?;
    agent.spawn_engine("dispatch", move |s| dispatcher.run(s))?;

    Ok(agent)
}

impl RunningAgent {
    /// Identity the agent reports as.
    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Raise the shutdown flag and wait for every engine to return.
    ///
    /// Offloaded instructions already queued are finished first.
    pub fn stop(mut self) {
        tracing::info!("stopping agent");
        self.shutdown.store(true, Ordering::Release);
        self.reactor.interrupt();

        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!(thread = %name, "engine thread panicked");
            }
        }
        tracing::info!("agent stopped");
    }

    fn spawn(&mut self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)?;
        self.threads.push((name.to_string(), handle));
        Ok(())
    }

    fn spawn_engine(
        &mut self,
        name: &str,
        f: impl FnOnce(&AtomicBool) + Send + 'static,
    ) -> Result<()> {
        let shutdown = self.shutdown.clone();
        self.spawn(name, move || f(&shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::hypervisor::{DomainState, MockHypervisor};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn config() -> AgentConfig {
        let mut config = AgentConfig {
            node_id: Some(3),
            ..Default::default()
        };
        config.bus.receive_timeout = Duration::from_millis(20);
        config.telemetry.guest_interval = Duration::from_millis(50);
        config.telemetry.host_interval = Duration::from_millis(50);
        config.dispatch.workers = 1;
        config
    }

    fn wait_for(what: &str, mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn kinds(bus: &MemoryBus, kind: u64) -> Vec<serde_json::Value> {
        bus.published("C:Event")
            .into_iter()
            .filter(|e| e["kind"] == kind)
            .collect()
    }

    #[test]
    fn test_agent_serves_and_stops() {
        let hv = Arc::new(MockHypervisor::new());
        hv.add_guest("a", DomainState::Shutoff);
        let bus = Arc::new(MemoryBus::new());

        let agent = start(&config(), hv.clone(), bus.clone()).unwrap();
        assert_eq!(agent.identity().node_id, 3);
        assert!(hv.event_impl().is_some());

        bus.push(json!({"action": "ping"}));
        bus.push(json!({"_object": "guest", "action": "boot", "uuid": "a", "node_id": 3}));

        wait_for("pong", || !bus.published("C:Instruction").is_empty());
        wait_for("boot response", || !kinds(&bus, 3).is_empty());
        wait_for("heartbeat", || !kinds(&bus, 2).is_empty());
        assert_eq!(hv.state_of("a"), Some(DomainState::Running));

        agent.stop();
    }

    #[test]
    fn test_lifecycle_events_are_forwarded() {
        let hv = Arc::new(MockHypervisor::new());
        let bus = Arc::new(MemoryBus::new());
        let agent = start(&config(), hv.clone(), bus.clone()).unwrap();

        hv.emit_lifecycle(LifecycleEvent {
            uuid: "b".to_string(),
            event: 3,
            detail: 0,
        });

        let forwarded = kinds(&bus, 1)
            .into_iter()
            .find(|e| e["message"]["uuid"] == "b")
            .unwrap();
        assert_eq!(forwarded["type"], virtnode_protocol::GuestState::Paused.code());
        assert_eq!(forwarded["message"]["event"], "Suspended");

        agent.stop();
    }

    #[test]
    fn test_invalid_config_is_rejected_before_start() {
        let mut config = config();
        config.dispatch.workers = 0;
        let hv = Arc::new(MockHypervisor::new());
        assert!(start(&config, hv.clone(), Arc::new(MemoryBus::new())).is_err());
        assert!(hv.event_impl().is_none());
    }
}
