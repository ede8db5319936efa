//! Instruction dispatch.
//!
//! The [`Dispatcher`] consumes the instruction channel one message at a
//! time:
//!
//! 1. Liveness probes are answered, other agents' instructions dropped.
//! 2. The message is parsed into an [`Instruction`]. If it names a guest,
//!    a fresh [`DomainMapping`] must contain it.
//! 3. Short instructions run inline and are acknowledged by the loop. Long
//!    ones go to the [`WorkerPool`], which acknowledges them itself. When
//!    its queue is full the instruction is acknowledged as failed at once.
//!
//! A target has at most one instruction in progress; a second one is
//! rejected until the first finishes. A failing instruction is logged and
//! acknowledged as failed. It never stops the loop.

pub mod disk;
pub mod guest;
pub mod instruction;
pub mod migrate;
pub mod snapshot;
pub mod worker;

pub use instruction::{Instruction, Policy};
pub use worker::{InFlight, WorkerPool};

use worker::panic_message;

use crate::bus::{Emitter, MessageBus};
use crate::config::{BusConfig, DispatchConfig};
use crate::error::{Error, Result};
use crate::host::LoadGate;
use crate::hypervisor::{DomainMapping, Hypervisor};
use crate::remote::RemoteExec;
use crate::storage::StoreCache;
use crate::telemetry::report::report_guest_states;
use crate::telemetry::sleep_unless_shutdown;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use virtnode_protocol::{pong, GuestState, RawInstruction, Response, UNKNOWN};

/// What instruction handlers work with.
pub struct Context {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub emitter: Emitter,
    pub stores: StoreCache,
    pub remote: Arc<dyn RemoteExec>,
    /// Image tool path on peer hosts.
    pub qemu_img: PathBuf,
    /// Admission check for guest creation.
    pub load_gate: LoadGate,
}

impl Context {
    /// Report `uuid` in `state`. Publish failures are only logged.
    pub fn announce(&self, state: GuestState, uuid: &str) {
        if let Err(e) = self.emitter.guest_event(state, json!({ "uuid": uuid })) {
            tracing::warn!(uuid = %uuid, ?state, error = %e, "failed to emit guest state");
        }
    }

    /// Report the hypervisor's current state of `uuid`, if it still exists.
    pub fn report_state(&self, uuid: &str) {
        match DomainMapping::refresh(self.hypervisor.as_ref()) {
            Ok(mapping) => {
                if let Ok(guest) = mapping.get(uuid) {
                    self.announce(GuestState::from(guest.state), uuid);
                }
            }
            Err(e) => tracing::warn!(uuid = %uuid, error = %e, "cannot read guest state"),
        }
    }

    /// Publish the acknowledgment of an instruction.
    pub fn acknowledge(&self, reply: &Reply, outcome: Result<Value>) {
        let response = match outcome {
            Ok(data) => {
                tracing::info!(object = %reply.object, action = %reply.action, uuid = %reply.uuid, "instruction succeeded");
                reply.response(true, data)
            }
            Err(e) => {
                tracing::error!(object = %reply.object, action = %reply.action, uuid = %reply.uuid, error = %e, "instruction failed");
                self.emitter.error(&format!(
                    "{} {} {} failed: {}",
                    reply.object, reply.action, reply.uuid, e
                ));
                reply.response(false, json!({ "error": e.to_string() }))
            }
        };

        if let Err(e) = self.emitter.response(&response) {
            tracing::warn!(uuid = %reply.uuid, error = %e, "failed to publish response");
        }
    }
}

/// Addressing of an acknowledgment, captured from the inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub object: String,
    pub action: String,
    pub uuid: String,
    pub passback: Value,
}

impl Reply {
    /// Addressing from a parsed message.
    pub fn from_raw(raw: &RawInstruction) -> Self {
        Self {
            object: raw.object.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            action: non_empty(&raw.action),
            uuid: raw.uuid.as_deref().map(non_empty).unwrap_or_else(|| UNKNOWN.to_string()),
            passback: raw.passback_parameters.clone().unwrap_or(Value::Null),
        }
    }

    /// Whatever addressing can be recovered from a malformed message.
    pub fn salvage(message: &Value) -> Self {
        let text = |name: &str| {
            message
                .get(name)
                .and_then(Value::as_str)
                .map(non_empty)
                .unwrap_or_else(|| UNKNOWN.to_string())
        };
        Self {
            object: text("_object"),
            action: text("action"),
            uuid: text("uuid"),
            passback: message
                .get("passback_parameters")
                .cloned()
                .unwrap_or(Value::Null),
        }
    }

    /// The acknowledgment body.
    pub fn response(&self, state: bool, data: Value) -> Response {
        Response {
            object: self.object.clone(),
            action: self.action.clone(),
            uuid: self.uuid.clone(),
            state,
            data,
            passback_parameters: self.passback.clone(),
        }
    }
}

fn non_empty(s: &str) -> String {
    if s.is_empty() {
        UNKNOWN.to_string()
    } else {
        s.to_string()
    }
}

/// Run one instruction to completion.
pub fn execute(ctx: &Context, instruction: &Instruction) -> Result<Value> {
    match instruction {
        Instruction::CreateGuest(spec) => guest::create(ctx, spec),
        Instruction::Power { uuid, op } => guest::power(ctx, uuid, *op),
        Instruction::DeleteGuest { uuid, mode, volume } => {
            guest::delete(ctx, uuid, *mode, volume.as_deref())
        }
        Instruction::ResetPassword {
            uuid,
            user,
            password,
        } => guest::reset_password(ctx, uuid, user, password),
        Instruction::AttachDisk { uuid, xml } => guest::attach_disk(ctx, uuid, xml),
        Instruction::DetachDisk { uuid, xml } => guest::detach_disk(ctx, uuid, xml),
        Instruction::Migrate {
            uuid,
            destination,
            mode,
            volume,
        } => migrate::migrate(ctx, uuid, destination, *mode, volume.as_deref()),
        Instruction::AllocateBandwidth { uuid, bandwidth } => {
            guest::allocate_bandwidth(ctx, uuid, *bandwidth)
        }
        Instruction::AdjustAbility {
            uuid,
            cpu,
            memory_mib,
        } => guest::adjust_ability(ctx, uuid, *cpu, *memory_mib),
        Instruction::CreateDisk { image, size } => disk::create(ctx, image, *size),
        Instruction::ResizeDisk {
            image,
            size,
            attachment,
            quota,
        } => disk::resize(ctx, image, *size, attachment.as_ref(), quota.as_ref()),
        Instruction::DeleteDisk { image } | Instruction::DeleteTemplate { image } => {
            disk::delete(ctx, image)
        }
        Instruction::QuotaDisk { attachment, quota } => disk::quota(ctx, attachment, quota),
        Instruction::CreateSnapshot { uuid, xml } => snapshot::create(ctx, uuid, xml.as_deref()),
        Instruction::DeleteSnapshot { uuid, snapshot } => snapshot::delete(ctx, uuid, snapshot),
        Instruction::RevertSnapshot { uuid, snapshot } => snapshot::revert(ctx, uuid, snapshot),
        Instruction::ConvertSnapshot {
            uuid,
            snapshot,
            template,
        } => snapshot::convert(ctx, uuid, snapshot, template),
        Instruction::RefreshGuestState => {
            let guests = report_guest_states(ctx.hypervisor.as_ref(), &ctx.emitter)?;
            Ok(json!({ "guests": guests }))
        }
    }
}

/// [`execute`], with a handler panic turned into a failed outcome.
pub fn execute_caught(ctx: &Context, instruction: &Instruction) -> Result<Value> {
    catch_unwind(AssertUnwindSafe(|| execute(ctx, instruction)))
        .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(&*panic).to_string())))
}

/// Consumes the instruction channel.
pub struct Dispatcher {
    ctx: Arc<Context>,
    bus: Arc<dyn MessageBus>,
    config: BusConfig,
    in_flight: InFlight,
    pool: WorkerPool,
}

impl Dispatcher {
    /// Create a dispatcher and start its workers.
    pub fn new(
        ctx: Context,
        bus: Arc<dyn MessageBus>,
        config: BusConfig,
        dispatch: &DispatchConfig,
    ) -> Result<Self> {
        Ok(Self {
            ctx: Arc::new(ctx),
            bus,
            config,
            in_flight: InFlight::new(),
            pool: WorkerPool::new(dispatch.workers, dispatch.queue_depth)?,
        })
    }

    /// Handle messages until `shutdown` is raised, then finish queued work.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        tracing::info!(channel = %self.config.instruction_channel, "dispatch loop started");

        while !shutdown.load(Ordering::Acquire) {
            match self.bus.receive(self.config.receive_timeout) {
                Ok(Some(message)) => self.handle(message),
                Ok(None) => {}
                Err(e) if e.is_transport() => {
                    tracing::warn!(error = %e, backoff = ?self.config.reconnect_backoff, "bus unavailable, backing off");
                    sleep_unless_shutdown(self.config.reconnect_backoff, shutdown);
                }
                Err(e) => tracing::error!(error = %e, "failed to receive instruction"),
            }
        }

        tracing::info!("dispatch loop stopping, finishing queued instructions");
        self.pool.shutdown();
    }

    /// Handle one bus message.
    pub fn handle(&self, message: Value) {
        let raw = match RawInstruction::from_value(message.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                self.ctx.acknowledge(
                    &Reply::salvage(&message),
                    Err(Error::validation(format!("malformed instruction: {}", e))),
                );
                return;
            }
        };

        if raw.is_ping() {
            if let Err(e) = self.bus.publish(&self.config.instruction_channel, &pong()) {
                tracing::warn!(error = %e, "failed to answer ping");
            }
            return;
        }
        if raw.is_pong() {
            return;
        }

        let node_id = self.ctx.emitter.identity().node_id;
        if !raw.is_for_node(node_id) {
            tracing::trace!(target_node = ?raw.node_id, node_id, "instruction for another node");
            return;
        }

        let reply = Reply::from_raw(&raw);
        match self.dispatch(&raw, &reply) {
            Ok(Some(data)) => self.ctx.acknowledge(&reply, Ok(data)),
            Ok(None) => {}
            Err(e) => self.ctx.acknowledge(&reply, Err(e)),
        }
    }

    /// Validate and run or offload. `Ok(None)` means a worker took it.
    fn dispatch(&self, raw: &RawInstruction, reply: &Reply) -> Result<Option<Value>> {
        let instruction = Instruction::parse(raw)?;

        if let Some(uuid) = instruction.guest_uuid() {
            let mapping = DomainMapping::refresh(self.ctx.hypervisor.as_ref())?;
            if !mapping.contains(uuid) {
                if instruction.is_guest_delete() {
                    tracing::info!(uuid = %uuid, "guest already absent");
                    return Ok(Some(Value::Null));
                }
                return Err(Error::GuestNotFound(uuid.to_string()));
            }
        }

        let guard = match instruction.guest_uuid().or(raw.uuid.as_deref()) {
            Some(target) => Some(self.in_flight.claim(target)?),
            None => None,
        };

        match instruction.policy() {
            Policy::Inline => {
                let outcome = execute_caught(&self.ctx, &instruction);
                drop(guard);
                match outcome {
                    Err(Error::GuestNotFound(_)) if instruction.is_guest_delete() => {
                        Ok(Some(Value::Null))
                    }
                    outcome => outcome.map(Some),
                }
            }
            Policy::Offloaded => {
                let ctx = self.ctx.clone();
                let job_reply = reply.clone();
                self.pool.submit(Box::new(move || {
                    let _guard = guard;
                    let outcome = execute_caught(&ctx, &instruction);
                    ctx.acknowledge(&job_reply, outcome);
                }))?;
                tracing::debug!(object = %reply.object, action = %reply.action, uuid = %reply.uuid, "instruction offloaded");
                Ok(None)
            }
        }
    }

    /// Wait for offloaded work to finish.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::StorageConfig;
    use crate::host::{HostIdentity, LoadSource};
    use crate::hypervisor::MockHypervisor;
    use crate::testutil::recording_tool;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records remote commands instead of running them.
    #[derive(Default)]
    pub struct RecordingRemote {
        commands: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingRemote {
        pub fn commands(&self) -> Vec<(String, Vec<String>)> {
            self.commands.lock().clone()
        }
    }

    impl RemoteExec for RecordingRemote {
        fn run(&self, host: &str, command: &[String]) -> Result<String> {
            self.commands
                .lock()
                .push((host.to_string(), command.to_vec()));
            Ok(String::new())
        }
    }

    /// A load average that never changes.
    pub struct FixedLoad(pub f64);

    impl LoadSource for FixedLoad {
        fn five_minute(&self) -> f64 {
            self.0
        }
    }

    /// Mock hypervisor, memory bus and a recording `qemu-img` in a temp dir.
    pub struct Fixture {
        pub dir: TempDir,
        pub hv: Arc<MockHypervisor>,
        pub bus: Arc<MemoryBus>,
        pub remote: Arc<RecordingRemote>,
        pub tool: PathBuf,
        log: PathBuf,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("tool-args");
            let tool = recording_tool(dir.path(), &log);
            Self {
                dir,
                hv: Arc::new(MockHypervisor::new()),
                bus: Arc::new(MemoryBus::new()),
                remote: Arc::new(RecordingRemote::default()),
                tool,
                log,
            }
        }

        /// Arguments of each `qemu-img` invocation so far.
        pub fn tool_args(&self) -> Vec<String> {
            std::fs::read_to_string(&self.log)
                .map(|s| s.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }
    }

    pub fn context(fx: &Fixture) -> Context {
        let storage = StorageConfig {
            qemu_img: fx.tool.clone(),
            gluster_mount_root: fx.dir.path().join("gluster"),
            ..Default::default()
        };
        Context {
            hypervisor: fx.hv.clone(),
            emitter: Emitter::new(fx.bus.clone(), "C:Event", HostIdentity::with_node_id(7)),
            stores: StoreCache::from_config(storage),
            remote: fx.remote.clone(),
            qemu_img: PathBuf::from("/usr/bin/qemu-img"),
            load_gate: LoadGate::new(Arc::new(FixedLoad(0.0)), 0.6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{context, Fixture};
    use super::*;
    use crate::hypervisor::DomainState;
    use std::time::Duration;

    fn dispatcher(fx: &Fixture) -> Dispatcher {
        let config = BusConfig {
            receive_timeout: Duration::from_millis(20),
            reconnect_backoff: Duration::from_millis(20),
            ..Default::default()
        };
        Dispatcher::new(context(fx), fx.bus.clone(), config, &DispatchConfig::default()).unwrap()
    }

    fn responses(fx: &Fixture) -> Vec<Value> {
        fx.bus
            .published("C:Event")
            .into_iter()
            .filter(|e| e["kind"] == 3)
            .map(|e| e["message"].clone())
            .collect()
    }

    #[test]
    fn test_disk_create_end_to_end() {
        let fx = Fixture::new();
        let mut dispatcher = dispatcher(&fx);
        let image = fx.dir.path().join("data/a.qcow2");

        dispatcher.handle(json!({
            "_object": "disk",
            "action": "create",
            "storage_mode": 0,
            "image_path": image,
            "size": 10,
            "passback_parameters": {"request": "r-1"},
        }));
        dispatcher.shutdown();

        assert!(fx.dir.path().join("data").is_dir());
        assert_eq!(fx.tool_args(), [format!("create -f qcow2 {} 10G", image.display())]);

        let responses = responses(&fx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["_object"], "disk");
        assert_eq!(responses[0]["action"], "create");
        assert_eq!(responses[0]["state"], true);
        assert_eq!(responses[0]["passback_parameters"], json!({"request": "r-1"}));
    }

    #[test]
    fn test_delete_of_absent_guest_succeeds() {
        let fx = Fixture::new();
        let dispatcher = dispatcher(&fx);

        dispatcher.handle(json!({
            "_object": "guest", "action": "delete", "uuid": "gone", "storage_mode": 0,
        }));

        let responses = responses(&fx);
        assert_eq!(responses[0]["state"], true);
        assert_eq!(responses[0]["uuid"], "gone");
        assert!(fx.hv.calls().is_empty());
    }

    #[test]
    fn test_unknown_guest_fails_without_touching_hypervisor() {
        let fx = Fixture::new();
        let dispatcher = dispatcher(&fx);

        dispatcher.handle(json!({"_object": "guest", "action": "reboot", "uuid": "gone"}));

        let responses = responses(&fx);
        assert_eq!(responses[0]["state"], false);
        assert!(fx.hv.calls().is_empty());
    }

    #[test]
    fn test_malformed_message_is_acknowledged_as_unknown() {
        let fx = Fixture::new();
        let dispatcher = dispatcher(&fx);

        dispatcher.handle(json!({"_object": "guest", "action": 12, "passback_parameters": 5}));
        dispatcher.handle(json!({"_object": "guest", "action": "boot"}));

        let responses = responses(&fx);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["action"], "unknown");
        assert_eq!(responses[0]["uuid"], "unknown");
        assert_eq!(responses[0]["passback_parameters"], 5);
        assert_eq!(responses[1]["action"], "boot");
        assert_eq!(responses[1]["uuid"], "unknown");
        assert_eq!(responses[1]["state"], false);

        // Failures are also surfaced as operator log events
        assert!(fx.bus.published("C:Event").iter().any(|e| e["kind"] == 0));
    }

    #[test]
    fn test_ping_is_answered_and_pong_ignored() {
        let fx = Fixture::new();
        let dispatcher = dispatcher(&fx);

        dispatcher.handle(json!({"action": "ping"}));
        dispatcher.handle(json!({"action": "pong"}));

        assert_eq!(fx.bus.published("C:Instruction"), [json!({"action": "pong"})]);
        assert!(fx.bus.published("C:Event").is_empty());
    }

    #[test]
    fn test_other_nodes_are_ignored() {
        let fx = Fixture::new();
        fx.hv.add_guest("a", DomainState::Shutoff);
        let dispatcher = dispatcher(&fx);

        dispatcher.handle(json!({"_object": "guest", "action": "boot", "uuid": "a", "node_id": 8}));
        assert!(fx.hv.calls().is_empty());

        dispatcher.handle(json!({"_object": "guest", "action": "boot", "uuid": "a", "node_id": 7}));
        assert_eq!(fx.hv.calls(), ["start a"]);
    }

    #[test]
    fn test_offloaded_instruction_is_acknowledged_by_worker() {
        let fx = Fixture::new();
        fx.hv.add_guest("a", DomainState::Running);
        let mut dispatcher = dispatcher(&fx);

        dispatcher.handle(json!({
            "_object": "snapshot", "action": "create", "uuid": "a",
            "passback_parameters": {"n": 1},
        }));
        dispatcher.shutdown();

        let responses = responses(&fx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["state"], true);
        assert_eq!(responses[0]["data"]["snapshot_id"], "snap-1");
        assert_eq!(responses[0]["passback_parameters"], json!({"n": 1}));
    }

    #[test]
    fn test_busy_target_rejects_second_instruction() {
        let fx = Fixture::new();
        fx.hv.add_guest("a", DomainState::Running);
        let dispatcher = dispatcher(&fx);

        let _busy = dispatcher.in_flight.claim("a").unwrap();
        dispatcher.handle(json!({"_object": "guest", "action": "suspend", "uuid": "a"}));

        let responses = responses(&fx);
        assert_eq!(responses[0]["state"], false);
        assert!(responses[0]["data"]["error"]
            .as_str()
            .unwrap()
            .contains("in progress"));
        assert!(fx.hv.calls().is_empty());
    }

    #[test]
    fn test_full_worker_queue_fails_fast() {
        let fx = Fixture::new();
        fx.hv.add_guest("a", DomainState::Running);
        let dispatch = DispatchConfig {
            workers: 1,
            queue_depth: 1,
            ..Default::default()
        };
        let mut dispatcher =
            Dispatcher::new(context(&fx), fx.bus.clone(), BusConfig::default(), &dispatch).unwrap();

        let (release, held) = crossbeam_channel::unbounded::<()>();
        // One job running and one queued; retry until the worker takes the first
        for _ in 0..2 {
            loop {
                let held = held.clone();
                if dispatcher.pool.submit(Box::new(move || held.recv().unwrap())).is_ok() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let started = std::time::Instant::now();
        dispatcher.handle(json!({"_object": "snapshot", "action": "create", "uuid": "a"}));
        assert!(started.elapsed() < Duration::from_secs(1));

        let responses = responses(&fx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["state"], false);
        assert!(responses[0]["data"]["error"].as_str().unwrap().contains("queue is full"));
        assert!(!dispatcher.in_flight.contains("a"));
        assert!(fx.hv.calls().is_empty());

        release.send(()).unwrap();
        release.send(()).unwrap();
        dispatcher.shutdown();
    }

    struct PanickingRemote;

    impl RemoteExec for PanickingRemote {
        fn run(&self, host: &str, _command: &[String]) -> Result<String> {
            panic!("lost connection to {}", host)
        }
    }

    #[test]
    fn test_panicking_handler_is_acknowledged_as_failed() {
        let fx = Fixture::new();
        let image = fx.dir.path().join("guests/a/system.qcow2");
        std::fs::create_dir_all(image.parent().unwrap()).unwrap();
        std::fs::write(&image, b"qcow2").unwrap();
        crate::testutil::fake_tool(
            fx.dir.path(),
            r#"echo '{"filename": "x", "format": "qcow2", "virtual-size": 1073741824}'"#,
        );
        fx.hv.add_guest("a", DomainState::Running);
        fx.hv.set_disks(
            "a",
            vec![crate::hypervisor::DiskDevice {
                target: "vda".to_string(),
                source: image.clone(),
                boot_order: None,
            }],
        );

        let mut ctx = context(&fx);
        ctx.remote = Arc::new(PanickingRemote);
        let dispatch = DispatchConfig {
            workers: 1,
            ..Default::default()
        };
        let mut dispatcher =
            Dispatcher::new(ctx, fx.bus.clone(), BusConfig::default(), &dispatch).unwrap();

        let migrate = json!({
            "_object": "guest", "action": "migrate", "uuid": "a",
            "duri": "qemu+ssh://node-2/system", "storage_mode": 0,
        });
        dispatcher.handle(migrate.clone());
        // The same worker takes the next instruction once the target is free
        while dispatcher.in_flight.contains("a") {
            std::thread::sleep(Duration::from_millis(1));
        }
        dispatcher.handle(migrate);
        dispatcher.shutdown();

        let responses = responses(&fx);
        assert_eq!(responses.len(), 2);
        for response in &responses {
            assert_eq!(response["state"], false);
            assert!(response["data"]["error"]
                .as_str()
                .unwrap()
                .contains("lost connection to node-2"));
        }
        assert_eq!(fx.hv.state_of("a"), Some(DomainState::Running));
        assert!(image.exists());
    }

    #[test]
    fn test_online_resize_through_loop() {
        let fx = Fixture::new();
        fx.hv.add_guest("g", DomainState::Running);
        fx.hv.set_disks(
            "g",
            vec![crate::hypervisor::DiskDevice {
                target: "vdb".to_string(),
                source: PathBuf::from("/data/b.qcow2"),
                boot_order: None,
            }],
        );
        let dispatcher = dispatcher(&fx);

        dispatcher.handle(json!({
            "_object": "disk", "action": "resize", "uuid": "disk-b",
            "storage_mode": 0, "image_path": "/data/b.qcow2", "size": 5,
            "guest_uuid": "g", "device": "vdb",
        }));

        assert_eq!(fx.hv.calls(), ["block_resize g vdb 5242880"]);
        assert_eq!(responses(&fx)[0]["state"], true);
    }

    #[test]
    fn test_template_delete_is_idempotent() {
        let fx = Fixture::new();
        let dispatcher = dispatcher(&fx);
        let template = fx.dir.path().join("templates/centos.qcow2");
        std::fs::create_dir_all(template.parent().unwrap()).unwrap();
        std::fs::write(&template, b"qcow2").unwrap();

        for _ in 0..2 {
            dispatcher.handle(json!({
                "_object": "os_template_image", "action": "delete",
                "storage_mode": 0, "template_path": template,
            }));
        }

        assert!(!template.exists());
        let responses = responses(&fx);
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r["state"] == true));
    }

    #[test]
    fn test_run_answers_queued_messages_and_stops() {
        let fx = Fixture::new();
        fx.hv.add_guest("a", DomainState::Running);
        fx.bus.push(json!({"_object": "guest", "action": "suspend", "uuid": "a"}));
        fx.bus.push(json!({"_object": "global", "action": "refresh_guest_state"}));

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut dispatcher = dispatcher(&fx);
        let runner = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || dispatcher.run(&shutdown))
        };
        while fx.bus.pending() > 0 || responses(&fx).len() < 2 {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.store(true, Ordering::Release);
        runner.join().unwrap();

        assert_eq!(fx.hv.state_of("a"), Some(DomainState::Paused));
        let responses = responses(&fx);
        assert_eq!(responses[1]["data"]["guests"], 1);
    }

    #[test]
    fn test_transport_failure_backs_off_and_recovers() {
        let fx = Fixture::new();
        fx.hv.add_guest("a", DomainState::Shutoff);
        fx.bus.set_down(true);

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut dispatcher = dispatcher(&fx);
        let runner = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || dispatcher.run(&shutdown))
        };

        std::thread::sleep(Duration::from_millis(60));
        fx.bus.set_down(false);
        fx.bus.push(json!({"_object": "guest", "action": "boot", "uuid": "a"}));
        while fx.hv.state_of("a") != Some(DomainState::Running) {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.store(true, Ordering::Release);
        runner.join().unwrap();
    }
}
