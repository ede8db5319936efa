//! Message bus boundary and event emission.
//!
//! The agent subscribes to one instruction channel and publishes events to
//! one event channel. The transport is an external collaborator behind
//! [`MessageBus`]; [`MemoryBus`] is the in-process implementation.

use crate::error::{Error, Result};
use crate::host::HostIdentity;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use virtnode_protocol::{
    EmitKind, Envelope, GuestPerfKind, GuestState, HostEvent, HostPerfKind, LogLevel, Response,
};

/// Publish/subscribe transport.
pub trait MessageBus: Send + Sync {
    /// Wait up to `timeout` for the next instruction.
    ///
    /// `Ok(None)` on timeout; [`Error::Transport`] when the transport is
    /// unreachable.
    fn receive(&self, timeout: Duration) -> Result<Option<Value>>;

    /// Publish `message` on `channel`.
    fn publish(&self, channel: &str, message: &Value) -> Result<()>;
}

/// In-process bus.
///
/// Instructions are injected with [`MemoryBus::push`]. The most recent
/// published messages are kept for inspection; older ones are dropped once
/// the retention limit is reached.
pub struct MemoryBus {
    inbound_tx: Sender<Value>,
    inbound_rx: Receiver<Value>,
    published: Mutex<VecDeque<(String, Value)>>,
    retained: usize,
    down: AtomicBool,
}

/// Published messages a [`MemoryBus`] keeps by default.
pub const DEFAULT_RETAINED: usize = 4096;

impl MemoryBus {
    /// Create an empty bus retaining [`DEFAULT_RETAINED`] messages.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED)
    }

    /// Create an empty bus retaining the last `retained` published messages.
    pub fn with_retention(retained: usize) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            published: Mutex::new(VecDeque::with_capacity(retained.min(DEFAULT_RETAINED))),
            retained,
            down: AtomicBool::new(false),
        }
    }

    /// Queue an instruction for delivery.
    pub fn push(&self, message: Value) {
        // Both ends live in self, so the channel cannot be disconnected
        let _ = self.inbound_tx.send(message);
    }

    /// Simulate the transport going away or coming back.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Retained messages published on `channel`, oldest first.
    pub fn published(&self, channel: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Number of instructions not yet received.
    pub fn pending(&self) -> usize {
        self.inbound_rx.len()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for MemoryBus {
    fn receive(&self, timeout: Duration) -> Result<Option<Value>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::transport("memory bus is down"));
        }
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::transport("memory bus closed")),
        }
    }

    fn publish(&self, channel: &str, message: &Value) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::transport("memory bus is down"));
        }
        let mut published = self.published.lock();
        if published.len() >= self.retained {
            published.pop_front();
        }
        if self.retained > 0 {
            published.push_back((channel.to_string(), message.clone()));
        }
        Ok(())
    }
}

/// Publishes enveloped events on the event channel.
#[derive(Clone)]
pub struct Emitter {
    bus: Arc<dyn MessageBus>,
    channel: String,
    identity: HostIdentity,
}

impl Emitter {
    /// Create an emitter for `identity` publishing on `channel`.
    pub fn new(bus: Arc<dyn MessageBus>, channel: impl Into<String>, identity: HostIdentity) -> Self {
        Self {
            bus,
            channel: channel.into(),
            identity,
        }
    }

    /// Identity stamped on every event.
    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Publish one event.
    pub fn emit(&self, kind: EmitKind, subtype: u8, message: Value) -> Result<()> {
        let envelope = Envelope {
            kind: kind as u8,
            subtype,
            timestamp: unix_now(),
            host: self.identity.hostname.clone(),
            node_id: self.identity.node_id,
            message,
        };
        self.bus.publish(&self.channel, &serde_json::to_value(&envelope)?)
    }

    /// Operator-visible log line. Failures to publish are logged locally.
    pub fn log(&self, level: LogLevel, message: &str) {
        if let Err(e) = self.emit(EmitKind::Log, level as u8, json!(message)) {
            tracing::warn!(error = %e, "failed to emit log event");
        }
    }

    /// Operator-visible error.
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Operator-visible warning.
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Operator-visible notice.
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Guest state change.
    pub fn guest_event(&self, state: GuestState, message: Value) -> Result<()> {
        self.emit(EmitKind::GuestEvent, state.code(), message)
    }

    /// Host event.
    pub fn host_event(&self, event: HostEvent, message: Value) -> Result<()> {
        self.emit(EmitKind::HostEvent, event as u8, message)
    }

    /// Instruction acknowledgment.
    pub fn response(&self, response: &Response) -> Result<()> {
        self.emit(EmitKind::Response, 0, serde_json::to_value(response)?)
    }

    /// Guest performance batch.
    pub fn guest_performance(&self, kind: GuestPerfKind, batch: Value) -> Result<()> {
        self.emit(EmitKind::GuestCollectionPerformance, kind as u8, batch)
    }

    /// Host performance batch.
    pub fn host_performance(&self, kind: HostPerfKind, batch: Value) -> Result<()> {
        self.emit(EmitKind::HostCollectionPerformance, kind as u8, batch)
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter(bus: &Arc<MemoryBus>) -> Emitter {
        let identity = HostIdentity {
            node_id: 9,
            hostname: "node-a".to_string(),
        };
        Emitter::new(bus.clone(), "C:Event", identity)
    }

    #[test]
    fn test_receive_times_out_with_none() {
        let bus = MemoryBus::new();
        assert!(bus.receive(Duration::from_millis(10)).unwrap().is_none());

        bus.push(json!({"action": "ping"}));
        assert_eq!(bus.pending(), 1);
        assert_eq!(
            bus.receive(Duration::from_millis(10)).unwrap(),
            Some(json!({"action": "ping"}))
        );
    }

    #[test]
    fn test_down_bus_reports_transport_error() {
        let bus = MemoryBus::new();
        bus.set_down(true);
        assert!(bus.receive(Duration::from_millis(10)).unwrap_err().is_transport());
        assert!(bus.publish("C:Event", &json!({})).unwrap_err().is_transport());
    }

    #[test]
    fn test_published_messages_are_capped() {
        let bus = MemoryBus::with_retention(3);
        for n in 0..5 {
            bus.publish("C:Event", &json!(n)).unwrap();
        }
        bus.publish("C:Instruction", &json!({"action": "pong"})).unwrap();

        assert_eq!(bus.published("C:Event"), [json!(3), json!(4)]);
        assert_eq!(bus.published("C:Instruction").len(), 1);

        let silent = MemoryBus::with_retention(0);
        silent.publish("C:Event", &json!(1)).unwrap();
        assert!(silent.published("C:Event").is_empty());
    }

    #[test]
    fn test_envelope_carries_kind_and_identity() {
        let bus = Arc::new(MemoryBus::new());
        emitter(&bus)
            .guest_performance(GuestPerfKind::Traffic, json!([{"uuid": "a"}]))
            .unwrap();

        let events = bus.published("C:Event");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["kind"], 4);
        assert_eq!(events[0]["type"], 1);
        assert_eq!(events[0]["host"], "node-a");
        assert_eq!(events[0]["node_id"], 9);
        assert_eq!(events[0]["message"][0]["uuid"], "a");
    }

    #[test]
    fn test_log_event_uses_level_as_type() {
        let bus = Arc::new(MemoryBus::new());
        emitter(&bus).error("disk full");

        let events = bus.published("C:Event");
        assert_eq!(events[0]["kind"], 0);
        assert_eq!(events[0]["type"], LogLevel::Error as u8);
        assert_eq!(events[0]["message"], "disk full");
    }
}
