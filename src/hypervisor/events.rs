//! Domain lifecycle events.

use serde_json::{json, Value};
use virtnode_protocol::GuestState;

const EVENT_NAMES: [&str; 9] = [
    "Defined",
    "Undefined",
    "Started",
    "Suspended",
    "Resumed",
    "Stopped",
    "Shutdown",
    "PMSuspended",
    "Crashed",
];

const DETAIL_NAMES: [&[&str]; 9] = [
    &["Added", "Updated", "Renamed", "Snapshot"],
    &["Removed", "Renamed"],
    &["Booted", "Migrated", "Restored", "Snapshot", "Wakeup"],
    &["Paused", "Migrated", "IOError", "Watchdog", "Restored", "Snapshot", "API error"],
    &["Unpaused", "Migrated", "Snapshot"],
    &["Shutdown", "Destroyed", "Crashed", "Migrated", "Saved", "Failed", "Snapshot"],
    &["Finished", "Guest", "Host"],
    &["Memory", "Disk"],
    &["Panicked"],
];

/// Name of a lifecycle event code.
pub fn event_name(event: u32) -> &'static str {
    EVENT_NAMES.get(event as usize).copied().unwrap_or("Unknown")
}

/// Name of a detail code within a lifecycle event.
pub fn detail_name(event: u32, detail: u32) -> &'static str {
    DETAIL_NAMES
        .get(event as usize)
        .and_then(|details| details.get(detail as usize))
        .copied()
        .unwrap_or("Unknown")
}

/// A lifecycle change reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Guest the event concerns.
    pub uuid: String,
    /// Event code.
    pub event: u32,
    /// Detail code within the event.
    pub detail: u32,
}

impl LifecycleEvent {
    /// State the guest is left in by this event.
    pub fn guest_state(&self) -> GuestState {
        match self.event {
            0 | 5 => GuestState::Shutoff,
            2 | 4 => GuestState::Running,
            3 => GuestState::Paused,
            6 => GuestState::Shutdown,
            7 => GuestState::PmSuspended,
            8 => GuestState::Crashed,
            _ => GuestState::NoState,
        }
    }

    /// Body of the `guest_event` record.
    pub fn to_message(&self) -> Value {
        json!({
            "uuid": self.uuid,
            "event": event_name(self.event),
            "detail": detail_name(self.event, self.detail),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_have_names() {
        assert_eq!(event_name(2), "Started");
        assert_eq!(detail_name(2, 0), "Booted");
        assert_eq!(detail_name(3, 6), "API error");
        assert_eq!(detail_name(8, 0), "Panicked");
    }

    #[test]
    fn test_unknown_codes_do_not_panic() {
        assert_eq!(event_name(99), "Unknown");
        assert_eq!(detail_name(8, 1), "Unknown");
        assert_eq!(detail_name(99, 0), "Unknown");
    }

    #[test]
    fn test_message_carries_names() {
        let event = LifecycleEvent {
            uuid: "a".to_string(),
            event: 5,
            detail: 1,
        };
        let msg = event.to_message();
        assert_eq!(msg["event"], "Stopped");
        assert_eq!(msg["detail"], "Destroyed");
        assert_eq!(event.guest_state(), GuestState::Shutoff);
    }
}
