//! Event reactor driving hypervisor callback delivery.
//!
//! The hypervisor library does not own an event loop; it registers file
//! descriptors and timers with one through the six primitives of
//! [`EventLoopImpl`]. [`Reactor`] is that loop: level-triggered `poll(2)` over
//! the registered descriptors plus a coalesced periodic-timer scheduler.
//!
//! # Tick
//!
//! 1. Release opaque contexts of handles and timers removed during the
//!    previous tick.
//! 2. Sleep until the nearest enabled timer is due, or indefinitely.
//! 3. Dispatch ready descriptors; the wake descriptor is only drained.
//! 4. Fire due timers.
//!
//! Registration may happen from any thread, including from inside a
//! callback. The registry lock is never held while a callback runs, and every
//! mutation wakes a sleeping reactor.

mod waker;

pub use waker::Waker;

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Timers due within this margin fire in the current tick.
pub const TIMER_SLACK: Duration = Duration::from_millis(20);

/// Identifier of a registered descriptor.
pub type HandleId = u64;

/// Identifier of a registered timer.
pub type TimerId = u64;

/// Callback for descriptor activity.
pub type HandleCallback = Box<dyn FnMut(HandleId, RawFd, EventMask) + Send>;

/// Callback for timer expiry.
pub type TimerCallback = Box<dyn FnMut(TimerId) + Send>;

/// Descriptor interest and readiness.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// No events.
    pub const NONE: EventMask = EventMask(0);
    /// Data available to read.
    pub const READABLE: EventMask = EventMask(1);
    /// Writing will not block.
    pub const WRITABLE: EventMask = EventMask(2);
    /// Error condition.
    pub const ERROR: EventMask = EventMask(4);
    /// Peer hung up.
    pub const HANGUP: EventMask = EventMask(8);

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    pub fn from_bits_truncate(bits: u32) -> Self {
        EventMask(bits & 0xf)
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Translate to `poll(2)` event bits.
    pub fn to_poll(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Self::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(Self::WRITABLE) {
            events |= libc::POLLOUT;
        }
        if self.contains(Self::ERROR) {
            events |= libc::POLLERR;
        }
        if self.contains(Self::HANGUP) {
            events |= libc::POLLHUP;
        }
        events
    }

    /// Translate `poll(2)` revents.
    pub fn from_poll(revents: libc::c_short) -> Self {
        let mut mask = Self::NONE;
        if revents & libc::POLLIN != 0 {
            mask |= Self::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            mask |= Self::WRITABLE;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            mask |= Self::ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            mask |= Self::HANGUP;
        }
        mask
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::ERROR, "ERROR"),
            (Self::HANGUP, "HANGUP"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            f.write_str("EventMask(NONE)")
        } else {
            write!(f, "EventMask({})", names.join(" | "))
        }
    }
}

/// Caller context attached to a registration.
///
/// Dropped one full tick after the registration is removed, running its
/// free function if one was supplied.
pub struct Opaque {
    data: Option<Box<dyn Any + Send>>,
    free: Option<Box<dyn FnOnce(Box<dyn Any + Send>) + Send>>,
}

impl Opaque {
    /// Wrap `data`; it is simply dropped on release.
    pub fn new<T: Any + Send>(data: T) -> Self {
        Self {
            data: Some(Box::new(data)),
            free: None,
        }
    }

    /// Wrap `data` with a function that receives it on release.
    pub fn with_free<T, F>(data: T, free: F) -> Self
    where
        T: Any + Send,
        F: FnOnce(Box<dyn Any + Send>) + Send + 'static,
    {
        Self {
            data: Some(Box::new(data)),
            free: Some(Box::new(free)),
        }
    }

    /// Borrow the wrapped value.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref::<T>()
    }
}

impl Drop for Opaque {
    fn drop(&mut self) {
        if let (Some(data), Some(free)) = (self.data.take(), self.free.take()) {
            free(data);
        }
    }
}

/// The six registration primitives the hypervisor event API calls.
pub trait EventLoopImpl: Send + Sync {
    /// Watch `fd` for `interest`. Returns a never-reused id.
    fn add_handle(
        &self,
        fd: RawFd,
        interest: EventMask,
        callback: HandleCallback,
        opaque: Option<Opaque>,
    ) -> HandleId;

    /// Change the interest of a watched descriptor.
    fn update_handle(&self, id: HandleId, interest: EventMask);

    /// Stop watching. Returns `false` for an unknown id.
    fn remove_handle(&self, id: HandleId) -> bool;

    /// Fire `callback` every `interval_ms`; negative disables. Returns a
    /// never-reused id.
    fn add_timer(&self, interval_ms: i64, callback: TimerCallback, opaque: Option<Opaque>)
        -> TimerId;

    /// Change a timer's interval.
    fn update_timer(&self, id: TimerId, interval_ms: i64);

    /// Cancel a timer. Returns `false` for an unknown id.
    fn remove_timer(&self, id: TimerId) -> bool;
}

struct HandleEntry {
    id: HandleId,
    fd: RawFd,
    interest: EventMask,
    // None while the callback is running
    callback: Option<HandleCallback>,
    opaque: Option<Opaque>,
}

struct TimerEntry {
    id: TimerId,
    interval_ms: i64,
    last_fired: Option<Instant>,
    callback: Option<TimerCallback>,
    opaque: Option<Opaque>,
}

impl TimerEntry {
    fn deadline(&self, now: Instant) -> Option<Instant> {
        if self.interval_ms < 0 {
            return None;
        }
        Some(match self.last_fired {
            Some(last) => last + Duration::from_millis(self.interval_ms as u64),
            None => now,
        })
    }
}

#[derive(Default)]
struct Registry {
    handles: Vec<HandleEntry>,
    timers: Vec<TimerEntry>,
    next_handle: HandleId,
    next_timer: TimerId,
    cleanup: Vec<Opaque>,
}

/// Poll-based event loop.
pub struct Reactor {
    registry: Mutex<Registry>,
    waker: Waker,
}

impl Reactor {
    /// Create an empty reactor.
    pub fn new() -> Result<Self> {
        Ok(Self {
            registry: Mutex::new(Registry::default()),
            waker: Waker::new().map_err(Error::Reactor)?,
        })
    }

    /// Interrupt a blocked tick without changing any registration.
    pub fn interrupt(&self) {
        self.waker.wake();
    }

    /// Number of live descriptor registrations.
    pub fn handle_count(&self) -> usize {
        self.registry.lock().handles.len()
    }

    /// Number of live timer registrations.
    pub fn timer_count(&self) -> usize {
        self.registry.lock().timers.len()
    }

    /// Run ticks until `shutdown` is raised.
    ///
    /// Raise the flag then call [`Reactor::interrupt`] to stop promptly.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        tracing::info!("reactor started");
        while !shutdown.load(Ordering::Acquire) {
            self.run_once()?;
        }
        tracing::info!("reactor stopped");
        Ok(())
    }

    /// Run one tick.
    pub fn run_once(&self) -> Result<()> {
        // Released outside the lock: free functions may re-enter the reactor.
        let released = std::mem::take(&mut self.registry.lock().cleanup);
        drop(released);

        let (mut fds, ids, timeout) = self.prepare();

        let ready = loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "poll failed");
            return Err(Error::Reactor(err));
        };

        if ready > 0 {
            for (pfd, id) in fds.iter().zip(ids.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                match id {
                    None => self.waker.drain(),
                    Some(id) => self.dispatch_handle(*id, pfd.fd, EventMask::from_poll(pfd.revents)),
                }
            }
        }

        self.dispatch_timers();
        Ok(())
    }

    /// Build the poll set and compute the poll timeout in milliseconds.
    fn prepare(&self) -> (Vec<libc::pollfd>, Vec<Option<HandleId>>, libc::c_int) {
        let registry = self.registry.lock();

        let mut fds = Vec::with_capacity(registry.handles.len() + 1);
        let mut ids = Vec::with_capacity(registry.handles.len() + 1);
        fds.push(libc::pollfd {
            fd: self.waker.fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        ids.push(None);
        for handle in &registry.handles {
            fds.push(libc::pollfd {
                fd: handle.fd,
                events: handle.interest.to_poll(),
                revents: 0,
            });
            ids.push(Some(handle.id));
        }

        let now = Instant::now();
        let timeout = registry
            .timers
            .iter()
            .filter_map(|t| t.deadline(now))
            .min()
            .map(|deadline| {
                let wait = deadline.saturating_duration_since(now);
                // Round up so a not-quite-due timer does not spin
                let ms = (wait.as_micros() + 999) / 1000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        (fds, ids, timeout)
    }

    fn dispatch_handle(&self, id: HandleId, fd: RawFd, events: EventMask) {
        let callback = {
            let mut registry = self.registry.lock();
            match registry.handles.iter_mut().find(|h| h.id == id) {
                Some(handle) => handle.callback.take(),
                None => None,
            }
        };
        let Some(mut callback) = callback else {
            return;
        };

        callback(id, fd, events);

        let mut registry = self.registry.lock();
        if let Some(handle) = registry.handles.iter_mut().find(|h| h.id == id) {
            handle.callback = Some(callback);
        }
    }

    fn dispatch_timers(&self) {
        let now = Instant::now();
        let due: Vec<TimerId> = {
            let mut registry = self.registry.lock();
            registry
                .timers
                .iter_mut()
                .filter(|t| matches!(t.deadline(now), Some(d) if d <= now + TIMER_SLACK))
                .map(|t| {
                    t.last_fired = Some(now);
                    t.id
                })
                .collect()
        };

        for id in due {
            let callback = {
                let mut registry = self.registry.lock();
                match registry.timers.iter_mut().find(|t| t.id == id) {
                    Some(timer) => timer.callback.take(),
                    None => None,
                }
            };
            let Some(mut callback) = callback else {
                continue;
            };

            callback(id);

            let mut registry = self.registry.lock();
            if let Some(timer) = registry.timers.iter_mut().find(|t| t.id == id) {
                timer.callback = Some(callback);
            }
        }
    }
}

impl EventLoopImpl for Reactor {
    fn add_handle(
        &self,
        fd: RawFd,
        interest: EventMask,
        callback: HandleCallback,
        opaque: Option<Opaque>,
    ) -> HandleId {
        let id = {
            let mut registry = self.registry.lock();
            registry.next_handle += 1;
            let id = registry.next_handle;
            registry.handles.push(HandleEntry {
                id,
                fd,
                interest,
                callback: Some(callback),
                opaque,
            });
            id
        };
        tracing::debug!(id, fd, ?interest, "added handle");
        self.waker.wake();
        id
    }

    fn update_handle(&self, id: HandleId, interest: EventMask) {
        let found = {
            let mut registry = self.registry.lock();
            match registry.handles.iter_mut().find(|h| h.id == id) {
                Some(handle) => {
                    handle.interest = interest;
                    true
                }
                None => false,
            }
        };
        if found {
            self.waker.wake();
        } else {
            tracing::debug!(id, "update of unknown handle ignored");
        }
    }

    fn remove_handle(&self, id: HandleId) -> bool {
        {
            let mut registry = self.registry.lock();
            let Some(pos) = registry.handles.iter().position(|h| h.id == id) else {
                tracing::debug!(id, "removal of unknown handle ignored");
                return false;
            };
            let entry = registry.handles.remove(pos);
            if let Some(opaque) = entry.opaque {
                registry.cleanup.push(opaque);
            }
            tracing::debug!(id, fd = entry.fd, "removed handle");
        }
        self.waker.wake();
        true
    }

    fn add_timer(
        &self,
        interval_ms: i64,
        callback: TimerCallback,
        opaque: Option<Opaque>,
    ) -> TimerId {
        let id = {
            let mut registry = self.registry.lock();
            registry.next_timer += 1;
            let id = registry.next_timer;
            registry.timers.push(TimerEntry {
                id,
                interval_ms,
                last_fired: None,
                callback: Some(callback),
                opaque,
            });
            id
        };
        tracing::debug!(id, interval_ms, "added timer");
        self.waker.wake();
        id
    }

    fn update_timer(&self, id: TimerId, interval_ms: i64) {
        let found = {
            let mut registry = self.registry.lock();
            match registry.timers.iter_mut().find(|t| t.id == id) {
                Some(timer) => {
                    timer.interval_ms = interval_ms;
                    true
                }
                None => false,
            }
        };
        if found {
            self.waker.wake();
        } else {
            tracing::debug!(id, "update of unknown timer ignored");
        }
    }

    fn remove_timer(&self, id: TimerId) -> bool {
        {
            let mut registry = self.registry.lock();
            let Some(pos) = registry.timers.iter().position(|t| t.id == id) else {
                tracing::debug!(id, "removal of unknown timer ignored");
                return false;
            };
            let entry = registry.timers.remove(pos);
            if let Some(opaque) = entry.opaque {
                registry.cleanup.push(opaque);
            }
            tracing::debug!(id, "removed timer");
        }
        self.waker.wake();
        true
    }
}
