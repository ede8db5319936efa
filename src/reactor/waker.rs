//! Self-signalling wake descriptor.
//!
//! A mutating thread writes to the descriptor to interrupt a reactor blocked
//! in `poll(2)`. Wakes coalesce: while one is pending and undrained, further
//! requests do not write.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Coalescing wake-up descriptor.
pub struct Waker {
    read: OwnedFd,
    #[cfg(not(target_os = "linux"))]
    write: OwnedFd,
    pending: AtomicBool,
}

impl Waker {
    /// Create a non-blocking wake descriptor.
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read: unsafe { OwnedFd::from_raw_fd(fd) },
            pending: AtomicBool::new(false),
        })
    }

    /// Create a non-blocking wake descriptor.
    #[cfg(not(target_os = "linux"))]
    pub fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [fds[0], fds[1]] {
            set_nonblocking_cloexec(fd)?;
        }
        Ok(Self {
            read,
            write,
            pending: AtomicBool::new(false),
        })
    }

    /// Descriptor to poll for readability.
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Request a wake.
    ///
    /// Returns `true` if this call wrote to the descriptor, `false` if a wake
    /// was already pending.
    pub fn wake(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.signal() {
            // A full pipe still wakes the poller
            if e.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %e, "failed to signal reactor wake descriptor");
            }
        }
        true
    }

    /// Whether a wake is pending and not yet drained.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Consume every pending wake.
    pub fn drain(&self) {
        // Clear first: a wake racing with the drain writes again rather than
        // being swallowed.
        self.pending.store(false, Ordering::Release);
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn signal(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.read.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn signal(&self) -> io::Result<()> {
        let byte = 0u8;
        let n = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
