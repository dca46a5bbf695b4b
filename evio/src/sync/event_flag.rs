// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use parking_lot::{Condvar, Mutex};

use crate::loom::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use crate::syscall::syscall;

/// Something whose [`set`](Self::set) triggers an event, typically waking
/// a thread blocked in a dispatch call.
///
/// Triggers handed out for use with the async-safe work machinery are
/// async-signal safe: their `set` may be called from a signal handler.
pub trait EventTrigger: Send + Sync {
    /// Trigger the event.
    fn set(&self);
}

/// Single-bit wait/notify primitive.
///
/// An event flag is either *set* or *cleared*. [`wait`](Self::wait) on a
/// set flag does not block; on a cleared flag it blocks until
/// [`set`](Self::set) is called. In contrast to a condition variable the
/// flag is stateful, so a `set` that happens before the `wait` is never
/// lost, at the price of requiring correct `clear` placement in the
/// consumer loop.
pub trait EventFlag: EventTrigger {
    /// Clear the flag; subsequent [`wait`](Self::wait) calls block until
    /// the next [`set`](EventTrigger::set).
    fn clear(&self);

    /// Block until the flag is set. Returns immediately if it already is.
    fn wait(&self);
}

/// Event flag backed by a control pipe, cooperating with I/O dispatching.
///
/// `set` is async-signal safe and wait-free. The read end of the pipe
/// ([`read_fd`](Self::read_fd)) becomes readable when the flag is set
/// while a waiter is registered, which is how a blocked `poll`/`epoll`
/// call gets interrupted.
///
/// Wire state of `flagged`:
/// - `0`: cleared
/// - `1`: set, no byte in the pipe
/// - `2`: set, one byte in the pipe
///
/// `set` transitions 0 → 1 (release) and, if waiters are registered,
/// 1 → 2 followed by writing one byte. `clear` transitions non-zero → 0
/// (acquire) and drains the byte if the previous state was 2.
pub struct PipeEventFlag {
    read: OwnedFd,
    write: OwnedFd,
    flagged: AtomicI32,
    waiting: AtomicUsize,
}

/// Busy-waiting event flag: a bare atomic, no wakeup channel.
///
/// `set` is async-signal safe. Prefer [`PipeEventFlag`] or
/// [`SyncEventFlag`] wherever a real wait is needed; `wait` here spins.
pub struct SpinEventFlag {
    state: AtomicBool,
}

/// Event flag built on a mutex and condition variable.
///
/// Blocks properly but its `set` takes a mutex and is therefore *not*
/// async-signal safe.
pub struct SyncEventFlag {
    flagged: Mutex<bool>,
    cond: Condvar,
}

// === impl PipeEventFlag ===

impl PipeEventFlag {
    /// Creates the flag in cleared state.
    ///
    /// Fails if the process is out of file descriptors.
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
        // Safety: `pipe2` just handed us ownership of both descriptors.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            read,
            write,
            flagged: AtomicI32::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    /// File descriptor that becomes readable when the flag is set while a
    /// waiter is registered via [`start_waiting`](Self::start_waiting).
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Set the flag, waking all waiting threads. Async-signal safe.
    pub fn set(&self) {
        // fast path (avoids the write memory op) if already set
        if self.flagged.load(Ordering::Relaxed) != 0 {
            return;
        }

        // only one setter may observe the 0 -> 1 transition, otherwise a
        // spurious wakeup byte could be written
        if self
            .flagged
            .compare_exchange(0, 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        // no one was waiting before the transition, so no one to wake
        if self.waiting.load(Ordering::Relaxed) == 0 {
            return;
        }

        self.set_slow();
    }

    /// Clear the flag.
    pub fn clear(&self) {
        let mut old = self.flagged.load(Ordering::Relaxed);
        loop {
            if old == 0 {
                return;
            }
            // the application tests its wakeup condition right after
            // clearing; acquire keeps the test from being reordered
            // before the clear
            match self
                .flagged
                .compare_exchange(old, 0, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(changed) => old = changed,
            }
        }
        if old == 1 {
            return;
        }
        self.clear_slow();
    }

    /// Block until the flag is set.
    pub fn wait(&self) {
        if self.flagged.load(Ordering::Acquire) != 0 {
            return;
        }
        self.wait_slow();
    }

    /// Register the calling thread as a waiter; [`set`](Self::set) posts
    /// a wakeup byte only while at least one waiter is registered.
    pub fn start_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove the registration made by [`start_waiting`](Self::start_waiting).
    pub fn stop_waiting(&self) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether the flag is currently set.
    pub fn flagged(&self) -> bool {
        self.flagged.load(Ordering::Relaxed) != 0
    }

    #[cold]
    fn set_slow(&self) {
        // at least one thread is waiting, so a wakeup byte has to be
        // posted; whoever clears the flag drains the pipe again
        if self
            .flagged
            .compare_exchange(1, 2, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let byte = 0u8;
        loop {
            // Safety: writing one byte from a live stack location to a
            // descriptor we own. Only raw libc here: this path must stay
            // async-signal safe.
            let n = unsafe {
                libc::write(
                    self.write.as_raw_fd(),
                    core::ptr::from_ref(&byte).cast(),
                    1,
                )
            };
            if n == 1 {
                break;
            }
        }
    }

    #[cold]
    fn wait_slow(&self) {
        self.start_waiting();

        if self.flagged.load(Ordering::Acquire) == 0 {
            let mut pfd = libc::pollfd {
                fd: self.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            loop {
                // Safety: `pfd` is a live stack location.
                unsafe { libc::poll(&mut pfd, 1, -1) };
                if pfd.revents & libc::POLLIN != 0 {
                    break;
                }
            }
        }

        self.stop_waiting();
    }

    #[cold]
    fn clear_slow(&self) {
        // a wakeup byte was posted the last time the flag was raised;
        // drain the control pipe
        let mut byte = 0u8;
        loop {
            // Safety: reading one byte into a live stack location from a
            // descriptor we own.
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    core::ptr::from_mut(&mut byte).cast(),
                    1,
                )
            };
            if n == 1 {
                break;
            }
        }
    }
}

impl EventTrigger for PipeEventFlag {
    fn set(&self) {
        PipeEventFlag::set(self);
    }
}

impl EventFlag for PipeEventFlag {
    fn clear(&self) {
        PipeEventFlag::clear(self);
    }

    fn wait(&self) {
        PipeEventFlag::wait(self);
    }
}

// === impl SpinEventFlag ===

impl SpinEventFlag {
    util::loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                state: AtomicBool::new(false),
            }
        }
    }

    /// Whether the flag is currently set.
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

impl EventTrigger for SpinEventFlag {
    fn set(&self) {
        self.state.store(true, Ordering::Release);
    }
}

impl EventFlag for SpinEventFlag {
    fn clear(&self) {
        self.state.store(false, Ordering::Relaxed);
    }

    fn wait(&self) {
        while !self.state.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

impl Default for SpinEventFlag {
    fn default() -> Self {
        Self::new()
    }
}

// === impl SyncEventFlag ===

impl SyncEventFlag {
    pub fn new() -> Self {
        Self {
            flagged: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl EventTrigger for SyncEventFlag {
    fn set(&self) {
        let mut flagged = self.flagged.lock();
        *flagged = true;
        self.cond.notify_all();
    }
}

impl EventFlag for SyncEventFlag {
    fn clear(&self) {
        *self.flagged.lock() = false;
    }

    fn wait(&self) {
        let mut flagged = self.flagged.lock();
        while !*flagged {
            self.cond.wait(&mut flagged);
        }
    }
}

impl Default for SyncEventFlag {
    fn default() -> Self {
        Self::new()
    }
}
