// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! I/O readiness backend over the `select` system call.
//!
//! The most portable and by far the slowest mechanism: O(n) per wait and
//! hard-limited to descriptors below `FD_SETSIZE`. The set of live fds
//! is kept in an ordered set, so the max-fd argument is a lookup instead
//! of an fd_set scan. Last resort when nothing better probes
//! successfully.

use std::collections::BTreeSet;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use parking_lot::Mutex;

use crate::ioready::IoEvents;
use crate::ioready::dispatcher::{Backend, DispatcherCore};
use crate::sync::deferred::ReadGuard;

pub(crate) struct SelectBackend {
    sets: Mutex<SelectSets>,
}

struct SelectSets {
    read: libc::fd_set,
    write: libc::fd_set,
    /// Descriptors with a non-empty aggregate mask, ordered; `last()` is
    /// the max-fd for `select`.
    live: BTreeSet<RawFd>,
}

fn empty_fd_set() -> libc::fd_set {
    // Safety: fd_set is a plain bit array; all-zero is the empty set
    // (what FD_ZERO produces).
    let mut set = unsafe { mem::zeroed::<libc::fd_set>() };
    // Safety: `set` is a valid fd_set.
    unsafe { libc::FD_ZERO(&mut set) };
    set
}

fn timeout_to_timeval(timeout: Duration) -> libc::timeval {
    // round up so sub-microsecond timeouts do not busy-poll
    let mut secs = timeout.as_secs();
    let mut micros =
        u64::from(timeout.subsec_micros()) + u64::from(timeout.subsec_nanos() % 1_000 != 0);
    if micros == 1_000_000 {
        secs += 1;
        micros = 0;
    }
    libc::timeval {
        tv_sec: secs.try_into().unwrap_or(libc::time_t::MAX),
        tv_usec: micros as libc::suseconds_t,
    }
}

// === impl SelectBackend ===

impl Backend for SelectBackend {
    const NAME: &'static str = "select";
    // the wait works on a snapshot; concurrent changes need a kick
    const NEEDS_WAKEUP_ON_UPDATE: bool = true;

    fn new() -> io::Result<Self> {
        Ok(Self {
            sets: Mutex::new(SelectSets {
                read: empty_fd_set(),
                write: empty_fd_set(),
                live: BTreeSet::new(),
            }),
        })
    }

    fn update_registration(&self, fd: RawFd, _old_mask: IoEvents, new_mask: IoEvents) {
        assert!(
            (fd as usize) < libc::FD_SETSIZE as usize,
            "descriptor {fd} beyond FD_SETSIZE, not watchable via select"
        );
        let mut sets = self.sets.lock();
        // Safety: fd is within FD_SETSIZE and the sets are valid.
        unsafe {
            if new_mask.contains(IoEvents::INPUT) {
                libc::FD_SET(fd, &mut sets.read);
            } else {
                libc::FD_CLR(fd, &mut sets.read);
            }
            if new_mask.contains(IoEvents::OUTPUT) {
                libc::FD_SET(fd, &mut sets.write);
            } else {
                libc::FD_CLR(fd, &mut sets.write);
            }
        }
        if new_mask.is_empty() {
            sets.live.remove(&fd);
        } else {
            sets.live.insert(fd);
        }
    }

    fn dispatch(core: &DispatcherCore<Self>, timeout: Option<Duration>, limit: usize) -> usize {
        let _guard = ReadGuard::new(core);

        let cookie = core.fdtab.cookie();
        let (mut read, mut write, max_fd) = {
            let sets = core.backend.sets.lock();
            (sets.read, sets.write, sets.live.last().copied().unwrap_or(-1))
        };

        let mut tv;
        let mut tv_ptr = core::ptr::null_mut();
        if let Some(timeout) = timeout {
            tv = timeout_to_timeval(timeout);
            tv_ptr = &mut tv;
        }

        core.wakeup_flag.start_waiting();
        if core.wakeup_flag.flagged() {
            tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
            tv_ptr = &mut tv;
        }
        // Safety: the snapshot sets and timeout outlive the call.
        let count = unsafe {
            libc::select(
                max_fd + 1,
                &mut read,
                &mut write,
                core::ptr::null_mut(),
                tv_ptr,
            )
        };
        core.wakeup_flag.stop_waiting();

        let handled = handle_events(core, &read, &write, max_fd, count, limit, cookie);

        core.wakeup_flag.clear();
        handled
    }

    fn dispatch_pending(core: &DispatcherCore<Self>, limit: usize) -> usize {
        let _guard = ReadGuard::new(core);

        let cookie = core.fdtab.cookie();
        let (mut read, mut write, max_fd) = {
            let sets = core.backend.sets.lock();
            (sets.read, sets.write, sets.live.last().copied().unwrap_or(-1))
        };

        let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        // Safety: see `dispatch`.
        let count = unsafe {
            libc::select(
                max_fd + 1,
                &mut read,
                &mut write,
                core::ptr::null_mut(),
                &mut tv,
            )
        };

        handle_events(core, &read, &write, max_fd, count, limit, cookie)
    }
}

/// Dispatches the descriptors left set by a completed `select`. The
/// caller holds the read lock.
fn handle_events(
    core: &DispatcherCore<SelectBackend>,
    read: &libc::fd_set,
    write: &libc::fd_set,
    max_fd: RawFd,
    count: libc::c_int,
    limit: usize,
    cookie: u32,
) -> usize {
    if count <= 0 {
        return 0;
    }
    let mut handled = 0;
    for fd in 0..=max_fd {
        if handled >= limit {
            break;
        }
        let mut events = IoEvents::empty();
        // Safety: fd is within FD_SETSIZE, the sets are valid.
        unsafe {
            if libc::FD_ISSET(fd, read) {
                events |= IoEvents::INPUT;
            }
            if libc::FD_ISSET(fd, write) {
                events |= IoEvents::OUTPUT;
            }
        }
        if !events.is_empty() {
            core.fdtab.notify(fd, events, cookie);
            handled += 1;
        }
    }
    handled
}
