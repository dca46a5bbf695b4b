// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! I/O readiness backend over the `poll` system call.
//!
//! Considerably better than `select`, but O(n) in the number of watched
//! descriptors per wait. The poll table is snapshotted for every wait,
//! so registration changes from other threads take effect on the next
//! iteration; that is why every change also sets the wakeup flag.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use parking_lot::Mutex;

use crate::ioready::IoEvents;
use crate::ioready::dispatcher::{Backend, DispatcherCore, timeout_to_millis};
use crate::sync::deferred::ReadGuard;

const NO_ENTRY: usize = usize::MAX;

pub(crate) struct PollBackend {
    polltab: Mutex<PollTab>,
}

/// Dense `pollfd` array plus an fd → index map. One entry per fd with a
/// non-empty aggregate mask.
struct PollTab {
    entries: Vec<libc::pollfd>,
    index: Vec<usize>,
}

fn translate_os_to_events(ev: libc::c_short) -> IoEvents {
    let mut events = IoEvents::empty();
    if ev & libc::POLLIN != 0 {
        events |= IoEvents::INPUT;
    }
    if ev & libc::POLLOUT != 0 {
        events |= IoEvents::OUTPUT;
    }
    // deliver hangup and error to input and output observers as well
    if ev & libc::POLLHUP != 0 {
        events |= IoEvents::INPUT | IoEvents::OUTPUT | IoEvents::HANGUP | IoEvents::ERROR;
    }
    if ev & libc::POLLERR != 0 {
        events |= IoEvents::INPUT | IoEvents::OUTPUT | IoEvents::ERROR;
    }
    events
}

fn translate_events_to_os(events: IoEvents) -> libc::c_short {
    let mut ev = 0;
    if events.contains(IoEvents::INPUT) {
        ev |= libc::POLLIN;
    }
    if events.contains(IoEvents::OUTPUT) {
        ev |= libc::POLLOUT;
    }
    ev
}

// === impl PollTab ===

impl PollTab {
    fn allocate(&mut self, fd: RawFd) {
        let index = fd as usize;
        if index >= self.index.len() {
            self.index.resize(index + 1, NO_ENTRY);
        }
        debug_assert_eq!(self.index[index], NO_ENTRY);
        self.index[index] = self.entries.len();
        self.entries.push(libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        });
    }

    fn update(&mut self, fd: RawFd, events: libc::c_short) {
        let entry = self.index[fd as usize];
        self.entries[entry].events = events;
    }

    fn free(&mut self, fd: RawFd) {
        let entry = self.index[fd as usize];
        self.index[fd as usize] = NO_ENTRY;
        // keep the array dense: move the tail entry into the hole
        self.entries.swap_remove(entry);
        if entry < self.entries.len() {
            let moved_fd = self.entries[entry].fd;
            self.index[moved_fd as usize] = entry;
        }
    }
}

// === impl PollBackend ===

impl Backend for PollBackend {
    const NAME: &'static str = "poll";
    // the wait works on a snapshot; concurrent changes need a kick
    const NEEDS_WAKEUP_ON_UPDATE: bool = true;

    fn new() -> io::Result<Self> {
        Ok(Self {
            polltab: Mutex::new(PollTab {
                entries: Vec::new(),
                index: Vec::new(),
            }),
        })
    }

    fn update_registration(&self, fd: RawFd, old_mask: IoEvents, new_mask: IoEvents) {
        let mut polltab = self.polltab.lock();
        if old_mask.is_empty() && !new_mask.is_empty() {
            polltab.allocate(fd);
            polltab.update(fd, translate_events_to_os(new_mask));
        } else if !old_mask.is_empty() && new_mask.is_empty() {
            polltab.free(fd);
        } else if !new_mask.is_empty() {
            polltab.update(fd, translate_events_to_os(new_mask));
        }
    }

    fn dispatch(core: &DispatcherCore<Self>, timeout: Option<Duration>, limit: usize) -> usize {
        // the read lock is held across the wait; disconnectors kick us
        // via the wakeup flag, so the lock is never held much longer
        // than the work at hand
        let _guard = ReadGuard::new(core);

        let cookie = core.fdtab.cookie();
        let mut snapshot = core.backend.polltab.lock().entries.clone();

        let mut poll_timeout = timeout_to_millis(timeout);

        core.wakeup_flag.start_waiting();
        if core.wakeup_flag.flagged() {
            poll_timeout = 0;
        }
        // Safety: the snapshot outlives the call.
        let count = unsafe {
            libc::poll(
                snapshot.as_mut_ptr(),
                snapshot.len() as libc::nfds_t,
                poll_timeout,
            )
        };
        core.wakeup_flag.stop_waiting();

        let handled = handle_events(core, &snapshot, count, limit, cookie);

        core.wakeup_flag.clear();
        handled
    }

    fn dispatch_pending(core: &DispatcherCore<Self>, limit: usize) -> usize {
        let _guard = ReadGuard::new(core);

        let cookie = core.fdtab.cookie();
        let mut snapshot = core.backend.polltab.lock().entries.clone();

        // Safety: the snapshot outlives the call.
        let count = unsafe {
            libc::poll(snapshot.as_mut_ptr(), snapshot.len() as libc::nfds_t, 0)
        };

        handle_events(core, &snapshot, count, limit, cookie)
    }
}

/// Dispatches the ready entries of a completed `poll`. The caller holds
/// the read lock.
fn handle_events(
    core: &DispatcherCore<PollBackend>,
    snapshot: &[libc::pollfd],
    count: libc::c_int,
    limit: usize,
    cookie: u32,
) -> usize {
    if count <= 0 {
        return 0;
    }
    let mut remaining = count as usize;
    let mut handled = 0;

    for pfd in snapshot {
        if handled >= limit || remaining == 0 {
            break;
        }
        if pfd.revents != 0 {
            remaining -= 1;
            core.fdtab
                .notify(pfd.fd, translate_os_to_events(pfd.revents), cookie);
            handled += 1;
        }
    }
    handled
}
