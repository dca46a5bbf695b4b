// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! I/O readiness backend over the `epoll_*` family of system calls.
//!
//! The fastest mechanism on Linux: registration maintenance and the wait
//! are both O(1) in the number of watched descriptors, and multiple
//! threads can usefully block in [`dispatch`](Backend::dispatch) at the
//! same time: the kernel distributes ready events among them.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::ioready::IoEvents;
use crate::ioready::dispatcher::{Backend, DispatcherCore, timeout_to_millis};
use crate::sync::deferred::ReadGuard;
use crate::syscall::syscall;

pub(crate) struct EpollBackend {
    epoll_fd: OwnedFd,
}

fn translate_os_to_events(ev: u32) -> IoEvents {
    let mut events = IoEvents::empty();
    if ev & libc::EPOLLIN as u32 != 0 {
        events |= IoEvents::INPUT;
    }
    if ev & libc::EPOLLOUT as u32 != 0 {
        events |= IoEvents::OUTPUT;
    }
    // deliver hangup and error to input and output observers as well
    if ev & libc::EPOLLHUP as u32 != 0 {
        events |= IoEvents::INPUT | IoEvents::OUTPUT | IoEvents::HANGUP | IoEvents::ERROR;
    }
    if ev & libc::EPOLLERR as u32 != 0 {
        events |= IoEvents::INPUT | IoEvents::OUTPUT | IoEvents::ERROR;
    }
    events
}

fn translate_events_to_os(events: IoEvents) -> u32 {
    let mut ev = 0;
    if events.contains(IoEvents::INPUT) {
        ev |= libc::EPOLLIN as u32;
    }
    if events.contains(IoEvents::OUTPUT) {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

impl EpollBackend {
    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32) {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u32 as u64,
        };
        if let Err(error) = syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event)) {
            tracing::warn!(fd, op, %error, "epoll_ctl failed");
        }
    }

    fn collect(
        core: &DispatcherCore<Self>,
        events: &[libc::epoll_event],
        cookie: u32,
    ) -> usize {
        let _guard = ReadGuard::new(core);
        for event in events {
            let fd = event.u64 as u32 as RawFd;
            core.fdtab.notify(fd, translate_os_to_events(event.events), cookie);
        }
        events.len()
    }
}

impl Backend for EpollBackend {
    const NAME: &'static str = "epoll";
    // epoll_ctl changes take effect for already-blocked waiters
    const NEEDS_WAKEUP_ON_UPDATE: bool = false;

    fn new() -> io::Result<Self> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // Safety: `epoll_create1` handed us ownership of the descriptor.
        Ok(Self {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn update_registration(&self, fd: RawFd, old_mask: IoEvents, new_mask: IoEvents) {
        // Decisions are made on the library-level masks: a registration
        // interested only in hangup/error maps to zero epoll bits but
        // must still be added; EPOLLHUP/EPOLLERR are always reported.
        if old_mask == new_mask {
            return;
        }
        if old_mask.is_empty() {
            if !new_mask.is_empty() {
                self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, translate_events_to_os(new_mask));
            }
        } else if new_mask.is_empty() {
            self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0);
        } else {
            self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, translate_events_to_os(new_mask));
        }
    }

    fn dispatch(core: &DispatcherCore<Self>, timeout: Option<Duration>, limit: usize) -> usize {
        let cookie = core.fdtab.cookie();

        let mut poll_timeout = timeout_to_millis(timeout);
        let limit = limit.min(16);
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];

        core.wakeup_flag.start_waiting();
        if core.wakeup_flag.flagged() {
            poll_timeout = 0;
        }
        // Safety: the event buffer outlives the call and `limit` bounds it.
        let nevents = unsafe {
            libc::epoll_wait(
                core.backend.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                limit as libc::c_int,
                poll_timeout,
            )
        };
        core.wakeup_flag.stop_waiting();

        let handled = if nevents > 0 {
            Self::collect(core, &events[..nevents as usize], cookie)
        } else {
            0
        };

        core.wakeup_flag.clear();
        handled
    }

    fn dispatch_pending(core: &DispatcherCore<Self>, limit: usize) -> usize {
        let cookie = core.fdtab.cookie();

        let limit = limit.min(16);
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];

        // Safety: see `dispatch`.
        let nevents = unsafe {
            libc::epoll_wait(
                core.backend.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                limit as libc::c_int,
                0,
            )
        };

        let handled = if nevents > 0 {
            Self::collect(core, &events[..nevents as usize], cookie)
        } else {
            0
        };

        core.wakeup_flag.clear();
        handled
    }
}
