// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! I/O readiness backend over `kqueue`/`kevent`.
//!
//! The preferred mechanism on the BSDs and macOS; all relevant
//! operations are O(1) in the number of watched descriptors. Input and
//! output interest map to separate `EVFILT_READ`/`EVFILT_WRITE`
//! registrations.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::ioready::IoEvents;
use crate::ioready::dispatcher::{Backend, DispatcherCore};
use crate::sync::deferred::ReadGuard;
use crate::syscall::syscall;

pub(crate) struct KqueueBackend {
    kqueue_fd: OwnedFd,
}

fn filter_to_events(filter: i16) -> IoEvents {
    match filter {
        libc::EVFILT_READ => IoEvents::INPUT,
        libc::EVFILT_WRITE => IoEvents::OUTPUT,
        _ => IoEvents::empty(),
    }
}

fn timeout_to_timespec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs().try_into().unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::from(timeout.subsec_nanos()),
    }
}

impl KqueueBackend {
    fn change(&self, fd: RawFd, filter: i16, add: bool) {
        // Safety: an all-zero kevent is a valid starting point; the
        // fields that matter are set below.
        let mut change = unsafe { mem::zeroed::<libc::kevent>() };
        change.ident = fd as usize;
        change.filter = filter;
        change.flags = if add { libc::EV_ADD } else { libc::EV_DELETE };

        // Safety: the changelist has exactly one live entry.
        let res = unsafe {
            libc::kevent(
                self.kqueue_fd.as_raw_fd(),
                &change,
                1,
                core::ptr::null_mut(),
                0,
                core::ptr::null(),
            )
        };
        if res == -1 {
            let error = io::Error::last_os_error();
            tracing::warn!(fd, filter, add, %error, "kevent change failed");
        }
    }

    fn collect(core: &DispatcherCore<Self>, events: &[libc::kevent], cookie: u32) -> usize {
        let _guard = ReadGuard::new(core);
        for event in events {
            let fd = event.ident as RawFd;
            core.fdtab.notify(fd, filter_to_events(event.filter), cookie);
        }
        events.len()
    }
}

impl Backend for KqueueBackend {
    const NAME: &'static str = "kqueue";
    // kevent changes take effect for already-blocked waiters
    const NEEDS_WAKEUP_ON_UPDATE: bool = false;

    fn new() -> io::Result<Self> {
        let fd = syscall!(kqueue())?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        // Safety: `kqueue` handed us ownership of the descriptor.
        Ok(Self {
            kqueue_fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn update_registration(&self, fd: RawFd, old_mask: IoEvents, new_mask: IoEvents) {
        let old_input = old_mask.contains(IoEvents::INPUT);
        let new_input = new_mask.contains(IoEvents::INPUT);
        if old_input != new_input {
            self.change(fd, libc::EVFILT_READ, new_input);
        }

        let old_output = old_mask.contains(IoEvents::OUTPUT);
        let new_output = new_mask.contains(IoEvents::OUTPUT);
        if old_output != new_output {
            self.change(fd, libc::EVFILT_WRITE, new_output);
        }
    }

    fn dispatch(core: &DispatcherCore<Self>, timeout: Option<Duration>, limit: usize) -> usize {
        let cookie = core.fdtab.cookie();

        let limit = limit.min(16);
        // Safety: all-zero kevents are valid; the kernel overwrites them.
        let mut events = [unsafe { mem::zeroed::<libc::kevent>() }; 16];

        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let mut ts_ptr: *const libc::timespec = core::ptr::null();
        if let Some(timeout) = timeout {
            ts = timeout_to_timespec(timeout);
            ts_ptr = &ts;
        }

        core.wakeup_flag.start_waiting();
        if core.wakeup_flag.flagged() {
            ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            ts_ptr = &ts;
        }
        // Safety: the event buffer outlives the call and `limit` bounds it.
        let nevents = unsafe {
            libc::kevent(
                core.backend.kqueue_fd.as_raw_fd(),
                core::ptr::null(),
                0,
                events.as_mut_ptr(),
                limit as libc::c_int,
                ts_ptr,
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
        // Safety: see `dispatch`.
        let mut events = [unsafe { mem::zeroed::<libc::kevent>() }; 16];
        let ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };

        // Safety: see `dispatch`.
        let nevents = unsafe {
            libc::kevent(
                core.backend.kqueue_fd.as_raw_fd(),
                core::ptr::null(),
                0,
                events.as_mut_ptr(),
                limit as libc::c_int,
                &ts,
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
