// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Backend-independent plumbing shared by the four I/O readiness
//! dispatchers: the registration link, the watch/modify/disconnect
//! protocol under the deferrable lock, and dispatcher teardown.

use core::ptr::{self, NonNull};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use util::non_null;

use crate::connection::ConnectionLink;
use crate::ioready::fd_table::{FdHandlerTable, FdLinkCore, FdTableLink};
use crate::ioready::{IoEvents, IoReadyConnection, IoReadyLink};
use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::sync::deferred::{AsyncWriteGuard, DeferrableRwLock, SharedChain};
use crate::sync::event_flag::{EventTrigger, PipeEventFlag};
use crate::sync::refptr::Ref;

/// One OS-level readiness mechanism.
///
/// The backend only maintains the kernel-side registration state and
/// performs the actual wait; everything else (handler table, cookie
/// guard, lifetime protocol) is shared.
pub(crate) trait Backend: Send + Sync + Sized + 'static {
    const NAME: &'static str;

    /// Whether a blocked wait only observes registration changes after an
    /// explicit wakeup (snapshot-style backends: `poll`, `select`).
    const NEEDS_WAKEUP_ON_UPDATE: bool;

    fn new() -> io::Result<Self>;

    /// Applies the kernel-side consequences of the aggregate event mask
    /// of `fd` changing from `old_mask` to `new_mask`.
    ///
    /// Called under the write lock.
    fn update_registration(&self, fd: RawFd, old_mask: IoEvents, new_mask: IoEvents);

    /// Waits up to `timeout` (indefinitely if `None`) and dispatches up
    /// to `limit` ready events through `core`.
    fn dispatch(core: &DispatcherCore<Self>, timeout: Option<Duration>, limit: usize) -> usize;

    /// Dispatches up to `limit` already-ready events without blocking.
    fn dispatch_pending(core: &DispatcherCore<Self>, limit: usize) -> usize;
}

/// State shared between a dispatcher, its registration links and the
/// threads dispatching on it. Heap-pinned by [`Dispatcher`]: links carry
/// raw back-pointers.
pub(crate) struct DispatcherCore<B: Backend> {
    pub(crate) backend: B,
    pub(crate) fdtab: FdHandlerTable<IoLink<B>>,
    pub(crate) wakeup_flag: Arc<PipeEventFlag>,
    lock: DeferrableRwLock,
}

/// One fd readiness registration.
pub(crate) struct IoLink<B: Backend> {
    refcount: AtomicUsize,
    core: FdLinkCore<IoLink<B>>,
    /// Back-pointer to the owning dispatcher core; null once
    /// disconnected.
    master: AtomicPtr<DispatcherCore<B>>,
    /// Serializes disconnect/modify against each other.
    registration_mutex: Mutex<()>,
}

/// An I/O readiness dispatcher over backend `B`.
pub(crate) struct Dispatcher<B: Backend> {
    // Box: stable address for the links' back-pointers.
    core: Box<DispatcherCore<B>>,
}

// === impl DispatcherCore ===

impl<B: Backend> DispatcherCore<B> {
    pub(crate) fn watch(
        &self,
        function: Box<dyn Fn(IoEvents) + Send + Sync>,
        fd: RawFd,
        events: IoEvents,
    ) -> IoReadyConnection {
        let link = Ref::new(IoLink {
            refcount: AtomicUsize::new(1),
            core: FdLinkCore::new(function, fd, events),
            master: AtomicPtr::new(ptr::from_ref(self).cast_mut()),
            registration_mutex: Mutex::new(()),
        });

        {
            let _guard = AsyncWriteGuard::new(self);
            let (old_mask, new_mask) = self.fdtab.insert(link.as_ptr());
            self.backend.update_registration(fd, old_mask, new_mask);
        }
        if B::NEEDS_WAKEUP_ON_UPDATE {
            self.wakeup_flag.set();
        }
        tracing::trace!(backend = B::NAME, fd, ?events, "watch");

        let raw = NonNull::new(Ref::into_raw(link).as_ptr() as *mut dyn IoReadyLink).unwrap();
        // Safety: `into_raw` transferred the handle's reference to us.
        IoReadyConnection::from_link(unsafe { Ref::adopt_raw(raw) })
    }
}

impl<B: Backend> SharedChain for DispatcherCore<B> {
    fn lock(&self) -> &DeferrableRwLock {
        &self.lock
    }

    fn synchronize(&self) {
        let release = self.fdtab.synchronize();
        self.lock.sync_finished();
        drop(release);
    }
}

// === impl IoLink ===

impl<B: Backend> IoLink<B> {
    pub(crate) fn fd(&self) -> RawFd {
        self.core.fd()
    }

    fn disconnect(&self) {
        let guard = self.registration_mutex.lock();
        let master = self.master.load(Ordering::Relaxed);
        if master.is_null() {
            return;
        }
        // Safety: a non-null master pointer means this link is still
        // registered, which keeps the dispatcher core alive until the
        // pointer is cleared under the write lock below.
        let master = unsafe { &*master };

        let wguard = AsyncWriteGuard::new(master);
        // Safety: `self` is alive (we are called through a reference).
        let this = unsafe { non_null(ptr::from_ref(self).cast_mut()) };
        let (old_mask, new_mask) = master.fdtab.remove(this);
        master.backend.update_registration(self.fd(), old_mask, new_mask);
        if B::NEEDS_WAKEUP_ON_UPDATE {
            master.wakeup_flag.set();
        }
        self.master.store(ptr::null_mut(), Ordering::Relaxed);
        tracing::trace!(backend = B::NAME, fd = self.fd(), "disconnect");
        drop(guard);
        drop(wguard);
    }

    fn modify(&self, events: IoEvents) {
        let guard = self.registration_mutex.lock();
        let master = self.master.load(Ordering::Relaxed);
        if master.is_null() {
            return;
        }
        // Safety: see `disconnect`.
        let master = unsafe { &*master };

        let wguard = AsyncWriteGuard::new(master);
        // Safety: `self` is alive.
        let this = unsafe { non_null(ptr::from_ref(self).cast_mut()) };
        let (old_mask, new_mask) = master.fdtab.modify(this, events);
        master.backend.update_registration(self.fd(), old_mask, new_mask);
        if B::NEEDS_WAKEUP_ON_UPDATE {
            master.wakeup_flag.set();
        }
        drop(guard);
        drop(wguard);
    }
}

// Safety: the counter is embedded and stable; links are allocated
// through `Ref::new`.
unsafe impl<B: Backend> crate::sync::refptr::RefCounted for IoLink<B> {
    fn refcount(&self) -> &AtomicUsize {
        &self.refcount
    }
}

impl<B: Backend> FdTableLink for IoLink<B> {
    fn fd_core(&self) -> &FdLinkCore<IoLink<B>> {
        &self.core
    }

    fn disconnect(&self) {
        IoLink::disconnect(self);
    }
}

impl<B: Backend> ConnectionLink for IoLink<B> {
    fn disconnect(&self) {
        IoLink::disconnect(self);
    }

    fn is_connected(&self) -> bool {
        !self.master.load(Ordering::Relaxed).is_null()
    }
}

impl<B: Backend> IoReadyLink for IoLink<B> {
    fn modify(&self, events: IoEvents) {
        IoLink::modify(self, events);
    }

    fn event_mask(&self) -> IoEvents {
        self.core.event_mask()
    }
}

// Safety: all shared state is atomic or guarded as documented.
unsafe impl<B: Backend> Send for IoLink<B> {}
// Safety: see above.
unsafe impl<B: Backend> Sync for IoLink<B> {}
// Safety: see above.
unsafe impl<B: Backend> Send for DispatcherCore<B> {}
// Safety: see above.
unsafe impl<B: Backend> Sync for DispatcherCore<B> {}

// === impl Dispatcher ===

impl<B: Backend> Dispatcher<B> {
    pub(crate) fn new() -> io::Result<Self> {
        let backend = B::new()?;
        let wakeup_flag = Arc::new(PipeEventFlag::new()?);
        let dispatcher = Self {
            core: Box::new(DispatcherCore {
                backend,
                fdtab: FdHandlerTable::new(32),
                wakeup_flag,
                lock: DeferrableRwLock::new(),
            }),
        };

        // Keep the wakeup pipe permanently watched; the connection handle
        // is dropped without disconnecting, so the registration lives as
        // long as the dispatcher.
        let read_fd = dispatcher.core.wakeup_flag.read_fd();
        drop(dispatcher.core.watch(Box::new(|_| {}), read_fd, IoEvents::INPUT));

        Ok(dispatcher)
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        B::NAME
    }

    pub(crate) fn watch_boxed(
        &self,
        function: Box<dyn Fn(IoEvents) + Send + Sync>,
        fd: RawFd,
        events: IoEvents,
    ) -> IoReadyConnection {
        self.core.watch(function, fd, events)
    }

    pub(crate) fn dispatch(&self, timeout: Option<Duration>, limit: usize) -> usize {
        B::dispatch(&self.core, timeout, limit)
    }

    pub(crate) fn dispatch_pending(&self, limit: usize) -> usize {
        B::dispatch_pending(&self.core, limit)
    }

    pub(crate) fn wake_up(&self) {
        self.core.wakeup_flag.set();
    }

    pub(crate) fn event_trigger(&self) -> Arc<dyn EventTrigger> {
        self.core.wakeup_flag.clone()
    }
}

impl<B: Backend> Drop for Dispatcher<B> {
    fn drop(&mut self) {
        // No thread can be dispatching and no new registration can be
        // made at this point; concurrent *disconnects* are the one thing
        // the teardown protocol still has to tolerate.
        let core = &*self.core;
        while core.lock.read_lock() {
            core.synchronize();
        }
        let any_disconnected = core.fdtab.disconnect_all();
        if core.lock.read_unlock() {
            core.synchronize();
        } else if any_disconnected {
            // a disconnect raced with teardown: wait until the chain is
            // quiescent, then reclaim
            core.lock.write_lock_sync();
            let release = core.fdtab.synchronize();
            core.lock.write_unlock_sync();
            drop(release);
        }
    }
}

/// Rounds `timeout` up to whole milliseconds for `poll`-style interfaces
/// (`None` → `-1` = infinite). Sub-millisecond timeouts round up so they
/// do not degenerate into busy polling.
pub(crate) fn timeout_to_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(timeout) => timeout
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(timeout)
            .as_millis()
            .try_into()
            .unwrap_or(libc::c_int::MAX),
        None => -1,
    }
}
