// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Handler table mapping file descriptors to callback chains.
//!
//! Synchronization is the *caller's* job (the owning dispatcher wraps
//! this table in a [`DeferrableRwLock`](crate::sync::DeferrableRwLock)):
//!
//! - *non-mutating* operations ([`notify`], [`disconnect_all`],
//!   [`cookie`]) run under a read lock, concurrently with each other and
//!   with one mutating operation;
//! - *mutating* operations ([`insert`], [`remove`], [`modify`]) run
//!   under the (async) write lock, serialized against each other;
//! - [`synchronize`] runs in synchronizing state and excludes everything.
//!
//! [`notify`]: FdHandlerTable::notify
//! [`disconnect_all`]: FdHandlerTable::disconnect_all
//! [`cookie`]: FdHandlerTable::cookie
//! [`insert`]: FdHandlerTable::insert
//! [`remove`]: FdHandlerTable::remove
//! [`modify`]: FdHandlerTable::modify
//! [`synchronize`]: FdHandlerTable::synchronize

use core::ptr::{self, NonNull};
use std::os::fd::RawFd;

use util::non_null;

use crate::ioready::IoEvents;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, AtomicU32, Ordering, fence};
use crate::sync::refptr::{self, RefCounted};

/// A cookie rollover past this bit arms the deferred whole-table cookie
/// resync, keeping slot-vs-call deltas within the signed 32-bit
/// half-range where the staleness comparison is meaningful.
const COOKIE_SYNC_THRESHOLD: u32 = 1 << 16;

/// Link stored in an [`FdHandlerTable`]. Implementors embed an
/// [`FdLinkCore`] carrying the table's linkage and callback state.
pub(crate) trait FdTableLink: RefCounted + Sized {
    fn fd_core(&self) -> &FdLinkCore<Self>;

    /// Break the registration; expected to end up calling
    /// [`FdHandlerTable::remove`] for this link.
    fn disconnect(&self);
}

/// Table-owned state of one fd registration.
pub(crate) struct FdLinkCore<L> {
    /// The callback. Cleared by [`DelayedHandlerRelease`], outside any
    /// lock.
    function: UnsafeCell<Option<Box<dyn Fn(IoEvents) + Send + Sync>>>,
    fd: RawFd,
    /// Event mask bits. Written under the write lock, read during
    /// concurrent notification.
    event_mask: AtomicU32,
    /// Forward pointer of the slot's active sub-list.
    active_next: AtomicPtr<L>,
    /// Full-list linkage. Guarded by the write lock.
    prev: UnsafeCell<*mut L>,
    next: UnsafeCell<*mut L>,
    /// Linkage of the inactive (deferred release) list. Guarded by the
    /// write lock.
    inactive_next: UnsafeCell<*mut L>,
}

/// Per-fd chain: active sub-list + full list + recycle cookie.
struct FdChain<L> {
    active: AtomicPtr<L>,
    /// Guarded by the write lock.
    first: UnsafeCell<*mut L>,
    /// Guarded by the write lock.
    last: UnsafeCell<*mut L>,
    cookie: AtomicU32,
}

/// Growable fd-indexed array of chain pointers. Superseded arrays hang
/// off `old` until a sync point, because concurrent readers may still
/// hold pointers into them.
struct Table<L> {
    entries: Box<[AtomicPtr<FdChain<L>>]>,
    /// Guarded by the write lock.
    old: UnsafeCell<*mut Table<L>>,
}

/// fd → handler-chain map with event-mask aggregation and a cookie-based
/// guard against events delivered to a recycled descriptor.
pub(crate) struct FdHandlerTable<L: FdTableLink> {
    table: AtomicPtr<Table<L>>,
    /// Head of the inactive list (links awaiting release). Guarded by
    /// the write lock.
    inactive: UnsafeCell<*mut L>,
    /// Global recycle cookie; bumped whenever a slot's active set
    /// becomes empty.
    cookie: AtomicU32,
    /// Guarded by the write lock.
    need_cookie_sync: UnsafeCell<bool>,
}

/// Links detached by [`FdHandlerTable::synchronize`], to be released
/// outside any lock (dropping this does it).
pub(crate) struct DelayedHandlerRelease<L: FdTableLink> {
    head: *mut L,
}

// === impl FdLinkCore ===

impl<L> FdLinkCore<L> {
    pub(crate) fn new(function: Box<dyn Fn(IoEvents) + Send + Sync>, fd: RawFd, events: IoEvents) -> Self {
        Self {
            function: UnsafeCell::new(Some(function)),
            fd,
            event_mask: AtomicU32::new(events.bits()),
            active_next: AtomicPtr::new(ptr::null_mut()),
            prev: UnsafeCell::new(ptr::null_mut()),
            next: UnsafeCell::new(ptr::null_mut()),
            inactive_next: UnsafeCell::new(ptr::null_mut()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn event_mask(&self) -> IoEvents {
        IoEvents::from_bits_retain(self.event_mask.load(Ordering::Relaxed))
    }
}

// === impl FdChain ===

impl<L: FdTableLink> FdChain<L> {
    fn new() -> Self {
        Self {
            active: AtomicPtr::new(ptr::null_mut()),
            first: UnsafeCell::new(ptr::null_mut()),
            last: UnsafeCell::new(ptr::null_mut()),
            cookie: AtomicU32::new(0),
        }
    }

    /// Aggregate event mask of all active links.
    fn compute_event_mask(&self) -> IoEvents {
        let mut mask = IoEvents::empty();
        let mut link = self.active.load(Ordering::Relaxed);
        while !link.is_null() {
            // Safety: links on the active sub-list are alive.
            unsafe {
                mask |= (*link).fd_core().event_mask();
                link = (*link).fd_core().active_next.load(Ordering::Relaxed);
            }
        }
        mask
    }
}

// === impl Table ===

impl<L: FdTableLink> Table<L> {
    fn new(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entries,
            old: UnsafeCell::new(ptr::null_mut()),
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }
}

// === impl FdHandlerTable ===

impl<L: FdTableLink> FdHandlerTable<L> {
    pub(crate) fn new(initial: usize) -> Self {
        let table = Box::into_raw(Box::new(Table::new(initial)));
        Self {
            table: AtomicPtr::new(table),
            inactive: UnsafeCell::new(ptr::null_mut()),
            cookie: AtomicU32::new(0),
            need_cookie_sync: UnsafeCell::new(false),
        }
    }

    /// Current recycle cookie; capture *before* consulting the kernel
    /// and pass it back into [`notify`](Self::notify).
    pub(crate) fn cookie(&self) -> u32 {
        self.cookie.load(Ordering::Relaxed)
    }

    /// Registers `link` (taking a new reference to it) and returns the
    /// slot's aggregate event mask before and after.
    ///
    /// Must be called under the write lock.
    pub(crate) fn insert(&self, link: NonNull<L>) -> (IoEvents, IoEvents) {
        let link = link.as_ptr();
        // Safety: the caller holds a reference, keeping the link alive.
        let chain = unsafe { self.get_create_chain((*link).fd_core().fd) };
        // Safety: `get_create_chain` returned a live chain; no allocation
        // happens past this point.
        unsafe {
            refptr::retain(non_null(link));

            let mut old_mask = IoEvents::empty();
            let mut tmp = (*chain).active.load(Ordering::Relaxed);
            while !tmp.is_null() {
                old_mask |= (*tmp).fd_core().event_mask();
                tmp = (*tmp).fd_core().active_next.load(Ordering::Relaxed);
            }
            let new_mask = old_mask | (*link).fd_core().event_mask();

            // prepare the element
            let last = (*chain).last.with(|p| *p);
            (*link).fd_core().prev.with_mut(|p| *p = last);
            (*link).fd_core().next.with_mut(|p| *p = ptr::null_mut());
            (*link)
                .fd_core()
                .active_next
                .store(ptr::null_mut(), Ordering::Relaxed);

            // about to publish several references to the element: one
            // fence, then relaxed stores
            fence(Ordering::Release);

            // splice into the active sub-list (see signal.rs for the
            // protocol)
            let mut tmp = last;
            loop {
                if tmp.is_null() {
                    if (*chain).active.load(Ordering::Relaxed).is_null() {
                        (*chain).active.store(link, Ordering::Relaxed);
                    }
                    break;
                }
                if !(*tmp).fd_core().active_next.load(Ordering::Relaxed).is_null() {
                    break;
                }
                (*tmp).fd_core().active_next.store(link, Ordering::Relaxed);
                tmp = (*tmp).fd_core().prev.with(|p| *p);
            }

            // append to the full list
            if last.is_null() {
                (*chain).first.with_mut(|p| *p = link);
            } else {
                (*last).fd_core().next.with_mut(|p| *p = link);
            }
            (*chain).last.with_mut(|p| *p = link);

            (old_mask, new_mask)
        }
    }

    /// Unregisters `link`, parking it on the inactive list until the next
    /// sync point, and returns the slot's aggregate mask before and
    /// after. Bumps the recycle cookie if the slot became empty.
    ///
    /// Must be called under the write lock.
    pub(crate) fn remove(&self, link: NonNull<L>) -> (IoEvents, IoEvents) {
        let link = link.as_ptr();
        // Safety: write lock held; the link is still on its chain's full
        // list, which keeps both alive.
        unsafe {
            let chain = self.get_chain((*link).fd_core().fd);
            debug_assert!(!chain.is_null());

            // unsplice from the active sub-list
            let next = (*link).fd_core().active_next.load(Ordering::Relaxed);
            let mut tmp = (*link).fd_core().prev.with(|p| *p);
            loop {
                if tmp.is_null() {
                    if (*chain).active.load(Ordering::Relaxed) == link {
                        (*chain).active.store(next, Ordering::Release);
                    }
                    break;
                }
                if (*tmp).fd_core().active_next.load(Ordering::Relaxed) != link {
                    break;
                }
                (*tmp).fd_core().active_next.store(next, Ordering::Release);
                tmp = (*tmp).fd_core().prev.with(|p| *p);
            }

            let mut new_mask = IoEvents::empty();
            let mut tmp = (*chain).active.load(Ordering::Relaxed);
            while !tmp.is_null() {
                new_mask |= (*tmp).fd_core().event_mask();
                tmp = (*tmp).fd_core().active_next.load(Ordering::Relaxed);
            }
            let old_mask = new_mask | (*link).fd_core().event_mask();

            // If this was the last registration for the descriptor, the
            // application may close and recycle it immediately. A pending
            // kernel event for the old descriptor would then be
            // delivered to the new chain; bump the global cookie and
            // stamp it into the slot so such events are recognized as
            // stale.
            if (*chain).active.load(Ordering::Relaxed).is_null() {
                let old_cookie = self.cookie.fetch_add(1, Ordering::Relaxed);
                let new_cookie = old_cookie.wrapping_add(1);
                (*chain).cookie.store(new_cookie, Ordering::Relaxed);
                if (old_cookie ^ new_cookie) & COOKIE_SYNC_THRESHOLD != 0 {
                    self.need_cookie_sync.with_mut(|p| *p = true);
                }
            }

            // park on the inactive list for deferred release
            let head = self.inactive.with(|p| *p);
            (*link).fd_core().inactive_next.with_mut(|p| *p = head);
            self.inactive.with_mut(|p| *p = link);

            (old_mask, new_mask)
        }
    }

    /// Replaces the event mask of `link` and returns the slot's
    /// aggregate mask before and after.
    ///
    /// Must be called under the write lock.
    pub(crate) fn modify(&self, link: NonNull<L>, events: IoEvents) -> (IoEvents, IoEvents) {
        let link = link.as_ptr();
        // Safety: write lock held, link alive per caller.
        unsafe {
            let chain = self.get_chain((*link).fd_core().fd);
            debug_assert!(!chain.is_null());
            let old_mask = (*chain).compute_event_mask();
            (*link)
                .fd_core()
                .event_mask
                .store(events.bits(), Ordering::Relaxed);
            let new_mask = (*chain).compute_event_mask();
            (old_mask, new_mask)
        }
    }

    /// Calls `disconnect` on every registered link. Returns whether
    /// anything was disconnected.
    ///
    /// Runs under a read lock; the disconnects recurse into
    /// [`remove`](Self::remove) through the owning dispatcher.
    pub(crate) fn disconnect_all(&self) -> bool {
        let mut any_disconnected = false;
        let table = self.table.load(Ordering::Acquire);
        // Safety: the current table stays alive until a sync point, which
        // cannot run concurrently with us.
        unsafe {
            for entry in &(*table).entries {
                let chain = entry.load(Ordering::Acquire);
                if chain.is_null() {
                    continue;
                }
                loop {
                    let link = (*chain).active.load(Ordering::Acquire);
                    if link.is_null() {
                        break;
                    }
                    any_disconnected = true;
                    (*link).disconnect();
                }
            }
        }
        any_disconnected
    }

    /// Delivers `events` to every active link of `fd` whose mask
    /// intersects them, unless the slot's cookie shows the event
    /// belongs to a previous incarnation of the descriptor.
    ///
    /// Runs under a read lock.
    pub(crate) fn notify(&self, fd: RawFd, events: IoEvents, call_cookie: u32) {
        if fd < 0 {
            return;
        }
        let index = fd as usize;
        let table = self.table.load(Ordering::Acquire);
        // Safety: the read lock keeps the table, chains and active links
        // alive.
        unsafe {
            if index >= (*table).capacity() {
                return;
            }
            let chain = (*table).entries[index].load(Ordering::Acquire);
            if chain.is_null() {
                return;
            }

            // Signed wrapping delta: a slot that has "caught up" with the
            // capture point means the descriptor was recycled in between.
            let delta = (*chain)
                .cookie
                .load(Ordering::Relaxed)
                .wrapping_sub(call_cookie) as i32;
            if delta > 0 {
                tracing::trace!(fd, "dropping stale event for recycled descriptor");
                return;
            }

            let mut link = (*chain).active.load(Ordering::Acquire);
            while !link.is_null() {
                let mask = (*link).fd_core().event_mask();
                if !(events & mask).is_empty() {
                    (*link).fd_core().function.with(|f| {
                        if let Some(f) = (*f).as_ref() {
                            f(events & mask);
                        }
                    });
                }
                link = (*link).fd_core().active_next.load(Ordering::Acquire);
            }
        }
    }

    /// Finalizes list structure for removed links, frees superseded
    /// tables and performs a deferred whole-table cookie resync if one
    /// is armed. The returned object releases the detached links when
    /// dropped; drop it *outside* any lock.
    ///
    /// Must be called in synchronizing state.
    pub(crate) fn synchronize(&self) -> DelayedHandlerRelease<L> {
        // Safety: synchronizing state excludes every other table user.
        unsafe {
            self.deallocate_old_tables();
            let table = self.table.load(Ordering::Relaxed);

            // unlink inactive callbacks from their full lists
            let mut link = self.inactive.with(|p| *p);
            while !link.is_null() {
                let chain = (*table).entries[(*link).fd_core().fd as usize].load(Ordering::Relaxed);
                let prev = (*link).fd_core().prev.with(|p| *p);
                let next = (*link).fd_core().next.with(|p| *p);
                if !prev.is_null() {
                    (*prev).fd_core().next.with_mut(|p| *p = next);
                } else {
                    (*chain).first.with_mut(|p| *p = next);
                }
                if !next.is_null() {
                    (*next).fd_core().prev.with_mut(|p| *p = prev);
                } else {
                    (*chain).last.with_mut(|p| *p = prev);
                }
                link = (*link).fd_core().inactive_next.with(|p| *p);
            }

            if self.need_cookie_sync.with(|p| *p) {
                self.need_cookie_sync.with_mut(|p| *p = false);
                let current = self.cookie.load(Ordering::Relaxed);
                for entry in &(*table).entries {
                    let chain = entry.load(Ordering::Relaxed);
                    if !chain.is_null() {
                        (*chain).cookie.store(current, Ordering::Relaxed);
                    }
                }
            }

            let head = self.inactive.with(|p| *p);
            self.inactive.with_mut(|p| *p = ptr::null_mut());
            DelayedHandlerRelease { head }
        }
    }

    fn get_chain(&self, fd: RawFd) -> *mut FdChain<L> {
        let index = fd as usize;
        let table = self.table.load(Ordering::Relaxed);
        // Safety: called under the write lock; the current table is alive.
        unsafe {
            if index < (*table).capacity() {
                (*table).entries[index].load(Ordering::Relaxed)
            } else {
                ptr::null_mut()
            }
        }
    }

    /// Returns the chain for `fd`, growing the table and allocating the
    /// chain as needed.
    ///
    /// Must be called under the write lock.
    unsafe fn get_create_chain(&self, fd: RawFd) -> *mut FdChain<L> {
        assert!(fd >= 0, "cannot watch a negative file descriptor");
        let index = fd as usize;

        // Safety: write lock held.
        unsafe {
            let mut table = self.table.load(Ordering::Relaxed);
            if index >= (*table).capacity() {
                table = self.extend_table(table, index + 1);
            }

            let chain = (*table).entries[index].load(Ordering::Relaxed);
            if !chain.is_null() {
                return chain;
            }
            let chain = Box::into_raw(Box::new(FdChain::new()));
            (*table).entries[index].store(chain, Ordering::Release);
            chain
        }
    }

    /// Doubles (at least) the table. The superseded array stays reachable
    /// through `old` until the next sync point.
    unsafe fn extend_table(&self, table: *mut Table<L>, required: usize) -> *mut Table<L> {
        // Safety: write lock held; old table alive.
        unsafe {
            let new_capacity = required.max((*table).capacity() * 2);
            let new_table = Box::into_raw(Box::new(Table::new(new_capacity)));
            for n in 0..(*table).capacity() {
                (*new_table).entries[n].store(
                    (*table).entries[n].load(Ordering::Relaxed),
                    Ordering::Relaxed,
                );
            }
            (*new_table).old.with_mut(|p| *p = table);
            self.table.store(new_table, Ordering::Release);
            new_table
        }
    }

    /// Frees all superseded tables. Must be called in synchronizing
    /// state.
    unsafe fn deallocate_old_tables(&self) {
        // Safety: synchronizing state; no reader can hold pointers into
        // the old tables anymore.
        unsafe {
            let table = self.table.load(Ordering::Relaxed);
            let mut old = (*table).old.with(|p| *p);
            (*table).old.with_mut(|p| *p = ptr::null_mut());
            while !old.is_null() {
                let next = (*old).old.with(|p| *p);
                drop(Box::from_raw(old));
                old = next;
            }
        }
    }
}

impl<L: FdTableLink> Drop for FdHandlerTable<L> {
    fn drop(&mut self) {
        // By now the owning dispatcher has disconnected every link and
        // synchronized; only chains and tables remain.
        let table = self.table.load(Ordering::Relaxed);
        // Safety: exclusive access in drop.
        unsafe {
            debug_assert!(self.inactive.with(|p| (*p).is_null()));
            for entry in &(*table).entries {
                let chain = entry.load(Ordering::Relaxed);
                if !chain.is_null() {
                    debug_assert!((*chain).first.with(|p| (*p).is_null()));
                    drop(Box::from_raw(chain));
                }
            }
            let mut table = table;
            while !table.is_null() {
                let next = (*table).old.with(|p| *p);
                drop(Box::from_raw(table));
                table = next;
            }
        }
    }
}

// Safety: shared state is atomic or guarded by the caller's lock
// protocol as documented on each field.
unsafe impl<L: FdTableLink + Send + Sync> Send for FdHandlerTable<L> {}
// Safety: see above.
unsafe impl<L: FdTableLink + Send + Sync> Sync for FdHandlerTable<L> {}

// === impl DelayedHandlerRelease ===

impl<L: FdTableLink> DelayedHandlerRelease<L> {
    /// Drops the callbacks and releases the table's references.
    pub(crate) fn clear(&mut self) {
        let mut link = self.head;
        self.head = ptr::null_mut();
        while !link.is_null() {
            // Safety: the links were detached at the sync point and are
            // reachable by no one but us.
            unsafe {
                let next = (*link).fd_core().inactive_next.with(|p| *p);
                (*link).fd_core().function.with_mut(|f| drop((*f).take()));
                refptr::release(non_null(link));
                link = next;
            }
        }
    }
}

impl<L: FdTableLink> Drop for DelayedHandlerRelease<L> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::AtomicUsize;
    use crate::sync::refptr::Ref;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord_};

    struct TestLink {
        refcount: AtomicUsize,
        core: FdLinkCore<TestLink>,
    }

    impl TestLink {
        fn create(fd: RawFd, events: IoEvents, hits: &Arc<Counter>) -> Ref<TestLink> {
            let hits = hits.clone();
            Ref::new(TestLink {
                refcount: AtomicUsize::new(1),
                core: FdLinkCore::new(
                    Box::new(move |_| {
                        hits.fetch_add(1, Ord_::SeqCst);
                    }),
                    fd,
                    events,
                ),
            })
        }
    }

    // Safety: allocated through `Ref::new`, counter is stable.
    unsafe impl RefCounted for TestLink {
        fn refcount(&self) -> &AtomicUsize {
            &self.refcount
        }
    }

    impl FdTableLink for TestLink {
        fn fd_core(&self) -> &FdLinkCore<TestLink> {
            &self.core
        }

        fn disconnect(&self) {}
    }

    #[test]
    fn mask_aggregation() {
        let table = FdHandlerTable::<TestLink>::new(8);
        let hits = Arc::new(Counter::new(0));

        let a = TestLink::create(3, IoEvents::INPUT, &hits);
        let b = TestLink::create(3, IoEvents::OUTPUT, &hits);

        assert_eq!(
            table.insert(a.as_ptr()),
            (IoEvents::empty(), IoEvents::INPUT)
        );
        assert_eq!(
            table.insert(b.as_ptr()),
            (IoEvents::INPUT, IoEvents::INPUT | IoEvents::OUTPUT)
        );

        assert_eq!(
            table.modify(b.as_ptr(), IoEvents::INPUT),
            (IoEvents::INPUT | IoEvents::OUTPUT, IoEvents::INPUT)
        );

        assert_eq!(
            table.remove(a.as_ptr()),
            (IoEvents::INPUT, IoEvents::INPUT)
        );
        assert_eq!(
            table.remove(b.as_ptr()),
            (IoEvents::INPUT, IoEvents::empty())
        );

        drop(table.synchronize());
    }

    #[test]
    fn notify_respects_masks() {
        let table = FdHandlerTable::<TestLink>::new(8);
        let input_hits = Arc::new(Counter::new(0));
        let output_hits = Arc::new(Counter::new(0));

        let a = TestLink::create(5, IoEvents::INPUT, &input_hits);
        let b = TestLink::create(5, IoEvents::OUTPUT, &output_hits);
        table.insert(a.as_ptr());
        table.insert(b.as_ptr());

        let cookie = table.cookie();
        table.notify(5, IoEvents::INPUT, cookie);
        assert_eq!(input_hits.load(Ord_::SeqCst), 1);
        assert_eq!(output_hits.load(Ord_::SeqCst), 0);

        table.notify(5, IoEvents::INPUT | IoEvents::OUTPUT, cookie);
        assert_eq!(input_hits.load(Ord_::SeqCst), 2);
        assert_eq!(output_hits.load(Ord_::SeqCst), 1);

        // unknown fd: silently ignored
        table.notify(7, IoEvents::INPUT, cookie);
        table.notify(200, IoEvents::INPUT, cookie);

        table.remove(a.as_ptr());
        table.remove(b.as_ptr());
        drop(table.synchronize());
    }

    #[test]
    fn stale_cookie_drops_event() {
        let table = FdHandlerTable::<TestLink>::new(8);
        let old_hits = Arc::new(Counter::new(0));
        let new_hits = Arc::new(Counter::new(0));

        let old_link = TestLink::create(4, IoEvents::INPUT, &old_hits);
        table.insert(old_link.as_ptr());

        // event reported by the kernel for the old incarnation
        let stale_cookie = table.cookie();

        // last registration removed: the descriptor may now be recycled
        table.remove(old_link.as_ptr());
        drop(table.synchronize());

        // new incarnation of the same fd number
        let new_link = TestLink::create(4, IoEvents::INPUT, &new_hits);
        table.insert(new_link.as_ptr());

        table.notify(4, IoEvents::INPUT, stale_cookie);
        assert_eq!(new_hits.load(Ord_::SeqCst), 0);

        // a fresh capture delivers fine
        table.notify(4, IoEvents::INPUT, table.cookie());
        assert_eq!(new_hits.load(Ord_::SeqCst), 1);

        table.remove(new_link.as_ptr());
        drop(table.synchronize());
    }

    #[test]
    fn active_sublist_skips_removed() {
        let table = FdHandlerTable::<TestLink>::new(8);
        let hits: Vec<Arc<Counter>> = (0..3).map(|_| Arc::new(Counter::new(0))).collect();

        let links: Vec<_> = hits
            .iter()
            .map(|h| {
                let l = TestLink::create(2, IoEvents::INPUT, h);
                table.insert(l.as_ptr());
                l
            })
            .collect();

        table.remove(links[1].as_ptr());
        table.notify(2, IoEvents::INPUT, table.cookie());
        assert_eq!(hits[0].load(Ord_::SeqCst), 1);
        assert_eq!(hits[1].load(Ord_::SeqCst), 0);
        assert_eq!(hits[2].load(Ord_::SeqCst), 1);

        table.remove(links[0].as_ptr());
        table.remove(links[2].as_ptr());
        drop(table.synchronize());
    }

    #[test]
    fn table_grows_past_initial_capacity() {
        let table = FdHandlerTable::<TestLink>::new(4);
        let hits = Arc::new(Counter::new(0));

        let far = TestLink::create(100, IoEvents::INPUT, &hits);
        table.insert(far.as_ptr());

        table.notify(100, IoEvents::INPUT, table.cookie());
        assert_eq!(hits.load(Ord_::SeqCst), 1);

        table.remove(far.as_ptr());
        // frees the superseded arrays too
        drop(table.synchronize());
    }
}
