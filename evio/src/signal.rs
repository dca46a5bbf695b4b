// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-safe notifier chains (the observer pattern).
//!
//! A [`Signal`] keeps an ordered list of callbacks. Any number of threads
//! may [`connect`](Signal::connect), [`emit`](Signal::emit) and
//! disconnect concurrently. Emission traverses a *published active
//! sub-list* without taking any mutex: the chain's
//! [`DeferrableRwLock`] only counts the traverser as a reader, and
//! memory of disconnected links is reclaimed at the next quiescent
//! point.
//!
//! The active sub-list is a forward-only subsequence of the full
//! (doubly-linked) registration list. Removal rewrites the `active_next`
//! pointer of every predecessor that still points at the removed link,
//! so a traverser that has loaded any earlier pointer skips the removed
//! link within a bounded number of steps.

use core::ptr::{self, NonNull};

use parking_lot::{Mutex, MutexGuard};
use util::non_null;

use crate::connection::{Connection, ConnectionLink};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering, fence};
use crate::sync::deferred::{DeferrableRwLock, ReadGuard, SharedChain};
use crate::sync::refptr::{self, Ref, RefCounted};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Thread-safe callback chain.
///
/// Callbacks registered through [`connect`](Self::connect) are invoked in
/// registration order by [`emit`](Self::emit). See the
/// [module docs](self) for the concurrency model.
///
/// Dropping the signal disconnects every remaining callback. It is a
/// programmer error for registration or emission to race with the drop
/// of the signal itself; disconnection may.
pub struct Signal<T> {
    // Box: links carry raw back-pointers to the core, so its address must
    // be stable even when the `Signal` itself moves.
    core: Box<SignalCore<T>>,
}

struct SignalCore<T> {
    lock: DeferrableRwLock,
    /// Head of the published active sub-list.
    active: AtomicPtr<SignalLink<T>>,
    /// First element of the full list. Guarded by the write lock.
    first: UnsafeCell<*mut SignalLink<T>>,
    /// Last element of the full list. Guarded by the write lock.
    last: UnsafeCell<*mut SignalLink<T>>,
    /// Links removed from the active sub-list but not yet reclaimed.
    /// Guarded by the write lock; drained at sync points.
    deferred_destroy: UnsafeCell<*mut SignalLink<T>>,
}

struct SignalLink<T> {
    refcount: AtomicUsize,
    /// The callback. Cleared (outside the chain lock) once the link can
    /// no longer be reached by any traverser.
    function: UnsafeCell<Option<Callback<T>>>,
    /// Forward pointer of the active sub-list.
    active_next: AtomicPtr<SignalLink<T>>,
    /// Full-list linkage. Guarded by the write lock.
    prev: UnsafeCell<*mut SignalLink<T>>,
    next: UnsafeCell<*mut SignalLink<T>>,
    /// Linkage of the deferred-destroy list. Guarded by the write lock.
    deferred_destroy_next: UnsafeCell<*mut SignalLink<T>>,
    /// Back-pointer to the owning chain; null once disconnected.
    chain: AtomicPtr<SignalCore<T>>,
    /// Serializes disconnection against registration teardown.
    registration_mutex: Mutex<()>,
}

// === impl Signal ===

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            core: Box::new(SignalCore {
                lock: DeferrableRwLock::new(),
                active: AtomicPtr::new(ptr::null_mut()),
                first: UnsafeCell::new(ptr::null_mut()),
                last: UnsafeCell::new(ptr::null_mut()),
                deferred_destroy: UnsafeCell::new(ptr::null_mut()),
            }),
        }
    }

    /// Registers `function` at the end of the chain.
    ///
    /// The returned handle can later break the registration; dropping it
    /// without disconnecting leaves the callback registered.
    pub fn connect<F>(&self, function: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let link = Ref::new(SignalLink {
            refcount: AtomicUsize::new(1),
            function: UnsafeCell::new(Some(Box::new(function))),
            active_next: AtomicPtr::new(ptr::null_mut()),
            prev: UnsafeCell::new(ptr::null_mut()),
            next: UnsafeCell::new(ptr::null_mut()),
            deferred_destroy_next: UnsafeCell::new(ptr::null_mut()),
            chain: AtomicPtr::new(ptr::null_mut()),
            registration_mutex: Mutex::new(()),
        });
        self.core.push_back(link.as_ptr());
        let raw =
            NonNull::new(Ref::into_raw(link).as_ptr() as *mut dyn ConnectionLink).unwrap();
        // Safety: `into_raw` transferred the handle's reference to us.
        Connection::from_link(unsafe { Ref::adopt_raw(raw) })
    }

    /// Invokes every connected callback, in registration order, with `arg`.
    ///
    /// If a callback panics the panic propagates to the caller; the
    /// remaining callbacks of this emission are not invoked, but the
    /// chain stays consistent and usable.
    pub fn emit(&self, arg: &T) {
        let core = &*self.core;
        let _guard = ReadGuard::new(core);
        let mut link = core.active.load(Ordering::Acquire);
        while !link.is_null() {
            // Safety: the read lock keeps every link reachable through
            // the active sub-list alive, and function slots are cleared
            // only at sync points, which exclude readers.
            unsafe {
                (*link).function.with(|f| {
                    if let Some(f) = (*f).as_ref() {
                        f(arg);
                    }
                });
                link = (*link).active_next.load(Ordering::Acquire);
            }
        }
    }

    /// Disconnects every currently connected callback, as if
    /// [`Connection::disconnect`] had been called on each handle.
    ///
    /// Returns whether anything was disconnected.
    pub fn disconnect_all(&self) -> bool {
        let core = &*self.core;
        let mut any_disconnected = false;
        let _guard = ReadGuard::new(core);
        let mut link = core.active.load(Ordering::Acquire);
        while !link.is_null() {
            any_disconnected = true;
            // Safety: see `emit`.
            unsafe {
                (*link).disconnect();
                link = (*link).active_next.load(Ordering::Acquire);
            }
        }
        any_disconnected
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Signal<T> {
    fn drop(&mut self) {
        let core = &*self.core;
        while core.lock.read_lock() {
            core.synchronize();
        }
        let mut any_cancelled = false;
        loop {
            let link = core.active.load(Ordering::Relaxed);
            if link.is_null() {
                break;
            }
            any_cancelled = true;
            // Safety: we hold a read lock, the link is alive.
            unsafe { (*link).disconnect() };
        }
        if core.lock.read_unlock() {
            // the cancellations above queued the links for destruction;
            // with no concurrent disconnect this is the sync point
            core.synchronize();
        } else if any_cancelled {
            // a concurrent disconnect raced with the teardown: block
            // until the chain is quiescent, then reclaim
            core.lock.write_lock_sync();
            let to_destroy = core.synchronize_top();
            core.lock.write_unlock_sync();
            SignalCore::synchronize_bottom(to_destroy);
        }
    }
}

// Safety: the chain hands out no `&mut` access; all cross-thread state is
// either atomic or guarded by the deferred lock protocol documented on
// the fields.
unsafe impl<T> Send for SignalCore<T> {}
// Safety: see above.
unsafe impl<T> Sync for SignalCore<T> {}

// Safety: links never hand out `T`; callbacks are `Send + Sync` and all
// linkage is guarded as documented.
unsafe impl<T> Send for SignalLink<T> {}
// Safety: see above.
unsafe impl<T> Sync for SignalLink<T> {}

// === impl SignalCore ===

impl<T> SignalCore<T> {
    /// Appends `link` to the full list and splices it into the active
    /// sub-list.
    fn push_back(&self, link: NonNull<SignalLink<T>>) {
        let link = link.as_ptr();
        // the chain's own reference
        // Safety: the caller holds a reference, keeping the link alive.
        unsafe { refptr::retain(non_null(link)) };

        // The link is fully constructed here, but the lock acquisition
        // below only provides acquire semantics; an explicit release
        // fence keeps an uninitialized element from becoming visible to
        // traversers.
        fence(Ordering::Release);

        // Safety: the link is alive; full-list fields are touched under
        // the write lock only.
        let reg_guard = unsafe { (*link).registration_mutex.lock() };
        let sync = self.lock.write_lock_async();

        // Safety: write lock held.
        unsafe {
            let last = self.last.with(|p| *p);
            (*link).next.with_mut(|p| *p = ptr::null_mut());
            (*link).prev.with_mut(|p| *p = last);
            (*link).active_next.store(ptr::null_mut(), Ordering::Relaxed);

            // Splice into the active sub-list: every trailing element
            // whose forward pointer is null (i.e. was removed, or is the
            // current tail) must point at the new element.
            let mut tmp = last;
            loop {
                if tmp.is_null() {
                    if self.active.load(Ordering::Relaxed).is_null() {
                        self.active.store(link, Ordering::Release);
                    }
                    break;
                }
                if !(*tmp).active_next.load(Ordering::Relaxed).is_null() {
                    break;
                }
                (*tmp).active_next.store(link, Ordering::Release);
                tmp = (*tmp).prev.with(|p| *p);
            }

            // append to the full list
            if last.is_null() {
                self.first.with_mut(|p| *p = link);
            } else {
                (*last).next.with_mut(|p| *p = link);
            }
            self.last.with_mut(|p| *p = link);

            (*link)
                .chain
                .store(ptr::from_ref(self).cast_mut(), Ordering::Relaxed);
        }

        drop(reg_guard);

        if sync {
            self.synchronize();
        } else {
            self.lock.write_unlock_async();
        }
    }

    /// Removes `link` from the active sub-list and queues it for
    /// destruction at the next sync point.
    ///
    /// # Safety
    ///
    /// `link` must be alive; `reg_guard` must guard `link`'s registration
    /// mutex.
    unsafe fn remove(&self, link: *mut SignalLink<T>, reg_guard: MutexGuard<'_, ()>) {
        let sync = self.lock.write_lock_async();

        // Safety: write lock held, link alive per caller.
        unsafe {
            if (*link).chain.load(Ordering::Relaxed) == ptr::from_ref(self).cast_mut() {
                // Rewrite every predecessor in the full list that still
                // points at `link`, so traversers skip it. Stop at the
                // first predecessor pointing elsewhere: it was removed
                // earlier and already points past us.
                let next = (*link).active_next.load(Ordering::Relaxed);
                let mut tmp = (*link).prev.with(|p| *p);
                loop {
                    if tmp.is_null() {
                        if self.active.load(Ordering::Relaxed) == link {
                            self.active.store(next, Ordering::Release);
                        }
                        break;
                    }
                    if (*tmp).active_next.load(Ordering::Relaxed) != link {
                        break;
                    }
                    (*tmp).active_next.store(next, Ordering::Release);
                    tmp = (*tmp).prev.with(|p| *p);
                }

                // park on the deferred-destroy list; still reachable
                // through the full list until the next sync point
                let head = self.deferred_destroy.with(|p| *p);
                (*link).deferred_destroy_next.with_mut(|p| *p = head);
                self.deferred_destroy.with_mut(|p| *p = link);

                // second disconnect becomes a no-op
                (*link).chain.store(ptr::null_mut(), Ordering::Relaxed);
            }
        }

        drop(reg_guard);

        if sync {
            self.synchronize();
        } else {
            self.lock.write_unlock_async();
        }
    }

    /// First half of a sync point: repair the full list and swap out the
    /// deferred-destroy list. Runs in synchronizing state (no readers,
    /// writer mutex held).
    fn synchronize_top(&self) -> *mut SignalLink<T> {
        // Safety: synchronizing state excludes all other list users.
        unsafe {
            let mut current = self.deferred_destroy.with(|p| *p);
            while !current.is_null() {
                let prev = (*current).prev.with(|p| *p);
                let next = (*current).next.with(|p| *p);
                if !prev.is_null() {
                    (*prev).next.with_mut(|p| *p = next);
                } else {
                    self.first.with_mut(|p| *p = next);
                }
                if !next.is_null() {
                    (*next).prev.with_mut(|p| *p = prev);
                } else {
                    self.last.with_mut(|p| *p = prev);
                }
                current = (*current).deferred_destroy_next.with(|p| *p);
            }

            let head = self.deferred_destroy.with(|p| *p);
            self.deferred_destroy.with_mut(|p| *p = ptr::null_mut());
            head
        }
    }

    /// Second half of a sync point: release the detached links, outside
    /// the lock so callback drop side-effects cannot deadlock.
    fn synchronize_bottom(mut to_destroy: *mut SignalLink<T>) {
        while !to_destroy.is_null() {
            // Safety: the links were detached under the lock and are
            // reachable by no one but us.
            unsafe {
                let next = (*to_destroy).deferred_destroy_next.with(|p| *p);
                (*to_destroy).function.with_mut(|f| drop((*f).take()));
                refptr::release(non_null(to_destroy));
                to_destroy = next;
            }
        }
    }
}

impl<T> SharedChain for SignalCore<T> {
    fn lock(&self) -> &DeferrableRwLock {
        &self.lock
    }

    fn synchronize(&self) {
        let to_destroy = self.synchronize_top();
        self.lock.sync_finished();
        Self::synchronize_bottom(to_destroy);
    }
}

// === impl SignalLink ===

impl<T> SignalLink<T> {
    fn disconnect(&self) {
        let guard = self.registration_mutex.lock();
        let chain = self.chain.load(Ordering::Relaxed);
        if chain.is_null() {
            return;
        }
        // Safety: a non-null back-pointer means this link is still on the
        // chain's full list, which keeps the chain alive until the
        // pointer is cleared under the write lock (which `remove` does).
        unsafe { (*chain).remove(ptr::from_ref(self).cast_mut(), guard) }
    }
}

// Safety: the counter is embedded and stable, links are allocated through
// `Ref::new`.
unsafe impl<T> RefCounted for SignalLink<T> {
    fn refcount(&self) -> &AtomicUsize {
        &self.refcount
    }
}

impl<T: 'static> ConnectionLink for SignalLink<T> {
    fn disconnect(&self) {
        SignalLink::disconnect(self);
    }

    fn is_connected(&self) -> bool {
        !self.chain.load(Ordering::Relaxed).is_null()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord_};

    /// Tracks how many captured clones are still alive, to observe that
    /// disconnected callbacks release their captured state.
    struct Capture(Arc<Counter>);

    impl Capture {
        fn new() -> (Self, Arc<Counter>) {
            let live = Arc::new(Counter::new(1));
            (Self(live.clone()), live)
        }
    }

    impl Clone for Capture {
        fn clone(&self) -> Self {
            self.0.fetch_add(1, Ord_::SeqCst);
            Self(self.0.clone())
        }
    }

    impl Drop for Capture {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ord_::SeqCst);
        }
    }

    #[test]
    fn delivery_and_disconnect() {
        let signal = Signal::<i32>::new();
        let trace: Arc<parking_lot::Mutex<Vec<(char, i32)>>> = Arc::default();

        let t = trace.clone();
        let mut a = signal.connect(move |x| t.lock().push(('a', *x)));
        let t = trace.clone();
        let mut b = signal.connect(move |x| t.lock().push(('b', *x)));

        signal.emit(&7);
        signal.emit(&3);
        a.disconnect();
        signal.emit(&1);

        assert_eq!(
            *trace.lock(),
            vec![('a', 7), ('b', 7), ('a', 3), ('b', 3), ('b', 1)]
        );
        b.disconnect();
        signal.emit(&9);
        assert_eq!(trace.lock().len(), 5);
    }

    #[test]
    fn captured_state_released_on_disconnect() {
        let signal = Signal::<i32>::new();
        let (capture, live) = Capture::new();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let mut conn = signal.connect(move |_| {
            let _keep = &capture;
            c.fetch_add(1, Ord_::SeqCst);
        });

        signal.emit(&1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
        assert_eq!(live.load(Ord_::SeqCst), 1);

        conn.disconnect();
        // no readers were active, so the sync point ran inline and the
        // captured state is gone already
        assert_eq!(live.load(Ord_::SeqCst), 0);

        signal.emit(&2);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn self_cancel_fires_once() {
        let signal = Signal::<i32>::new();
        let slot: Arc<parking_lot::Mutex<Connection>> = Arc::default();
        let calls = Arc::new(Counter::new(0));

        let s = slot.clone();
        let c = calls.clone();
        let conn = signal.connect(move |_| {
            c.fetch_add(1, Ord_::SeqCst);
            s.lock().disconnect();
        });
        *slot.lock() = conn;

        signal.emit(&3);
        signal.emit(&4);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn self_cancel_keeps_later_callbacks() {
        let signal = Signal::<i32>::new();
        let trace: Arc<parking_lot::Mutex<Vec<char>>> = Arc::default();
        let slot: Arc<parking_lot::Mutex<Connection>> = Arc::default();

        let t = trace.clone();
        let s = slot.clone();
        let conn = signal.connect(move |_| {
            t.lock().push('c');
            s.lock().disconnect();
        });
        *slot.lock() = conn;
        let t = trace.clone();
        let _after = signal.connect(move |_| t.lock().push('d'));

        signal.emit(&0);
        // the self-cancelled callback ran exactly once and did not stop
        // the one registered after it
        assert_eq!(*trace.lock(), vec!['c', 'd']);
    }

    #[test]
    fn mutual_cancel_fires_exactly_one() {
        let signal = Signal::<i32>::new();
        let calls = Arc::new(Counter::new(0));
        let slots: Arc<parking_lot::Mutex<(Connection, Connection)>> = Arc::default();

        let make = |slots: Arc<parking_lot::Mutex<(Connection, Connection)>>,
                    calls: Arc<Counter>| {
            move |_: &i32| {
                calls.fetch_add(1, Ord_::SeqCst);
                let mut slots = slots.lock();
                slots.0.disconnect();
                slots.1.disconnect();
            }
        };

        let c1 = signal.connect(make(slots.clone(), calls.clone()));
        let c2 = signal.connect(make(slots.clone(), calls.clone()));
        *slots.lock() = (c1, c2);

        signal.emit(&5);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn cancel_first_of_two() {
        let signal = Signal::<i32>::new();
        let called = Arc::new(Counter::new(0));

        let c = called.clone();
        let mut link1 = signal.connect(move |x| {
            c.fetch_add(*x as usize, Ord_::SeqCst);
        });
        let c = called.clone();
        let mut link2 = signal.connect(move |x| {
            c.fetch_add(*x as usize, Ord_::SeqCst);
        });

        signal.emit(&1);
        assert_eq!(called.load(Ord_::SeqCst), 2);

        link1.disconnect();
        signal.emit(&1);
        assert_eq!(called.load(Ord_::SeqCst), 3);

        link2.disconnect();
    }

    #[test]
    fn cancel_second_of_two() {
        let signal = Signal::<i32>::new();
        let called = Arc::new(Counter::new(0));

        let c = called.clone();
        let mut link1 = signal.connect(move |_| {
            c.fetch_add(1, Ord_::SeqCst);
        });
        let c = called.clone();
        let mut link2 = signal.connect(move |_| {
            c.fetch_add(1, Ord_::SeqCst);
        });

        signal.emit(&1);
        assert_eq!(called.load(Ord_::SeqCst), 2);

        link2.disconnect();
        signal.emit(&1);
        assert_eq!(called.load(Ord_::SeqCst), 3);

        link1.disconnect();
    }

    #[test]
    fn chain_drop_releases_links() {
        let (capture, live) = Capture::new();
        let mut conn;
        {
            let signal = Signal::<i32>::new();
            conn = signal.connect(move |_| {
                let _keep = &capture;
            });
            assert_eq!(live.load(Ord_::SeqCst), 1);
        }
        // the chain disconnected the link on drop and dropped the closure
        assert_eq!(live.load(Ord_::SeqCst), 0);
        // the surviving handle is inert
        assert!(!conn.is_connected());
        conn.disconnect();
    }

    #[test]
    fn disconnect_all_disconnects_everything() {
        let signal = Signal::<i32>::new();
        let calls = Arc::new(Counter::new(0));
        for _ in 0..3 {
            let c = calls.clone();
            let _ = signal.connect(move |_| {
                c.fetch_add(1, Ord_::SeqCst);
            });
        }
        signal.emit(&0);
        assert_eq!(calls.load(Ord_::SeqCst), 3);

        assert!(signal.disconnect_all());
        assert!(!signal.disconnect_all());
        signal.emit(&0);
        assert_eq!(calls.load(Ord_::SeqCst), 3);
    }

    #[test]
    fn emit_races_connect_disconnect() {
        let signal = Arc::new(Signal::<i32>::new());
        let calls = Arc::new(Counter::new(0));
        let (capture, live) = Capture::new();

        let s = signal.clone();
        let emitter = std::thread::spawn(move || {
            for _ in 0..20_000 {
                s.emit(&1);
            }
        });

        let s = signal.clone();
        let c = calls.clone();
        let churner = std::thread::spawn(move || {
            for _ in 0..5_000 {
                let c = c.clone();
                let capture = capture.clone();
                let mut conn = s.connect(move |_| {
                    let _keep = &capture;
                    c.fetch_add(1, Ord_::SeqCst);
                });
                conn.disconnect();
            }
        });

        emitter.join().unwrap();
        churner.join().unwrap();

        assert!(!signal.disconnect_all());
        drop(signal);
        // every callback's captured state was released exactly once
        assert_eq!(live.load(Ord_::SeqCst), 0);
    }
}
