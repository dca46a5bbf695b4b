// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timer callbacks.
//!
//! A [`TimerDispatcher`] keeps active timers in an intrusive Fibonacci
//! min-heap keyed by expiry time and suspended timers on a side list.
//! It is generic over the [`TimePoint`] type, so it can be driven by any
//! clock; [`run`](TimerDispatcher::run) expects the caller to feed in
//! the current time periodically (the reactor does this from its event
//! loop).
//!
//! Timers fire *at or after* their expiry time; how much after depends
//! on scheduling and dispatch latency, which is why the callback
//! receives the current time: a periodic timer that wants to avoid
//! drift re-arms itself relative to its originally desired expiry, not
//! relative to `now`.
//!
//! Whenever an insertion or re-arm produces a new earliest timer, the
//! dispatcher fires its wakeup trigger so a blocked event loop can
//! recompute its timeout.

pub(crate) mod heap;

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use util::non_null;

use crate::connection::{Connection, ConnectionLink};
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering, fence};
use crate::sync::event_flag::EventTrigger;
use crate::sync::refptr::{self, Ref, RefCounted};
use heap::{FibAnchor, FibHeap, FibNode};

/// A point in time, as the timer machinery needs it: totally ordered,
/// cloneable and sendable.
pub trait TimePoint: Clone + Ord + Send + 'static {}

impl<T: Clone + Ord + Send + 'static> TimePoint for T {}

/// Registration interface for timer callbacks.
pub trait TimerService<T: TimePoint = Instant> {
    /// Calls `function` at (or shortly after) `when`. The callback may
    /// re-arm the timer through its connection handle.
    fn timer<F>(&self, function: F, when: T) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static;

    /// Like [`timer`](Self::timer), but the registration disconnects
    /// itself right before the callback fires.
    fn one_shot_timer<F>(&self, function: F, when: T) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static;

    /// Registers `function` without scheduling it; arm it later with
    /// [`TimerConnection::set`].
    fn suspended_timer<F>(&self, function: F) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static;

    /// [`suspended_timer`](Self::suspended_timer) +
    /// [`one_shot_timer`](Self::one_shot_timer).
    fn one_shot_suspended_timer<F>(&self, function: F) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static;
}

/// Dispatches timer callbacks from a caller-driven clock.
pub struct TimerDispatcher<T: TimePoint = Instant> {
    // Box: links carry raw back-pointers to the core.
    core: Box<TimerCore<T>>,
}

struct TimerCore<T: TimePoint> {
    sets: Mutex<TimerSets<T>>,
    /// Fired when an insertion/re-arm produces a new earliest timer.
    timer_added: Arc<dyn EventTrigger>,
}

struct TimerSets<T: TimePoint> {
    active: FibHeap<TimerLink<T>>,
    suspended: SuspendedList<T>,
}

struct TimerLink<T: TimePoint> {
    refcount: AtomicUsize,
    /// The callback. Cleared when the last hold is released (see
    /// `hold_count`) or at dispatcher teardown.
    function: UnsafeCell<Option<Box<dyn Fn(T) + Send + Sync>>>,
    /// Expiry time; `None` until first armed. Guarded by the core mutex.
    when: UnsafeCell<Option<T>>,
    /// Heap / suspended-list linkage. Guarded by the core mutex.
    anchor: UnsafeCell<FibAnchor<TimerLink<T>>>,
    /// Back-pointer to the owning dispatcher; null once disconnected.
    master: AtomicPtr<TimerCore<T>>,
    /// Keeps the callback alive across a firing that races with
    /// disconnect. Starts at 1; the count reaching 0 drops the closure.
    hold_count: AtomicUsize,
    suspended: AtomicBool,
    one_shot: bool,
    /// Serializes set/suspend/disconnect.
    registry_mutex: Mutex<()>,
}

/// Handle for a timer registration: re-arm, suspend or disconnect it.
#[derive(Clone)]
pub struct TimerConnection<T: TimePoint = Instant> {
    link: Option<Ref<TimerLink<T>>>,
}

impl<T: TimePoint> Default for TimerConnection<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// [`TimerConnection`] variant that disconnects in its destructor.
pub struct ScopedTimerConnection<T: TimePoint = Instant> {
    connection: TimerConnection<T>,
}

impl<T: TimePoint> Default for ScopedTimerConnection<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Null-terminated intrusive list of suspended timers, threading the
/// heap anchor's sibling pointers (a link is never in both structures).
struct SuspendedList<T: TimePoint> {
    first: *mut TimerLink<T>,
    last: *mut TimerLink<T>,
}

// === impl SuspendedList ===

impl<T: TimePoint> SuspendedList<T> {
    const fn new() -> Self {
        Self {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }

    fn first(&self) -> *mut TimerLink<T> {
        self.first
    }

    /// # Safety
    ///
    /// `link` must be alive and on no list/heap; the core mutex must be
    /// held.
    unsafe fn push_back(&mut self, link: *mut TimerLink<T>) {
        // Safety: per the contract.
        unsafe {
            let anchor = (*link).anchor();
            (*anchor).set_list_prev(self.last);
            (*anchor).set_list_next(ptr::null_mut());
            if self.last.is_null() {
                self.first = link;
            } else {
                (*(*self.last).anchor()).set_list_next(link);
            }
            self.last = link;
        }
    }

    /// # Safety
    ///
    /// `link` must be on this list; the core mutex must be held.
    unsafe fn erase(&mut self, link: *mut TimerLink<T>) {
        // Safety: per the contract.
        unsafe {
            let anchor = (*link).anchor();
            let prev = (*anchor).list_prev();
            let next = (*anchor).list_next();
            if prev.is_null() {
                self.first = next;
            } else {
                (*(*prev).anchor()).set_list_next(next);
            }
            if next.is_null() {
                self.last = prev;
            } else {
                (*(*next).anchor()).set_list_prev(prev);
            }
        }
    }
}

// === impl TimerDispatcher ===

impl<T: TimePoint> TimerDispatcher<T> {
    /// Creates a dispatcher; `timer_added` is fired whenever the
    /// earliest pending timer changes.
    pub fn new(timer_added: Arc<dyn EventTrigger>) -> Self {
        Self {
            core: Box::new(TimerCore {
                sets: Mutex::new(TimerSets {
                    active: FibHeap::new(),
                    suspended: SuspendedList::new(),
                }),
                timer_added,
            }),
        }
    }

    /// The expiry time of the earliest pending timer, if any.
    ///
    /// This check may race with concurrent registration; the dispatch
    /// loop clears the wakeup flag first, checks, then waits on flag and
    /// timeout atomically, so a timer inserted in between re-runs the
    /// loop instead of being missed.
    pub fn next_timer(&self) -> Option<T> {
        let sets = self.core.sets.lock();
        if sets.active.is_empty() {
            return None;
        }
        let link = sets.active.peek_min();
        // Safety: heap members are alive and `when` is guarded by the
        // mutex we hold; active links are always armed.
        unsafe { (*(*link).when.get()).clone() }
    }

    /// Runs all timers due at `now`, up to `limit`. Returns the number
    /// of callbacks invoked.
    ///
    /// Timers armed during the run to a time at or before `now` are run
    /// as well (subject to `limit`).
    pub fn run(&self, now: T, limit: usize) -> usize {
        let mut count = 0;
        while count < limit {
            if self.run_single(now.clone()) {
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    /// Runs the earliest timer if it is due at `now`.
    ///
    /// The timer is first moved into suspended state (from where the
    /// callback may re-arm it), disconnected if one-shot, then fired
    /// with `now`. A hold count keeps the closure alive even if the
    /// callback disconnects its own registration.
    pub fn run_single(&self, now: T) -> bool {
        let link;
        {
            let mut sets = self.core.sets.lock();
            let candidate = sets.active.peek_min();
            if candidate.is_null() {
                return false;
            }
            // Safety: heap members are alive; `when` is guarded by the
            // mutex and always armed for active links.
            let due = unsafe {
                match &*(*candidate).when.get() {
                    Some(when) => *when <= now,
                    None => false,
                }
            };
            if !due {
                return false;
            }

            let min = sets.active.extract_min().expect("peeked a non-empty heap");
            debug_assert_eq!(min.as_ptr(), candidate);
            // Safety: the heap's reference moves to the suspended list;
            // our own keeps the link across the callback.
            link = unsafe { Ref::retain_raw(min) };
            // Safety: just extracted, so the link is off-heap; mutex held.
            unsafe { sets.suspended.push_back(min.as_ptr()) };
            link.suspended.store(true, Ordering::Relaxed);
            link.acquire_hold();
        }

        if link.one_shot {
            ConnectionLink::disconnect(&*link);
        }

        let hold = HoldGuard(&link);
        // Safety: the hold count keeps the closure alive until after the
        // call, even if the callback disconnects itself.
        unsafe {
            if let Some(function) = (*link.function.get()).as_ref() {
                function(now);
            }
        }
        drop(hold);

        true
    }

    fn register_timer(
        &self,
        function: Box<dyn Fn(T) + Send + Sync>,
        when: Option<T>,
        one_shot: bool,
    ) -> TimerConnection<T> {
        let core = &*self.core;
        let suspended = when.is_none();
        let link = Ref::new(TimerLink {
            refcount: AtomicUsize::new(1),
            function: UnsafeCell::new(Some(function)),
            when: UnsafeCell::new(when),
            anchor: UnsafeCell::new(FibAnchor::new()),
            master: AtomicPtr::new(ptr::from_ref(core).cast_mut()),
            hold_count: AtomicUsize::new(1),
            suspended: AtomicBool::new(suspended),
            one_shot,
            registry_mutex: Mutex::new(()),
        });

        let mut need_wakeup = false;
        {
            let mut sets = core.sets.lock();
            // the dispatcher's own reference
            // Safety: `link` keeps the node alive.
            unsafe { refptr::retain(link.as_ptr()) };
            let raw = link.as_ptr().as_ptr();
            if suspended {
                // Safety: fresh link, mutex held.
                unsafe { sets.suspended.push_back(raw) };
            } else {
                // Safety: fresh link, mutex held.
                unsafe { sets.active.insert(link.as_ptr()) };
                need_wakeup = sets.active.peek_min() == raw;
            }
        }
        if need_wakeup {
            core.timer_added.set();
        }

        TimerConnection { link: Some(link) }
    }

    fn detach_registered(&self) -> bool {
        let link;
        {
            let mut sets = self.core.sets.lock();
            let raw = match sets.active.extract_min() {
                Some(raw) => Some(raw),
                None => {
                    let first = sets.suspended.first();
                    if first.is_null() {
                        None
                    } else {
                        // Safety: `first` is on the list, mutex held.
                        unsafe { sets.suspended.erase(first) };
                        // Safety: non-null.
                        Some(unsafe { non_null(first) })
                    }
                }
            };
            match raw {
                // Safety: adopt the dispatcher's reference.
                Some(raw) => {
                    let detached = unsafe { Ref::adopt_raw(raw) };
                    detached.master.store(ptr::null_mut(), Ordering::Relaxed);
                    link = Some(detached);
                }
                None => link = None,
            }
        }

        match link {
            Some(link) => {
                // Safety: the link is off both structures and its master
                // pointer is cleared; nothing can fire it anymore.
                unsafe { (*link.function.get()).take() };
                drop(link);
                true
            }
            None => false,
        }
    }
}

impl<T: TimePoint> TimerService<T> for TimerDispatcher<T> {
    fn timer<F>(&self, function: F, when: T) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register_timer(Box::new(function), Some(when), false)
    }

    fn one_shot_timer<F>(&self, function: F, when: T) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register_timer(Box::new(function), Some(when), true)
    }

    fn suspended_timer<F>(&self, function: F) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register_timer(Box::new(function), None, false)
    }

    fn one_shot_suspended_timer<F>(&self, function: F) -> TimerConnection<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register_timer(Box::new(function), None, true)
    }
}

impl<T: TimePoint> Drop for TimerDispatcher<T> {
    fn drop(&mut self) {
        while self.detach_registered() {}
    }
}

// Safety: shared state is atomic or guarded by the core mutex as
// documented.
unsafe impl<T: TimePoint> Send for TimerCore<T> {}
// Safety: see above.
unsafe impl<T: TimePoint> Sync for TimerCore<T> {}
// Safety: see above.
unsafe impl<T: TimePoint> Send for TimerLink<T> {}
// Safety: see above.
unsafe impl<T: TimePoint> Sync for TimerLink<T> {}

/// Releases a firing hold when dropped, so a panicking callback still
/// balances the count.
struct HoldGuard<'a, T: TimePoint>(&'a Ref<TimerLink<T>>);

impl<T: TimePoint> Drop for HoldGuard<'_, T> {
    fn drop(&mut self) {
        self.0.release_hold();
    }
}

// === impl TimerLink ===

impl<T: TimePoint> TimerLink<T> {
    fn acquire_hold(&self) {
        self.hold_count.fetch_add(1, Ordering::Relaxed);
    }

    fn release_hold(&self) {
        if self.hold_count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            // Safety: the count reached zero: the link is disconnected
            // and no firing is in flight, so nobody can reach the slot.
            unsafe { (*self.function.get()).take() };
        }
    }

    fn set(&self, when: T) {
        let reg_guard = self.registry_mutex.lock();
        let master = self.master.load(Ordering::Relaxed);
        if master.is_null() {
            return;
        }
        // Safety: a non-null master means the dispatcher still holds a
        // reference to us and is alive.
        let master = unsafe { &*master };

        let mut sets = master.sets.lock();
        let this = ptr::from_ref(self).cast_mut();
        // Safety: mutex held; the link is on exactly one of the two
        // structures, per its suspended flag.
        unsafe {
            if self.suspended.load(Ordering::Relaxed) {
                sets.suspended.erase(this);
            } else {
                sets.active.remove(non_null(this));
            }
            *self.when.get() = Some(when);
            sets.active.insert(non_null(this));
        }
        self.suspended.store(false, Ordering::Relaxed);

        // no wakeup needed while the link is mid-firing: the running
        // dispatch rescans before sleeping
        if sets.active.peek_min() == this && self.hold_count.load(Ordering::Relaxed) < 2 {
            master.timer_added.set();
        }
        drop(sets);
        drop(reg_guard);
    }

    fn suspend(&self) {
        let reg_guard = self.registry_mutex.lock();
        let master = self.master.load(Ordering::Relaxed);
        if master.is_null() {
            return;
        }
        // Safety: see `set`.
        let master = unsafe { &*master };

        let mut sets = master.sets.lock();
        let this = ptr::from_ref(self).cast_mut();
        // Safety: see `set`.
        unsafe {
            if self.suspended.load(Ordering::Relaxed) {
                sets.suspended.erase(this);
            } else {
                sets.active.remove(non_null(this));
            }
            sets.suspended.push_back(this);
        }
        self.suspended.store(true, Ordering::Relaxed);
        drop(sets);
        drop(reg_guard);
    }

    fn disconnect(&self) {
        let reg_guard = self.registry_mutex.lock();
        let master = self.master.load(Ordering::Relaxed);
        if master.is_null() {
            return;
        }
        // Safety: see `set`.
        let master_ref = unsafe { &*master };

        {
            let mut sets = master_ref.sets.lock();
            let this = ptr::from_ref(self).cast_mut();
            // Safety: see `set`.
            unsafe {
                if self.suspended.load(Ordering::Relaxed) {
                    sets.suspended.erase(this);
                } else {
                    sets.active.remove(non_null(this));
                }
            }
            self.master.store(ptr::null_mut(), Ordering::Relaxed);
        }
        drop(reg_guard);

        // drop the initial hold; unless a firing is in flight this also
        // drops the closure
        self.release_hold();
        // Safety: drop the dispatcher's reference, which we took over by
        // unlinking.
        unsafe { refptr::release(non_null(ptr::from_ref(self).cast_mut())) };
    }
}

impl<T: TimePoint> FibNode for TimerLink<T> {
    fn anchor(&self) -> *mut FibAnchor<TimerLink<T>> {
        self.anchor.get()
    }

    fn before(&self, other: &TimerLink<T>) -> bool {
        // Safety: heap comparisons only happen under the core mutex,
        // which also guards `when`; heap members are always armed.
        unsafe {
            match (&*self.when.get(), &*other.when.get()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            }
        }
    }
}

// Safety: the counter is embedded and stable; links are allocated
// through `Ref::new`.
unsafe impl<T: TimePoint> RefCounted for TimerLink<T> {
    fn refcount(&self) -> &AtomicUsize {
        &self.refcount
    }
}

impl<T: TimePoint> ConnectionLink for TimerLink<T> {
    fn disconnect(&self) {
        TimerLink::disconnect(self);
    }

    fn is_connected(&self) -> bool {
        !self.master.load(Ordering::Relaxed).is_null()
    }
}

// === impl TimerConnection ===

impl<T: TimePoint> TimerConnection<T> {
    pub fn new() -> Self {
        Self { link: None }
    }

    /// Break the registration. Idempotent. Takes precedence over any
    /// concurrent re-arm.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }

    /// (Re-)arms the timer to fire at `when`, activating it if it was
    /// suspended. No-op on a disconnected handle.
    pub fn set(&self, when: T) {
        if let Some(link) = self.link.as_ref() {
            link.set(when);
        }
    }

    /// Moves the timer to the suspended list; it will not fire until
    /// re-armed with [`set`](Self::set).
    pub fn suspend(&self) {
        if let Some(link) = self.link.as_ref() {
            link.suspend();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.link
            .as_ref()
            .is_none_or(|link| link.suspended.load(Ordering::Relaxed))
    }

    /// The currently scheduled expiry, if the timer was ever armed.
    pub fn when(&self) -> Option<T> {
        let link = self.link.as_ref()?;
        let master = link.master.load(Ordering::Relaxed);
        if master.is_null() {
            return None;
        }
        // Safety: `when` is guarded by the core mutex; a non-null master
        // pointer keeps the core alive (see `TimerLink::set`).
        let _sets = unsafe { (*master).sets.lock() };
        unsafe { (*link.when.get()).clone() }
    }
}

impl<T: TimePoint> From<TimerConnection<T>> for Connection {
    fn from(mut connection: TimerConnection<T>) -> Connection {
        match connection.link.take() {
            Some(link) => {
                let raw =
                    NonNull::new(Ref::into_raw(link).as_ptr() as *mut dyn ConnectionLink).unwrap();
                // Safety: `into_raw` transferred the reference to us.
                Connection::from_link(unsafe { Ref::adopt_raw(raw) })
            }
            None => Connection::new(),
        }
    }
}

// === impl ScopedTimerConnection ===

impl<T: TimePoint> ScopedTimerConnection<T> {
    pub fn new() -> Self {
        Self {
            connection: TimerConnection::new(),
        }
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn set(&self, when: T) {
        self.connection.set(when);
    }

    pub fn suspend(&self) {
        self.connection.suspend();
    }

    /// Replaces the held connection, disconnecting the previous one.
    pub fn replace(&mut self, connection: TimerConnection<T>) {
        self.disconnect();
        self.connection = connection;
    }
}

impl<T: TimePoint> From<TimerConnection<T>> for ScopedTimerConnection<T> {
    fn from(connection: TimerConnection<T>) -> Self {
        Self { connection }
    }
}

impl<T: TimePoint> Drop for ScopedTimerConnection<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::event_flag::{EventFlag, SpinEventFlag};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord_};

    fn dispatcher() -> (TimerDispatcher<u64>, Arc<SpinEventFlag>) {
        let flag = Arc::new(SpinEventFlag::new());
        (TimerDispatcher::new(flag.clone()), flag)
    }

    #[test]
    fn fires_in_expiry_order() {
        let (timers, _flag) = dispatcher();
        let trace: Arc<parking_lot::Mutex<Vec<u64>>> = Arc::default();

        for when in [5u64, 2, 8] {
            let t = trace.clone();
            let _conn = timers.timer(move |_now| t.lock().push(when), when);
        }

        assert_eq!(timers.next_timer(), Some(2));
        assert_eq!(timers.run(10, usize::MAX), 3);
        assert_eq!(*trace.lock(), vec![2, 5, 8]);

        // everything fired: timers are parked in suspended state
        assert_eq!(timers.next_timer(), None);
        assert_eq!(timers.run(100, usize::MAX), 0);
    }

    #[test]
    fn not_due_timers_do_not_fire() {
        let (timers, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let _conn = timers.timer(
            move |_| {
                c.fetch_add(1, Ord_::SeqCst);
            },
            50,
        );

        assert_eq!(timers.run(49, usize::MAX), 0);
        assert_eq!(calls.load(Ord_::SeqCst), 0);
        assert_eq!(timers.run(50, usize::MAX), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn one_shot_disconnects_before_firing() {
        let (timers, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let conn = timers.one_shot_timer(
            move |_| {
                c.fetch_add(1, Ord_::SeqCst);
            },
            10,
        );

        assert!(conn.is_connected());
        assert_eq!(timers.run(10, usize::MAX), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
        assert!(!conn.is_connected());

        assert_eq!(timers.run(100, usize::MAX), 0);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn rearm_from_callback() {
        let (timers, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));
        let slot: Arc<parking_lot::Mutex<TimerConnection<u64>>> = Arc::default();

        let c = calls.clone();
        let s = slot.clone();
        let conn = timers.timer(
            move |now| {
                c.fetch_add(1, Ord_::SeqCst);
                // periodic: re-arm relative to the reported time
                s.lock().set(now + 5);
            },
            5,
        );
        *slot.lock() = conn;

        assert_eq!(timers.run(5, usize::MAX), 1);
        assert_eq!(timers.next_timer(), Some(10));
        assert_eq!(timers.run(10, usize::MAX), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 2);
        assert_eq!(timers.next_timer(), Some(15));
    }

    #[test]
    fn suspended_timer_needs_arming() {
        let (timers, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let conn = timers.suspended_timer(move |_| {
            c.fetch_add(1, Ord_::SeqCst);
        });

        assert!(conn.is_suspended());
        assert_eq!(timers.next_timer(), None);
        assert_eq!(timers.run(1_000, usize::MAX), 0);

        conn.set(10);
        assert!(!conn.is_suspended());
        assert_eq!(timers.next_timer(), Some(10));
        assert_eq!(timers.run(10, usize::MAX), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn suspend_prevents_firing() {
        let (timers, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let conn = timers.timer(
            move |_| {
                c.fetch_add(1, Ord_::SeqCst);
            },
            10,
        );

        conn.suspend();
        assert!(conn.is_suspended());
        assert_eq!(timers.run(100, usize::MAX), 0);
        assert_eq!(calls.load(Ord_::SeqCst), 0);

        conn.set(200);
        assert_eq!(timers.run(200, usize::MAX), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn self_disconnect_during_firing() {
        let (timers, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));
        let slot: Arc<parking_lot::Mutex<TimerConnection<u64>>> = Arc::default();

        let c = calls.clone();
        let s = slot.clone();
        let conn = timers.timer(
            move |_| {
                c.fetch_add(1, Ord_::SeqCst);
                s.lock().disconnect();
            },
            1,
        );
        *slot.lock() = conn;

        assert_eq!(timers.run(10, usize::MAX), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
        assert_eq!(timers.run(100, usize::MAX), 0);
    }

    #[test]
    fn new_earliest_timer_fires_wakeup() {
        let (timers, flag) = dispatcher();

        // the first timer is trivially the new minimum
        let _late = timers.timer(|_| {}, 100);
        assert!(flag.is_set());
        flag.clear();

        // not the new minimum: no wakeup
        let _later = timers.timer(|_| {}, 200);
        assert!(!flag.is_set());

        // new minimum: wakeup
        let _early = timers.timer(|_| {}, 50);
        assert!(flag.is_set());
    }

    #[test]
    fn limit_bounds_run() {
        let (timers, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        for when in 1u64..=5 {
            let c = calls.clone();
            let _ = timers.timer(
                move |_| {
                    c.fetch_add(1, Ord_::SeqCst);
                },
                when,
            );
        }

        assert_eq!(timers.run(10, 2), 2);
        assert_eq!(calls.load(Ord_::SeqCst), 2);
        assert_eq!(timers.run(10, usize::MAX), 3);
        assert_eq!(calls.load(Ord_::SeqCst), 5);
    }

    #[test]
    fn drop_detaches_registrations() {
        let calls = Arc::new(Counter::new(0));
        let conn;
        {
            let (timers, _flag) = dispatcher();
            let c = calls.clone();
            conn = timers.timer(
                move |_| {
                    c.fetch_add(1, Ord_::SeqCst);
                },
                10,
            );
            let c = calls.clone();
            let _suspended = timers.suspended_timer(move |_| {
                c.fetch_add(1, Ord_::SeqCst);
            });
        }
        assert!(!conn.is_connected());
        // inert afterwards
        conn.set(5);
        conn.suspend();
        assert_eq!(calls.load(Ord_::SeqCst), 0);
    }
}
