// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred procedure calls.
//!
//! A [`Workqueue`] dispatches two kinds of work:
//!
//! - *registered* procedures, armed through a [`WorkTrigger`] (with a
//!   cheap thread-safe trigger, or an async-signal-safe one) and run on
//!   the next dispatch;
//! - *ad-hoc* one-shot procedures enqueued with
//!   [`queue_procedure`](Workqueue::queue_procedure).
//!
//! One dispatch step runs **all** triggered registered procedures but
//! **at most one** ad-hoc item, re-arming itself if more remain, so a
//! producer that keeps enqueueing ad-hoc work cannot starve the timer
//! and I/O machinery sharing the event loop.

use core::ptr::{self, NonNull};
use std::collections::VecDeque;

use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use util::{CachePadded, non_null};

use crate::connection::{Connection, ConnectionLink};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering, fence};
use crate::sync::event_flag::EventTrigger;
use crate::sync::refptr::{self, Ref, RefCounted};

/// Link lifecycle. Transitions:
///
/// - `INACTIVE → ACTIVE`: normal trigger; moves the link from the
///   inactive to the active list. Service lock held.
/// - `INACTIVE → ASYNC_TRIGGER_CRITICAL`: first step of async-safe
///   triggering; taken without any lock, possibly in a signal handler.
///   Acts as a spin-guard: normal code that needs a consistent view
///   spins until the handler leaves the critical section.
/// - `ASYNC_TRIGGER_CRITICAL → ASYNC_TRIGGERED`: handler done; the link
///   is on the async-triggered stack but still on the inactive list.
/// - `ASYNC_TRIGGERED → ACTIVE`: dispatch transfers the stack into the
///   active list. Service lock held.
/// - `INACTIVE/ASYNC_TRIGGERED/ACTIVE → DISCONNECTING`: disconnect;
///   removes the link from its list. Service lock held.
const INACTIVE: u8 = 0;
const ASYNC_TRIGGER_CRITICAL: u8 = 1;
const ASYNC_TRIGGERED: u8 = 2;
const ACTIVE: u8 = 3;
const DISCONNECTING: u8 = 4;

const_assert_eq!(INACTIVE, 0);

/// Dispatcher for deferred procedure calls.
pub struct Workqueue {
    // Box: links carry raw back-pointers to the core.
    core: Box<WorkqueueCore>,
}

/// Registration interface for deferred procedures.
pub trait WorkqueueService {
    /// Registers a procedure to be run (once) whenever the returned
    /// trigger has been pulled. The trigger is thread-safe but *not*
    /// async-signal safe; it is cheaper than the async-safe variant.
    fn register_deferred_procedure<F>(&self, function: F) -> (Connection, WorkTrigger)
    where
        F: Fn() + Send + Sync + 'static;

    /// Like [`register_deferred_procedure`](Self::register_deferred_procedure),
    /// but the returned trigger is async-signal safe.
    fn register_async_deferred_procedure<F>(&self, function: F) -> (Connection, WorkTrigger)
    where
        F: Fn() + Send + Sync + 'static;

    /// Enqueues a one-shot procedure. Queued procedures run in order,
    /// one per dispatch step.
    fn queue_procedure<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static;
}

struct WorkqueueCore {
    /// Stack of links async-triggered since the last dispatch.
    async_triggered: CachePadded<AtomicPtr<WorkLink>>,
    /// Triggered procedures, in trigger order. Guarded by `lock`.
    active: List,
    /// Registered but untriggered procedures. Guarded by `lock`.
    inactive: List,
    /// Ad-hoc one-shot queue. Guarded by `lock`.
    work: UnsafeCell<VecDeque<Box<dyn FnOnce() + Send>>>,
    pending: AtomicBool,
    /// Called (at most once per pending-transition) when new work
    /// arrives. Must be async-signal safe.
    trigger: Box<dyn Fn() + Send + Sync>,
    lock: Mutex<()>,
}

struct WorkLink {
    refcount: AtomicUsize,
    function: UnsafeCell<Option<Box<dyn Fn() + Send + Sync>>>,
    /// List linkage. Guarded by the service lock.
    prev: UnsafeCell<*mut WorkLink>,
    next: UnsafeCell<*mut WorkLink>,
    /// Linkage while on the async-triggered stack.
    async_trigger_next: AtomicPtr<WorkLink>,
    /// Back-pointer to the owning queue; null once disconnected.
    service: AtomicPtr<WorkqueueCore>,
    state: AtomicU8,
    /// Serializes disconnection against normal triggering.
    registration_mutex: Mutex<()>,
}

/// Trigger handle for a registered deferred procedure.
///
/// Pulling a trigger that is already pending, or whose procedure has
/// been disconnected, is a no-op.
#[derive(Clone)]
pub struct WorkTrigger {
    link: Ref<WorkLink>,
    kind: TriggerKind,
}

#[derive(Clone, Copy)]
enum TriggerKind {
    Normal,
    /// Async-signal safe. See [`Workqueue::register_async_deferred_procedure`];
    /// the dispatcher must outlive all trigger invocations.
    AsyncSafe,
}

/// Null-terminated intrusive list head. All access guarded by the
/// service lock.
struct List {
    first: UnsafeCell<*mut WorkLink>,
    last: UnsafeCell<*mut WorkLink>,
}

// === impl List ===

impl List {
    fn new() -> Self {
        Self {
            first: UnsafeCell::new(ptr::null_mut()),
            last: UnsafeCell::new(ptr::null_mut()),
        }
    }

    fn first(&self) -> *mut WorkLink {
        // Safety: only reads the pointer value; callers hold the service
        // lock.
        self.first.with(|p| unsafe { *p })
    }

    /// # Safety
    ///
    /// `element` must be on this list; the service lock must be held.
    unsafe fn erase(&self, element: *mut WorkLink) {
        // Safety: per the contract.
        unsafe {
            let prev = (*element).prev.with(|p| *p);
            let next = (*element).next.with(|p| *p);
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
        }
    }

    /// Inserts `element` before `pos` (at the end if `pos` is null).
    ///
    /// # Safety
    ///
    /// `element` must be off-list; `pos`, if non-null, must be on this
    /// list; the service lock must be held.
    unsafe fn insert_before(&self, pos: *mut WorkLink, element: *mut WorkLink) {
        // Safety: per the contract.
        unsafe {
            let next = pos;
            let prev = if pos.is_null() {
                self.last.with(|p| *p)
            } else {
                (*pos).prev.with(|p| *p)
            };

            (*element).next.with_mut(|p| *p = next);
            (*element).prev.with_mut(|p| *p = prev);
            if !next.is_null() {
                (*next).prev.with_mut(|p| *p = element);
            } else {
                self.last.with_mut(|p| *p = element);
            }
            if !prev.is_null() {
                (*prev).next.with_mut(|p| *p = element);
            } else {
                self.first.with_mut(|p| *p = element);
            }
        }
    }
}

// === impl Workqueue ===

impl Workqueue {
    /// Creates a work queue; `trigger` is called whenever work becomes
    /// pending and **must be async-signal safe** (e.g.
    /// [`IoReadyDispatcher::wake_up`](crate::IoReadyDispatcher::wake_up)).
    pub fn new(trigger: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            core: Box::new(WorkqueueCore {
                async_triggered: CachePadded(AtomicPtr::new(ptr::null_mut())),
                active: List::new(),
                inactive: List::new(),
                work: UnsafeCell::new(VecDeque::new()),
                pending: AtomicBool::new(false),
                trigger,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Whether a dispatch call would currently find work.
    pub fn pending(&self) -> bool {
        self.core.pending.load(Ordering::Relaxed)
    }

    /// Runs all triggered registered procedures and at most one ad-hoc
    /// item; if more ad-hoc work remains, the queue re-arms its trigger.
    /// Returns the number of procedures run.
    ///
    /// Panics from procedures propagate; no triggered work is lost (the
    /// queue re-arms itself on the unwind path).
    pub fn dispatch(&self) -> usize {
        let core = &*self.core;

        if !core.pending.load(Ordering::Relaxed) {
            return 0;
        }
        core.pending.store(false, Ordering::Relaxed);

        let retrigger = RetriggerGuard::new(core);

        let mut handled = 0;
        let mut guard = core.lock.lock();
        core.transfer_async_triggered();

        loop {
            let element = core.active.first();
            if element.is_null() {
                break;
            }
            // Safety: lock held; links on the lists are owned by them.
            unsafe {
                core.active.erase(element);
                core.inactive.insert_before(ptr::null_mut(), element);
                (*element).state.store(INACTIVE, Ordering::Release);

                // keep the link (and its closure) alive across the call
                // even if it disconnects itself concurrently
                let hold = Ref::retain_raw(non_null(element));
                drop(guard);
                hold.function.with(|f| {
                    if let Some(f) = (*f).as_ref() {
                        f();
                    }
                });
                drop(hold);
                guard = core.lock.lock();
            }
            handled += 1;
        }

        // at most one ad-hoc item per step
        // Safety: lock held.
        let (item, more_work) = unsafe {
            core.work
                .with_mut(|w| ((*w).pop_front(), !(*w).is_empty()))
        };
        drop(guard);

        if let Some(item) = item {
            item();
            handled += 1;

            if more_work {
                core.trigger();
            }
        }

        retrigger.deactivate();
        handled
    }
}

impl WorkqueueService for Workqueue {
    fn register_deferred_procedure<F>(&self, function: F) -> (Connection, WorkTrigger)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let link = self.core.register_link(Box::new(function));
        let trigger = WorkTrigger {
            link: link.clone(),
            kind: TriggerKind::Normal,
        };
        (link_connection(link), trigger)
    }

    fn register_async_deferred_procedure<F>(&self, function: F) -> (Connection, WorkTrigger)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let link = self.core.register_link(Box::new(function));
        let trigger = WorkTrigger {
            link: link.clone(),
            kind: TriggerKind::AsyncSafe,
        };
        (link_connection(link), trigger)
    }

    fn queue_procedure<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let core = &*self.core;
        let guard = core.lock.lock();
        // Safety: lock held.
        unsafe {
            core.work.with_mut(|w| (*w).push_back(Box::new(function)));
        }
        drop(guard);

        core.trigger();
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        let core = &*self.core;

        loop {
            let guard = core.lock.lock();
            let mut link = core.active.first();
            if link.is_null() {
                link = core.inactive.first();
            }
            if link.is_null() {
                drop(guard);
                break;
            }
            // Safety: the list holds a reference; promote it to keep the
            // link alive across the disconnect.
            let link = unsafe { Ref::retain_raw(non_null(link)) };
            drop(guard);
            link.disconnect();
        }

        // release the stack references of links that were async-triggered
        // but never dispatched
        let mut link = core.async_triggered.swap(ptr::null_mut(), Ordering::Acquire);
        while !link.is_null() {
            // Safety: the swapped-out stack is ours alone; every entry
            // carries its own reference.
            unsafe {
                let next = (*link).async_trigger_next.load(Ordering::Relaxed);
                refptr::release(non_null(link));
                link = next;
            }
        }
    }
}

fn link_connection(link: Ref<WorkLink>) -> Connection {
    let raw = NonNull::new(Ref::into_raw(link).as_ptr() as *mut dyn ConnectionLink).unwrap();
    // Safety: `into_raw` transferred the reference to us.
    Connection::from_link(unsafe { Ref::adopt_raw(raw) })
}

// Safety: shared state is atomic or guarded as documented.
unsafe impl Send for WorkqueueCore {}
// Safety: see above.
unsafe impl Sync for WorkqueueCore {}
// Safety: see above.
unsafe impl Send for WorkLink {}
// Safety: see above.
unsafe impl Sync for WorkLink {}

// === impl WorkqueueCore ===

impl WorkqueueCore {
    fn register_link(&self, function: Box<dyn Fn() + Send + Sync>) -> Ref<WorkLink> {
        let link = Ref::new(WorkLink {
            refcount: AtomicUsize::new(1),
            function: UnsafeCell::new(Some(function)),
            prev: UnsafeCell::new(ptr::null_mut()),
            next: UnsafeCell::new(ptr::null_mut()),
            async_trigger_next: AtomicPtr::new(ptr::null_mut()),
            service: AtomicPtr::new(ptr::from_ref(self).cast_mut()),
            state: AtomicU8::new(INACTIVE),
            registration_mutex: Mutex::new(()),
        });

        // the queue's own reference
        // Safety: `link` keeps the node alive.
        unsafe { refptr::retain(link.as_ptr()) };

        let guard = self.lock.lock();
        // Safety: lock held, link is off-list.
        unsafe {
            self.inactive
                .insert_before(ptr::null_mut(), link.as_ptr().as_ptr());
        }
        drop(guard);

        link
    }

    /// Arms the pending flag and fires the wakeup on its clear → set
    /// transition. Async-signal safe.
    fn trigger(&self) {
        let was_pending = self.pending.swap(true, Ordering::Relaxed);
        if !was_pending {
            (self.trigger)();
        }
    }

    /// Moves every async-triggered link onto the active list, preserving
    /// trigger order. Must be called with the service lock held.
    fn transfer_async_triggered(&self) {
        let mut head = self.async_triggered.swap(ptr::null_mut(), Ordering::Acquire);
        if head.is_null() {
            return;
        }

        // The stack is LIFO: the newest trigger comes first. Each older
        // link is inserted before the previously transferred one, so the
        // active list ends up in trigger order.
        let mut insert_before = ptr::null_mut();
        while !head.is_null() {
            // Safety: stack entries carry their own reference and the
            // lock is held for the list surgery.
            unsafe {
                let next = (*head).async_trigger_next.load(Ordering::Relaxed);

                let state = (*head).sync_with_async_safe_trigger();
                if state == ASYNC_TRIGGERED {
                    self.inactive.erase(head);
                    self.active.insert_before(insert_before, head);
                    (*head).state.store(ACTIVE, Ordering::Relaxed);
                    insert_before = head;
                }
                // DISCONNECTING: the link already left its list; just
                // drop the stack's reference below.

                refptr::release(non_null(head));
                head = next;
            }
        }
    }
}

// === impl WorkLink ===

impl WorkLink {
    /// Waits out a signal handler that is inside the async-trigger
    /// critical section, then returns the settled state.
    fn sync_with_async_safe_trigger(&self) -> u8 {
        let mut state = self.state.load(Ordering::Relaxed);
        while state == ASYNC_TRIGGER_CRITICAL {
            core::hint::spin_loop();
            state = self.state.load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);
        state
    }

    fn normal_trigger(&self) {
        let reg_guard = self.registration_mutex.lock();
        let service = self.service.load(Ordering::Relaxed);
        if service.is_null() {
            return;
        }
        // Safety: the service pointer is only cleared (under the
        // registration mutex we hold) by disconnect, so the queue is
        // alive.
        let service = unsafe { &*service };

        let guard = service.lock.lock();
        if self.state.load(Ordering::Relaxed) != INACTIVE {
            return;
        }

        let this = ptr::from_ref(self).cast_mut();
        // Safety: lock held; an INACTIVE link is on the inactive list.
        unsafe {
            service.inactive.erase(this);
            service.active.insert_before(ptr::null_mut(), this);
        }
        self.state.store(ACTIVE, Ordering::Relaxed);

        service.trigger();
        drop(guard);
        drop(reg_guard);
    }

    /// Async-signal safe: no locks, only the state CAS, the stack push
    /// and the (async-safe) queue trigger.
    fn async_safe_trigger(&self) {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state != INACTIVE {
                // triggered already, or disconnected
                return;
            }
            match self.state.compare_exchange_weak(
                INACTIVE,
                ASYNC_TRIGGER_CRITICAL,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(changed) => state = changed,
            }
        }

        let service = self.service.load(Ordering::Relaxed);
        if service.is_null() {
            // lost a race with disconnect before it could mark us
            self.state.store(INACTIVE, Ordering::Relaxed);
            return;
        }

        let this = ptr::from_ref(self).cast_mut();
        // the stack entry carries its own reference
        // Safety: we are alive (called through a reference), and the
        // critical-section state keeps disconnect (and thereby queue
        // teardown) from completing until we are done.
        unsafe {
            refptr::retain(non_null(this));

            let mut expected = (*service).async_triggered.load(Ordering::Relaxed);
            loop {
                self.async_trigger_next.store(expected, Ordering::Relaxed);
                match (*service).async_triggered.compare_exchange_weak(
                    expected,
                    this,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(changed) => expected = changed,
                }
            }

            (*service).trigger();
        }

        // leave the critical section
        self.state.store(ASYNC_TRIGGERED, Ordering::Release);
    }

    fn disconnect(&self) {
        let reg_guard = self.registration_mutex.lock();
        let service = self.service.load(Ordering::Relaxed);
        if service.is_null() {
            return;
        }
        // Safety: see `normal_trigger`.
        let service = unsafe { &*service };

        {
            let guard = service.lock.lock();

            let mut state = self.sync_with_async_safe_trigger();
            loop {
                if state == ASYNC_TRIGGER_CRITICAL {
                    state = self.sync_with_async_safe_trigger();
                    continue;
                }
                if state == DISCONNECTING {
                    return;
                }
                match self.state.compare_exchange_weak(
                    state,
                    DISCONNECTING,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(changed) => state = changed,
                }
            }

            let this = ptr::from_ref(self).cast_mut();
            // Safety: lock held; ACTIVE links are on the active list,
            // INACTIVE and ASYNC_TRIGGERED ones on the inactive list.
            unsafe {
                if state == ACTIVE {
                    service.active.erase(this);
                } else {
                    service.inactive.erase(this);
                }
            }

            self.service.store(ptr::null_mut(), Ordering::Relaxed);
            drop(guard);
        }
        drop(reg_guard);

        // The closure is dropped with the link itself: a dispatch thread
        // may still be mid-call, protected by its own reference.
        // Safety: drop the queue's list reference, which we took over by
        // unlinking.
        unsafe { refptr::release(non_null(ptr::from_ref(self).cast_mut())) };
    }
}

// Safety: the counter is embedded and stable; links are allocated
// through `Ref::new`.
unsafe impl RefCounted for WorkLink {
    fn refcount(&self) -> &AtomicUsize {
        &self.refcount
    }
}

impl ConnectionLink for WorkLink {
    fn disconnect(&self) {
        WorkLink::disconnect(self);
    }

    fn is_connected(&self) -> bool {
        self.state.load(Ordering::Relaxed) != DISCONNECTING
    }
}

// === impl WorkTrigger ===

impl WorkTrigger {
    /// Arms the procedure to run on the next dispatch. Safe to call from
    /// any thread; the handle obtained from
    /// [`register_async_deferred_procedure`](WorkqueueService::register_async_deferred_procedure)
    /// may also be called from signal handlers.
    pub fn trigger(&self) {
        match self.kind {
            TriggerKind::Normal => self.link.normal_trigger(),
            TriggerKind::AsyncSafe => self.link.async_safe_trigger(),
        }
    }
}

impl EventTrigger for WorkTrigger {
    fn set(&self) {
        self.trigger();
    }
}

/// Re-arms the queue unless dispatch ran to completion; keeps triggered
/// work visible if a procedure panics mid-dispatch.
struct RetriggerGuard<'a> {
    core: &'a WorkqueueCore,
    active: core::cell::Cell<bool>,
}

impl<'a> RetriggerGuard<'a> {
    fn new(core: &'a WorkqueueCore) -> Self {
        Self {
            core,
            active: core::cell::Cell::new(true),
        }
    }

    fn deactivate(&self) {
        self.active.set(false);
    }
}

impl Drop for RetriggerGuard<'_> {
    fn drop(&mut self) {
        if self.active.get() {
            self.core.trigger();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord_};

    fn queue() -> Workqueue {
        Workqueue::new(Box::new(|| {}))
    }

    #[test]
    fn triggered_procedure_runs_once() {
        let queue = queue();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let (_conn, trigger) = queue.register_deferred_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });

        assert_eq!(queue.dispatch(), 0);

        trigger.trigger();
        trigger.trigger();
        assert!(queue.pending());
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
        assert_eq!(queue.dispatch(), 0);

        trigger.trigger();
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 2);
    }

    #[test]
    fn async_triggered_procedure_runs_once() {
        let queue = queue();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let (_conn, trigger) = queue.register_async_deferred_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });

        trigger.trigger();
        trigger.trigger();
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
        assert_eq!(queue.dispatch(), 0);
    }

    #[test]
    fn async_trigger_order_is_preserved() {
        let queue = queue();
        let trace: Arc<parking_lot::Mutex<Vec<u8>>> = Arc::default();

        let triggers: Vec<_> = (0..3u8)
            .map(|n| {
                let t = trace.clone();
                let (_conn, trigger) = queue.register_async_deferred_procedure(move || {
                    t.lock().push(n);
                });
                // the connection handle is dropped, the registration stays
                trigger
            })
            .collect();

        for trigger in &triggers {
            trigger.trigger();
        }
        assert_eq!(queue.dispatch(), 3);
        assert_eq!(*trace.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn one_adhoc_item_per_dispatch() {
        let queue = queue();
        let trace: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::default();

        for name in ["q1", "q2", "q3"] {
            let t = trace.clone();
            queue.queue_procedure(move || t.lock().push(name));
        }

        assert_eq!(queue.dispatch(), 1);
        assert!(queue.pending(), "remaining ad-hoc work re-arms the queue");
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(queue.dispatch(), 0);

        assert_eq!(*trace.lock(), vec!["q1", "q2", "q3"]);
    }

    #[test]
    fn retriggering_procedure_cannot_starve_adhoc_work() {
        let queue = Arc::new(queue());
        let trace: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::default();

        let trigger_slot: Arc<parking_lot::Mutex<Option<WorkTrigger>>> = Arc::default();
        let t = trace.clone();
        let slot = trigger_slot.clone();
        let (_conn, trigger) = queue.register_async_deferred_procedure(move || {
            t.lock().push("p");
            // always re-arms itself
            if let Some(trigger) = slot.lock().as_ref() {
                trigger.trigger();
            }
        });
        *trigger_slot.lock() = Some(trigger.clone());

        for name in ["q1", "q2", "q3"] {
            let t = trace.clone();
            queue.queue_procedure(move || t.lock().push(name));
        }
        trigger.trigger();

        for _ in 0..4 {
            queue.dispatch();
        }

        let trace = trace.lock();
        // the self-re-arming procedure runs once per step and never
        // starves the one-shots
        let p_count = trace.iter().filter(|s| **s == "p").count();
        let shots: Vec<_> = trace.iter().filter(|s| **s != "p").collect();
        assert_eq!(p_count, 4);
        assert_eq!(shots, vec![&"q1", &"q2", &"q3"]);
    }

    #[test]
    fn disconnect_prevents_execution() {
        let queue = queue();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let (mut conn, trigger) = queue.register_deferred_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });

        trigger.trigger();
        conn.disconnect();
        assert!(!conn.is_connected());
        conn.disconnect();

        queue.dispatch();
        assert_eq!(calls.load(Ord_::SeqCst), 0);

        // triggering a disconnected procedure is a no-op
        trigger.trigger();
        assert_eq!(queue.dispatch(), 0);
    }

    #[test]
    fn disconnect_async_triggered_link() {
        let queue = queue();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let (mut conn, trigger) = queue.register_async_deferred_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });

        trigger.trigger();
        conn.disconnect();

        assert_eq!(queue.dispatch(), 0);
        assert_eq!(calls.load(Ord_::SeqCst), 0);
    }

    #[test]
    fn drop_disconnects_registrations() {
        let queue = queue();
        let (conn, trigger) = queue.register_deferred_procedure(|| {});
        let (conn2, _t2) = queue.register_async_deferred_procedure(|| {});

        drop(queue);
        assert!(!conn.is_connected());
        assert!(!conn2.is_connected());
        // inert afterwards
        trigger.trigger();
    }

    #[test]
    fn drop_reaps_async_triggered_stack() {
        let queue = queue();
        let (conn, trigger) = queue.register_async_deferred_procedure(|| {});

        trigger.trigger();
        drop(queue);
        assert!(!conn.is_connected());
    }

    #[test]
    fn triggers_from_threads() {
        let queue = Arc::new(queue());
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let (_conn, trigger) = queue.register_async_deferred_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let trigger = trigger.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1_000 {
                    trigger.trigger();
                }
            }));
        }
        let q = queue.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..1_000 {
                q.dispatch();
            }
        }));
        for h in handles {
            h.join().unwrap();
        }

        // drain whatever is still pending
        queue.dispatch();
        assert!(calls.load(Ord_::SeqCst) >= 1);
    }
}
