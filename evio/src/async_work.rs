// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Procedures triggerable from signal-handler context.
//!
//! A procedure registered with an [`AsyncSafeWorkDispatcher`] gets an
//! [`AsyncTrigger`]: calling it marks the procedure's activation flag
//! and, on the flag's clear → set transition, pushes the link onto a
//! lock-free pending stack and fires the dispatcher's event trigger.
//! Neither step takes a mutex, so the trigger may be called from *any*
//! context, POSIX signal handlers in particular.
//!
//! [`dispatch`](AsyncSafeWorkDispatcher::dispatch) (called from a normal
//! thread) swaps out the pending stack and runs the procedures. Each
//! trigger results in at least one and at most one invocation per
//! dispatch round.

use core::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;
use util::{CachePadded, non_null};

use crate::connection::{Connection, ConnectionLink};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crate::sync::event_flag::EventTrigger;
use crate::sync::refptr::{self, Ref, RefCounted};

/// Dispatcher for procedures whose trigger is async-signal safe.
pub struct AsyncSafeWorkDispatcher {
    // Box: links carry raw back-pointers to the core.
    core: Box<AsyncWorkCore>,
}

struct AsyncWorkCore {
    /// Head of the pending LIFO stack. Pushed by triggers (possibly from
    /// signal handlers), swapped out whole by dispatch.
    pending: CachePadded<AtomicPtr<AsyncWorkLink>>,
    /// Number of links that were disconnected while on the pending
    /// stack; they are reaped by dispatch or teardown.
    async_cancel_count: AtomicUsize,
    /// Registered-procedure list. Guarded by `list_mutex`.
    first: UnsafeCell<*mut AsyncWorkLink>,
    last: UnsafeCell<*mut AsyncWorkLink>,
    list_mutex: Mutex<()>,
    trigger: Arc<dyn EventTrigger>,
}

pub(crate) struct AsyncWorkLink {
    refcount: AtomicUsize,
    function: UnsafeCell<Option<Box<dyn Fn() + Send + Sync>>>,
    /// Test-and-set flag gating the pending stack: at most one push per
    /// clear → set transition.
    activation_flag: AtomicBool,
    /// Linkage while on the pending stack. Only written by the single
    /// trigger that won the activation flag, read by the dispatcher that
    /// swapped the stack.
    pending_next: AtomicPtr<AsyncWorkLink>,
    /// Registered-list linkage. Guarded by the core's `list_mutex`.
    prev: UnsafeCell<*mut AsyncWorkLink>,
    next: UnsafeCell<*mut AsyncWorkLink>,
    service: AtomicPtr<AsyncWorkCore>,
    disconnected: AtomicBool,
    /// Serializes disconnection.
    registration_mutex: Mutex<()>,
}

/// Handle for a procedure registered with an
/// [`AsyncSafeWorkDispatcher`]; also exposes the trigger.
#[derive(Clone, Default)]
pub struct AsyncSafeConnection {
    link: Option<Ref<AsyncWorkLink>>,
}

/// Cloneable, allocation-free trigger handle for one registered
/// procedure. `trigger` is async-signal safe; the handle can be stashed
/// in a static and invoked from a signal handler.
///
/// Triggering a disconnected procedure is a no-op. The dispatcher must
/// outlive all trigger *invocations* (uninstall signal handlers before
/// tearing it down); the handle itself may outlive it.
#[derive(Clone)]
pub struct AsyncTrigger {
    link: Ref<AsyncWorkLink>,
}

// === impl AsyncSafeWorkDispatcher ===

impl AsyncSafeWorkDispatcher {
    /// Creates a dispatcher; `trigger` is fired whenever work becomes
    /// pending and must be async-signal safe (e.g. the event trigger of
    /// an I/O dispatcher, see
    /// [`IoReadyDispatcher::event_trigger`](crate::IoReadyDispatcher::event_trigger)).
    pub fn new(trigger: Arc<dyn EventTrigger>) -> Self {
        Self {
            core: Box::new(AsyncWorkCore {
                pending: CachePadded(AtomicPtr::new(ptr::null_mut())),
                async_cancel_count: AtomicUsize::new(0),
                first: UnsafeCell::new(ptr::null_mut()),
                last: UnsafeCell::new(ptr::null_mut()),
                list_mutex: Mutex::new(()),
                trigger,
            }),
        }
    }

    /// Registers `function` and returns its connection handle (from
    /// which [`AsyncTrigger`]s are obtained).
    pub fn async_procedure<F>(&self, function: F) -> AsyncSafeConnection
    where
        F: Fn() + Send + Sync + 'static,
    {
        let core = &*self.core;
        let link = Ref::new(AsyncWorkLink {
            refcount: AtomicUsize::new(1),
            function: UnsafeCell::new(Some(Box::new(function))),
            activation_flag: AtomicBool::new(false),
            pending_next: AtomicPtr::new(ptr::null_mut()),
            prev: UnsafeCell::new(ptr::null_mut()),
            next: UnsafeCell::new(ptr::null_mut()),
            service: AtomicPtr::new(ptr::from_ref(core).cast_mut()),
            disconnected: AtomicBool::new(false),
            registration_mutex: Mutex::new(()),
        });

        // the dispatcher's own reference
        // Safety: `link` keeps the node alive.
        unsafe { refptr::retain(link.as_ptr()) };

        let raw = link.as_ptr().as_ptr();
        let guard = core.list_mutex.lock();
        // Safety: registered-list fields are guarded by `list_mutex`.
        unsafe {
            let last = core.last.with(|p| *p);
            (*raw).prev.with_mut(|p| *p = last);
            (*raw).next.with_mut(|p| *p = ptr::null_mut());
            if last.is_null() {
                core.first.with_mut(|p| *p = raw);
            } else {
                (*last).next.with_mut(|p| *p = raw);
            }
            core.last.with_mut(|p| *p = raw);
        }
        drop(guard);

        AsyncSafeConnection { link: Some(link) }
    }

    /// Whether a dispatch call would currently find work.
    pub fn pending(&self) -> bool {
        !self.core.pending.load(Ordering::Relaxed).is_null()
    }

    /// Runs every procedure triggered since the last dispatch. Returns
    /// the number of procedures invoked.
    ///
    /// If a procedure panics, the panic propagates; the remaining
    /// swapped-out links are pushed back onto the pending stack and the
    /// event trigger is re-fired, so nothing is lost.
    pub fn dispatch(&self) -> usize {
        let core = &*self.core;

        // fast-path check
        if core.pending.load(Ordering::Relaxed).is_null() {
            return 0;
        }

        let mut handled = 0;
        let mut queue = DequeueGuard::new(core);

        while let Some(link) = queue.dequeue() {
            let link = link.as_ptr();
            let guard = core.list_mutex.lock();
            // Safety: the pending stack holds a reference; the link is
            // alive.
            unsafe {
                if !(*link).disconnected.load(Ordering::Relaxed) {
                    (*link).activation_flag.store(false, Ordering::Release);
                    // keep the link (and its closure) alive across the
                    // call even if it disconnects itself concurrently
                    let hold = Ref::retain_raw(non_null(link));
                    drop(guard);
                    // if this panics, the current procedure counts as
                    // processed and the guard re-stacks the rest
                    hold.function.with(|f| {
                        if let Some(f) = (*f).as_ref() {
                            f();
                        }
                    });
                    drop(hold);
                    handled += 1;
                } else {
                    // the flag stays set forever on a disconnected link,
                    // so a surviving trigger handle cannot re-publish it
                    drop(guard);
                    refptr::release(non_null(link));
                    core.async_cancel_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        handled
    }
}

impl Drop for AsyncSafeWorkDispatcher {
    fn drop(&mut self) {
        let core = &*self.core;

        // disconnect every registered procedure
        loop {
            let guard = core.list_mutex.lock();
            // Safety: list pointers are guarded by `list_mutex`.
            let first = core.first.with(|p| unsafe { *p });
            if first.is_null() {
                drop(guard);
                break;
            }
            // Safety: the list holds a reference, so the link is alive
            // until we disconnect it; promote to keep it alive across
            // the call.
            let link = unsafe { Ref::retain_raw(non_null(first)) };
            drop(guard);
            link.disconnect();
        }

        // reap pending-stack references of procedures that were
        // disconnected while triggered
        while core.async_cancel_count.load(Ordering::Relaxed) > 0 {
            let mut link = core.pending.swap(ptr::null_mut(), Ordering::Acquire);
            while !link.is_null() {
                // Safety: the swapped-out stack is ours alone.
                unsafe {
                    let next = (*link).pending_next.load(Ordering::Relaxed);
                    refptr::release(non_null(link));
                    core.async_cancel_count.fetch_sub(1, Ordering::Relaxed);
                    link = next;
                }
            }
        }
    }
}

// Safety: shared state is atomic or guarded as documented.
unsafe impl Send for AsyncWorkCore {}
// Safety: see above.
unsafe impl Sync for AsyncWorkCore {}
// Safety: see above.
unsafe impl Send for AsyncWorkLink {}
// Safety: see above.
unsafe impl Sync for AsyncWorkLink {}

/// Swaps the pending stack empty on construction; on drop, pushes
/// whatever was not dequeued back and re-fires the trigger (the panic /
/// partial-dispatch path).
struct DequeueGuard<'a> {
    core: &'a AsyncWorkCore,
    head: *mut AsyncWorkLink,
}

impl<'a> DequeueGuard<'a> {
    fn new(core: &'a AsyncWorkCore) -> Self {
        let head = core.pending.swap(ptr::null_mut(), Ordering::Acquire);
        Self { core, head }
    }

    fn dequeue(&mut self) -> Option<NonNull<AsyncWorkLink>> {
        if self.head.is_null() {
            return None;
        }
        let link = self.head;
        // Safety: the stack holds a reference to every linked node.
        self.head = unsafe { (*link).pending_next.load(Ordering::Relaxed) };
        // Safety: `link` is non-null.
        Some(unsafe { non_null(link) })
    }
}

impl Drop for DequeueGuard<'_> {
    fn drop(&mut self) {
        if self.head.is_null() {
            return;
        }

        // Safety: the remaining chain is ours; re-publish it whole.
        unsafe {
            let mut tail = self.head;
            while !(*tail).pending_next.load(Ordering::Relaxed).is_null() {
                tail = (*tail).pending_next.load(Ordering::Relaxed);
            }

            let mut expected = self.core.pending.load(Ordering::Relaxed);
            loop {
                (*tail).pending_next.store(expected, Ordering::Relaxed);
                match self.core.pending.compare_exchange_weak(
                    expected,
                    self.head,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(changed) => expected = changed,
                }
            }
        }
        self.core.trigger.set();
    }
}

// === impl AsyncWorkLink ===

impl AsyncWorkLink {
    /// Async-signal safe: marks the activation flag and publishes the
    /// link on the clear → set transition. No mutex anywhere on this
    /// path.
    ///
    /// The activation flag can only be clear while the link is
    /// registered (disconnection leaves it permanently set), so a
    /// winning trigger is guaranteed a live dispatcher to push to,
    /// provided triggers stop firing before the dispatcher is torn down
    /// (the caller's contract).
    fn trigger(&self) {
        if self.activation_flag.swap(true, Ordering::Acquire) {
            // already triggered (or disconnected)
            return;
        }

        let service = self.service.load(Ordering::Relaxed);
        // Safety: see above; the winning trigger's push is accounted for
        // by `disconnect` observing the set flag.
        unsafe {
            let this = ptr::from_ref(self).cast_mut();
            let mut expected = (*service).pending.load(Ordering::Relaxed);
            loop {
                self.pending_next.store(expected, Ordering::Relaxed);
                match (*service).pending.compare_exchange_weak(
                    expected,
                    this,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(changed) => expected = changed,
                }
            }
            (*service).trigger.set();
        }
    }

    fn disconnect(&self) {
        let reg_guard = self.registration_mutex.lock();

        if self.disconnected.load(Ordering::Relaxed) {
            return;
        }

        let service = self.service.load(Ordering::Relaxed);
        // Safety: `disconnected` was still clear, so the dispatcher still
        // holds a reference to us and is alive.
        let service = unsafe { &*service };

        let list_guard = service.list_mutex.lock();
        self.disconnected.store(true, Ordering::Relaxed);

        // unlink from the registered list
        // Safety: guarded by `list_mutex`.
        unsafe {
            let prev = self.prev.with(|p| *p);
            let next = self.next.with(|p| *p);
            if !prev.is_null() {
                (*prev).next.with_mut(|p| *p = next);
            } else {
                service.first.with_mut(|p| *p = next);
            }
            if !next.is_null() {
                (*next).prev.with_mut(|p| *p = prev);
            } else {
                service.last.with_mut(|p| *p = prev);
            }
        }

        if self.activation_flag.swap(true, Ordering::Release) {
            // Triggered already: the link either is, or is about to be,
            // on the pending stack (this races with `trigger`); dispatch
            // or teardown reaps the stack's reference.
            service.async_cancel_count.fetch_add(1, Ordering::Relaxed);
            drop(list_guard);
            drop(reg_guard);
        } else {
            drop(list_guard);
            drop(reg_guard);
            // Safety: dropping the dispatcher's reference, which we just
            // took over by unlinking.
            unsafe { refptr::release(non_null(ptr::from_ref(self).cast_mut())) };
        }
    }
}

// Safety: the counter is embedded and stable; links are allocated
// through `Ref::new`.
unsafe impl RefCounted for AsyncWorkLink {
    fn refcount(&self) -> &AtomicUsize {
        &self.refcount
    }
}

impl ConnectionLink for AsyncWorkLink {
    fn disconnect(&self) {
        AsyncWorkLink::disconnect(self);
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Relaxed)
    }
}

// === impl AsyncSafeConnection ===

impl AsyncSafeConnection {
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }

    /// Triggers the procedure once. Async-signal safe.
    pub fn trigger(&self) {
        if let Some(link) = self.link.as_ref() {
            link.trigger();
        }
    }

    /// A standalone trigger handle for this procedure.
    ///
    /// # Panics
    ///
    /// Panics if the connection is empty.
    pub fn get_trigger(&self) -> AsyncTrigger {
        AsyncTrigger {
            link: self.link.clone().expect("empty connection has no trigger"),
        }
    }
}

impl From<AsyncSafeConnection> for Connection {
    fn from(mut connection: AsyncSafeConnection) -> Connection {
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

// === impl AsyncTrigger ===

impl AsyncTrigger {
    /// Triggers the procedure once. Async-signal safe.
    pub fn trigger(&self) {
        self.link.trigger();
    }
}

impl EventTrigger for AsyncTrigger {
    fn set(&self) {
        self.trigger();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::event_flag::{EventFlag, SpinEventFlag};
    use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord_};

    fn dispatcher() -> (AsyncSafeWorkDispatcher, Arc<SpinEventFlag>) {
        let flag = Arc::new(SpinEventFlag::new());
        (AsyncSafeWorkDispatcher::new(flag.clone()), flag)
    }

    #[test]
    fn trigger_runs_once_per_dispatch() {
        let (dispatcher, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let conn = dispatcher.async_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });

        assert!(!dispatcher.pending());
        assert_eq!(dispatcher.dispatch(), 0);

        conn.trigger();
        // coalesces with the first one
        conn.trigger();
        assert!(dispatcher.pending());

        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
        assert_eq!(dispatcher.dispatch(), 0);

        // re-triggerable after dispatch
        conn.trigger();
        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 2);
    }

    #[test]
    fn trigger_sets_event_flag() {
        let (dispatcher, flag) = dispatcher();
        let conn = dispatcher.async_procedure(|| {});

        conn.trigger();
        // a blocked dispatcher thread would have been woken
        flag.wait();
        flag.clear();

        dispatcher.dispatch();
    }

    #[test]
    fn standalone_trigger_handle() {
        let (dispatcher, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let conn = dispatcher.async_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });
        let trigger = conn.get_trigger();
        drop(conn);

        trigger.trigger();
        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(calls.load(Ord_::SeqCst), 1);
    }

    #[test]
    fn disconnected_while_triggered_is_reaped() {
        let (dispatcher, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let mut conn = dispatcher.async_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });

        conn.trigger();
        conn.disconnect();

        // pending entry exists but the procedure must not run
        assert_eq!(dispatcher.dispatch(), 0);
        assert_eq!(calls.load(Ord_::SeqCst), 0);
    }

    #[test]
    fn disconnect_after_dispatch() {
        let (dispatcher, _flag) = dispatcher();
        let mut conn = dispatcher.async_procedure(|| {});

        conn.trigger();
        dispatcher.dispatch();
        conn.disconnect();
        assert!(!conn.is_connected());
        // second disconnect is a no-op
        conn.disconnect();

        assert_eq!(dispatcher.dispatch(), 0);
    }

    #[test]
    fn teardown_reaps_triggered_links() {
        let (dispatcher, _flag) = dispatcher();
        let conn = dispatcher.async_procedure(|| {});

        conn.trigger();
        // dropping without dispatching: the dispatcher must reap the
        // pending stack's reference
        drop(dispatcher);
        assert!(!conn.is_connected());
    }

    #[test]
    fn trigger_from_many_threads() {
        let (dispatcher, _flag) = dispatcher();
        let calls = Arc::new(Counter::new(0));

        let c = calls.clone();
        let conn = dispatcher.async_procedure(move || {
            c.fetch_add(1, Ord_::SeqCst);
        });
        let trigger = conn.get_trigger();

        for _ in 0..100 {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let trigger = trigger.clone();
                    std::thread::spawn(move || trigger.trigger())
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            // all concurrent triggers coalesce into exactly one run
            assert_eq!(dispatcher.dispatch(), 1);
        }
        assert_eq!(calls.load(Ord_::SeqCst), 100);
    }
}
