// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reactor: one event loop for I/O readiness, timers and deferred
//! work.
//!
//! ```no_run
//! // Echo stdin back to stdout, exit after 3 seconds of silence.
//! use std::time::{Duration, Instant};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use evio::{IoEvents, IoReadyService, Reactor, TimerService};
//!
//! let reactor = Arc::new(Reactor::new().unwrap());
//! let done = Arc::new(AtomicBool::new(false));
//!
//! let idle = reactor.timer(
//!     {
//!         let done = done.clone();
//!         let reactor = reactor.clone();
//!         move |_now| {
//!             done.store(true, Ordering::Relaxed);
//!             reactor.wake_up();
//!         }
//!     },
//!     Instant::now() + Duration::from_secs(3),
//! );
//!
//! let _conn = reactor.watch(
//!     move |_events| {
//!         let mut buffer = [0u8; 1024];
//!         // read(0, ..) / write(1, ..) elided
//!         idle.set(Instant::now() + Duration::from_secs(3));
//!     },
//!     0,
//!     IoEvents::INPUT,
//! );
//!
//! while !done.load(Ordering::Relaxed) {
//!     reactor.dispatch();
//! }
//! ```

use std::os::fd::RawFd;
use std::time::Instant;

use crate::connection::Connection;
use crate::error::CreateDispatcherError;
use crate::ioready::{IoEvents, IoReadyConnection, IoReadyDispatcher, IoReadyService};
use crate::timer::{TimerConnection, TimerDispatcher, TimerService};
use crate::workqueue::{WorkTrigger, Workqueue, WorkqueueService};

/// Composite dispatcher uniting an I/O readiness dispatcher, a timer
/// dispatcher on [`Instant`] and a work queue on a single event loop.
///
/// Any number of threads may call [`dispatch`](Self::dispatch)
/// concurrently; events are distributed among them. Registration
/// interfaces are those of the three service traits, all implemented on
/// this type.
pub struct Reactor {
    io: IoReadyDispatcher,
    timers: TimerDispatcher<Instant>,
    workqueue: Workqueue,
}

// === impl Reactor ===

impl Reactor {
    /// Creates a reactor using the preferred I/O backend for this
    /// system.
    pub fn new() -> Result<Self, CreateDispatcherError> {
        let io = IoReadyDispatcher::new()?;
        let timers = TimerDispatcher::new(io.event_trigger());
        let wakeup = io.event_trigger();
        let workqueue = Workqueue::new(Box::new(move || wakeup.set()));
        Ok(Self {
            io,
            timers,
            workqueue,
        })
    }

    /// Runs one iteration of the event loop:
    ///
    /// 1. dispatch the work queue (at most one ad-hoc item);
    /// 2. run all timers due at the current time;
    /// 3. block for I/O readiness until the next timer is due (or
    ///    indefinitely if none is pending), dispatching whatever fires.
    ///
    /// The call returns early when any event is handled, when new work
    /// or an earlier timer arrives, or when [`wake_up`](Self::wake_up)
    /// is called.
    ///
    /// Panics from handlers propagate; the reactor remains usable and no
    /// triggered work is lost.
    pub fn dispatch(&self) {
        self.workqueue.dispatch();

        let mut now = Instant::now();
        let mut next_timer = self.timers.next_timer();
        while let Some(due) = next_timer {
            if due > now {
                break;
            }
            self.timers.run(now, usize::MAX);
            now = Instant::now();
            next_timer = self.timers.next_timer();
        }

        let timeout = next_timer.map(|due| due.saturating_duration_since(now));
        self.io.dispatch(timeout, usize::MAX);
    }

    /// Handles a batch of pending events without ever blocking. Returns
    /// whether anything was processed (in which case calling again is
    /// usually worthwhile).
    pub fn dispatch_pending(&self) -> bool {
        let mut processed_events = self.workqueue.dispatch() > 0;

        if let Some(due) = self.timers.next_timer() {
            let now = Instant::now();
            if due <= now {
                processed_events |= self.timers.run(now, usize::MAX) > 0;
            }
        }

        if self.io.dispatch_pending(usize::MAX) > 0 {
            processed_events = true;
        }

        processed_events
    }

    /// Loops [`dispatch_pending`](Self::dispatch_pending) until nothing
    /// is left to process.
    pub fn dispatch_pending_all(&self) {
        while self.dispatch_pending() {}
    }

    /// Makes a concurrent (or the next) [`dispatch`](Self::dispatch)
    /// return without blocking. Async-signal safe and thread-safe.
    pub fn wake_up(&self) {
        self.io.wake_up();
    }
}

impl IoReadyService for Reactor {
    fn watch<F>(&self, function: F, fd: RawFd, events: IoEvents) -> IoReadyConnection
    where
        F: Fn(IoEvents) + Send + Sync + 'static,
    {
        self.io.watch_boxed(Box::new(function), fd, events)
    }
}

impl TimerService<Instant> for Reactor {
    fn timer<F>(&self, function: F, when: Instant) -> TimerConnection<Instant>
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.timers.timer(function, when)
    }

    fn one_shot_timer<F>(&self, function: F, when: Instant) -> TimerConnection<Instant>
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.timers.one_shot_timer(function, when)
    }

    fn suspended_timer<F>(&self, function: F) -> TimerConnection<Instant>
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.timers.suspended_timer(function)
    }

    fn one_shot_suspended_timer<F>(&self, function: F) -> TimerConnection<Instant>
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.timers.one_shot_suspended_timer(function)
    }
}

impl WorkqueueService for Reactor {
    fn register_deferred_procedure<F>(&self, function: F) -> (Connection, WorkTrigger)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.workqueue.register_deferred_procedure(function)
    }

    fn register_async_deferred_procedure<F>(&self, function: F) -> (Connection, WorkTrigger)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.workqueue.register_async_deferred_procedure(function)
    }

    fn queue_procedure<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.workqueue.queue_procedure(function)
    }
}
