// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-safe callback and event dispatching for POSIX systems.
//!
//! `evio` lets application code register interest in four kinds of
//! asynchronous events and delivers them by invoking callbacks:
//!
//! - user-defined notifications through [`Signal`];
//! - file-descriptor readiness through [`IoReadyDispatcher`] (epoll,
//!   kqueue, poll or select behind one interface);
//! - timer expiry through [`TimerDispatcher`];
//! - deferred procedure execution through [`Workqueue`] and (with an
//!   async-signal-safe trigger) [`AsyncSafeWorkDispatcher`].
//!
//! A [`Reactor`] composes I/O, timers and the work queue into a single
//! dispatch loop suitable for driving a server or daemon.
//!
//! Registration returns a connection handle ([`Connection`] or one of
//! its specializations); dropping a handle keeps the callback
//! registered, `disconnect` breaks it. All registration, dispatch and
//! disconnection paths are safe to call from any number of threads
//! concurrently; dispatching traverses published callback lists without
//! taking a mutex, using the deferred synchronization primitives in
//! [`sync`].

pub mod connection;
mod error;
pub mod ioready;
pub mod loom;
pub mod reactor;
pub mod signal;
pub mod sync;
mod syscall;
pub mod timer;
pub mod workqueue;

pub mod async_work;

pub use async_work::{AsyncSafeConnection, AsyncSafeWorkDispatcher, AsyncTrigger};
pub use connection::{Connection, ConnectionLink, ScopedConnection};
pub use error::CreateDispatcherError;
pub use ioready::{
    BackendKind, IoEvents, IoReadyConnection, IoReadyDispatcher, IoReadyLink, IoReadyService,
    ScopedIoReadyConnection,
};
pub use reactor::Reactor;
pub use signal::Signal;
pub use sync::event_flag::{EventFlag, EventTrigger, PipeEventFlag};
pub use timer::{
    ScopedTimerConnection, TimePoint, TimerConnection, TimerDispatcher, TimerService,
};
pub use workqueue::{WorkTrigger, Workqueue, WorkqueueService};
