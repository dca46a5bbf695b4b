// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! I/O readiness dispatching.
//!
//! An [`IoReadyDispatcher`] watches file descriptors for readiness and
//! delivers events to registered callbacks. Four backends implement the
//! same contract behind one interface (`epoll`, `kqueue`, `poll` and
//! `select`), and [`IoReadyDispatcher::new`] probes them in preference
//! order for the running system, memoizing the first one that works.
//!
//! `dispatch` may be called from any number of threads concurrently;
//! separate ready events are distributed among them.

pub(crate) mod dispatcher;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) mod kqueue;
pub(crate) mod fd_table;
pub(crate) mod poll;
pub(crate) mod select;

use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use cfg_if::cfg_if;

use crate::connection::{Connection, ConnectionLink};
use crate::error::CreateDispatcherError;
// process-wide memo, deliberately outside the loom shim: loom atomics
// cannot live in a static
use core::sync::atomic::{AtomicU8, Ordering};

use crate::sync::event_flag::EventTrigger;
use crate::sync::refptr::Ref;
use dispatcher::Dispatcher;
use poll::PollBackend;
use select::SelectBackend;

bitflags::bitflags! {
    /// I/O readiness event bits.
    ///
    /// Hangup and error conditions are fanned out onto the input and
    /// output bits as well, matching historical `select`/`poll`
    /// semantics: a reader blocked on input must wake up when the peer
    /// hangs up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoEvents: u32 {
        /// Descriptor is ready for reading.
        const INPUT = 0x001;
        /// Descriptor is ready for writing.
        const OUTPUT = 0x002;
        /// An error condition is pending.
        const ERROR = 0x100;
        /// The peer hung up.
        const HANGUP = 0x200;
    }
}

/// Link type behind an [`IoReadyConnection`].
pub trait IoReadyLink: ConnectionLink {
    /// Replace the event mask of this registration.
    fn modify(&self, events: IoEvents);

    /// The event mask of this registration.
    fn event_mask(&self) -> IoEvents;
}

/// Handle for a file-descriptor readiness registration.
///
/// Like [`Connection`], but additionally allows changing the event mask
/// without re-registering.
#[derive(Clone, Default)]
pub struct IoReadyConnection {
    link: Option<Ref<dyn IoReadyLink>>,
}

/// [`IoReadyConnection`] variant that disconnects in its destructor.
#[derive(Default)]
pub struct ScopedIoReadyConnection {
    connection: IoReadyConnection,
}

/// Registration interface for I/O readiness callbacks.
pub trait IoReadyService {
    /// Registers `function` to be called whenever `fd` is ready for any
    /// of the events in `events`.
    ///
    /// The caller must keep `fd` open until the returned connection has
    /// been disconnected; the table's cookie mechanism protects against
    /// stale events of a *recycled* descriptor, not against dispatching
    /// on a closed one.
    fn watch<F>(&self, function: F, fd: RawFd, events: IoEvents) -> IoReadyConnection
    where
        F: Fn(IoEvents) + Send + Sync + 'static;
}

/// Selects one of the compiled I/O readiness backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll,
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue,
    Poll,
    Select,
}

/// Dispatcher for I/O readiness events.
///
/// Wraps whichever backend was selected at construction time behind a
/// uniform interface.
pub struct IoReadyDispatcher {
    inner: Inner,
}

enum Inner {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(Dispatcher<epoll::EpollBackend>),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue(Dispatcher<kqueue::KqueueBackend>),
    Poll(Dispatcher<PollBackend>),
    Select(Dispatcher<SelectBackend>),
}

macro_rules! with_inner {
    ($self:expr, $d:ident => $e:expr) => {
        match &$self.inner {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Inner::Epoll($d) => $e,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Inner::Kqueue($d) => $e,
            Inner::Poll($d) => $e,
            Inner::Select($d) => $e,
        }
    };
}

// === impl IoReadyConnection ===

impl IoReadyConnection {
    pub fn new() -> Self {
        Self { link: None }
    }

    pub(crate) fn from_link(link: Ref<dyn IoReadyLink>) -> Self {
        Self { link: Some(link) }
    }

    /// Break the registration. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }

    /// Replace the event mask of the registration. No-op on a
    /// disconnected handle.
    pub fn modify(&self, events: IoEvents) {
        if let Some(link) = self.link.as_ref() {
            link.modify(events);
        }
    }

    pub fn event_mask(&self) -> IoEvents {
        self.link
            .as_ref()
            .map_or(IoEvents::empty(), |link| link.event_mask())
    }
}

impl From<IoReadyConnection> for Connection {
    fn from(mut connection: IoReadyConnection) -> Connection {
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

// === impl ScopedIoReadyConnection ===

impl ScopedIoReadyConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn modify(&self, events: IoEvents) {
        self.connection.modify(events);
    }

    pub fn event_mask(&self) -> IoEvents {
        self.connection.event_mask()
    }

    /// Replaces the held connection, disconnecting the previous one.
    pub fn replace(&mut self, connection: IoReadyConnection) {
        self.disconnect();
        self.connection = connection;
    }
}

impl From<IoReadyConnection> for ScopedIoReadyConnection {
    fn from(connection: IoReadyConnection) -> Self {
        Self { connection }
    }
}

impl Drop for ScopedIoReadyConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// === impl IoReadyDispatcher ===

/// Memoized result of the backend probe. 0 = not probed yet, otherwise
/// `BackendKind` discriminant + 1.
static CHOSEN_BACKEND: AtomicU8 = AtomicU8::new(0);

impl IoReadyDispatcher {
    /// Creates a dispatcher using the preferred backend for this system.
    ///
    /// Probes the compiled backends in preference order and memoizes the
    /// choice process-wide (idempotently), so subsequent dispatchers skip
    /// the probing.
    pub fn new() -> Result<Self, CreateDispatcherError> {
        if let Some(kind) = chosen_backend() {
            return Self::with_backend(kind).map_err(CreateDispatcherError::new);
        }

        let mut last = io::Error::from(io::ErrorKind::Unsupported);
        for &kind in probe_order() {
            match Self::with_backend(kind) {
                Ok(dispatcher) => {
                    remember_backend(kind);
                    tracing::debug!(backend = dispatcher.backend_name(), "selected backend");
                    return Ok(dispatcher);
                }
                Err(error) => {
                    tracing::debug!(backend = ?kind, %error, "backend probe failed");
                    last = error;
                }
            }
        }
        Err(CreateDispatcherError::new(last))
    }

    /// Creates a dispatcher pinned to a specific backend.
    pub fn with_backend(kind: BackendKind) -> io::Result<Self> {
        let inner = match kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::Epoll => Inner::Epoll(Dispatcher::new()?),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            BackendKind::Kqueue => Inner::Kqueue(Dispatcher::new()?),
            BackendKind::Poll => Inner::Poll(Dispatcher::new()?),
            BackendKind::Select => Inner::Select(Dispatcher::new()?),
        };
        Ok(Self { inner })
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        with_inner!(self, d => d.backend_name())
    }

    /// Waits for ready events (up to `timeout`; indefinitely if `None`)
    /// and dispatches up to `limit` of them. Returns the number of events
    /// dispatched.
    ///
    /// A concurrent [`wake_up`](Self::wake_up) makes the call return
    /// early; a wake-up that arrives before the call makes it return
    /// without blocking.
    pub fn dispatch(&self, timeout: Option<Duration>, limit: usize) -> usize {
        with_inner!(self, d => d.dispatch(timeout, limit))
    }

    /// Dispatches up to `limit` already-pending events without blocking.
    pub fn dispatch_pending(&self, limit: usize) -> usize {
        with_inner!(self, d => d.dispatch_pending(limit))
    }

    /// Interrupt a concurrent (or the next) blocking
    /// [`dispatch`](Self::dispatch). Async-signal safe.
    pub fn wake_up(&self) {
        with_inner!(self, d => d.wake_up());
    }

    /// The async-safe trigger that interrupts blocking dispatch calls.
    pub fn event_trigger(&self) -> Arc<dyn EventTrigger> {
        with_inner!(self, d => d.event_trigger())
    }

    pub(crate) fn watch_boxed(
        &self,
        function: Box<dyn Fn(IoEvents) + Send + Sync>,
        fd: RawFd,
        events: IoEvents,
    ) -> IoReadyConnection {
        with_inner!(self, d => d.watch_boxed(function, fd, events))
    }
}

impl IoReadyService for IoReadyDispatcher {
    fn watch<F>(&self, function: F, fd: RawFd, events: IoEvents) -> IoReadyConnection
    where
        F: Fn(IoEvents) + Send + Sync + 'static,
    {
        self.watch_boxed(Box::new(function), fd, events)
    }
}

fn probe_order() -> &'static [BackendKind] {
    cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            &[BackendKind::Epoll, BackendKind::Poll, BackendKind::Select]
        } else if #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))] {
            &[BackendKind::Kqueue, BackendKind::Poll, BackendKind::Select]
        } else {
            &[BackendKind::Poll, BackendKind::Select]
        }
    }
}

fn kind_to_tag(kind: BackendKind) -> u8 {
    match kind {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        BackendKind::Epoll => 1,
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        BackendKind::Kqueue => 2,
        BackendKind::Poll => 3,
        BackendKind::Select => 4,
    }
}

fn chosen_backend() -> Option<BackendKind> {
    match CHOSEN_BACKEND.load(Ordering::Relaxed) {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1 => Some(BackendKind::Epoll),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        2 => Some(BackendKind::Kqueue),
        3 => Some(BackendKind::Poll),
        4 => Some(BackendKind::Select),
        _ => None,
    }
}

fn remember_backend(kind: BackendKind) {
    CHOSEN_BACKEND.store(kind_to_tag(kind), Ordering::Relaxed);
}
