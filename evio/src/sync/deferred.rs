// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred reader/writer synchronization.
//!
//! The locks in this module admit concurrent readers and concurrent
//! writers to a shared container: readers are never blocked, writers
//! restrict themselves to mutations that preserve the invariants readers
//! rely on (forward pointers keep their values, nodes are not freed), and
//! destructive work is queued up. The locks track when the container has
//! reached a quiescent state and *hand the queued work back to whichever
//! caller happens to observe that state*: that caller must apply it and
//! then call [`sync_finished`].
//!
//! This is RCU-like synchronization where the grace period is provided by
//! a reader count instead of per-thread epochs: cheap, but with no
//! obstruction-freedom guarantee (a writer can in principle wait
//! arbitrarily long for readers to drain).
//!
//! The protocol is expressed through boolean returns:
//!
//! - [`read_lock`]/[`read_unlock`] returning `false` is the fast path:
//!   proceed.
//! - A `true` return means the lock is now in *synchronizing* state: the
//!   caller holds the writer mutex, must apply all queued destructive
//!   work, then call [`sync_finished`] (and, for `read_lock`, retry).
//! - [`write_lock_async`] always returns holding the writer mutex. A
//!   `true` return additionally means no readers are active: the caller
//!   is exclusive, may apply destructive work directly, and must finish
//!   with [`sync_finished`]. On `false`, readers may still be in flight:
//!   mutations must be queued and the lock released with
//!   [`write_unlock_async`]; some subsequent operation is then guaranteed
//!   to return `true` so the queued work gets applied.
//!
//! [`read_lock`]: DeferredRwLock::read_lock
//! [`read_unlock`]: DeferredRwLock::read_unlock
//! [`sync_finished`]: DeferredRwLock::sync_finished
//! [`write_lock_async`]: DeferredRwLock::write_lock_async
//! [`write_unlock_async`]: DeferredRwLock::write_unlock_async

use core::mem;

use parking_lot::{Condvar, Mutex};
use util::CachePadded;

use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Reader/writer synchronization with deferred destructive updates.
///
/// See the [module docs](self) for the protocol. The reader count starts
/// at 1; the value 0 is reserved to mean "synchronization pending", which
/// is what diverts readers onto the slow path while queued work is being
/// applied.
pub struct DeferredRwLock {
    /// Reader count. Base value 1; 0 means a synchronization is pending.
    readers: CachePadded<AtomicUsize>,
    /// Serializes writers and the synchronizing state.
    writers: Mutex<()>,
    /// Whether destructive work is queued. Guarded by `writers`.
    queued: AtomicBool,
}

/// [`DeferredRwLock`] plus the ability to *block* for an exclusive write
/// lock ([`write_lock_sync`](Self::write_lock_sync)), mainly to force a
/// defined synchronization point (e.g. container teardown) despite the
/// starvation the fully asynchronous protocol allows.
pub struct DeferrableRwLock {
    readers: CachePadded<AtomicUsize>,
    writers: Mutex<()>,
    waiting_writers: Condvar,
    /// Whether destructive work is queued. Guarded by `writers`.
    queued: AtomicBool,
    /// Whether a synchronous writer is waiting. Guarded by `writers`.
    waiting: AtomicBool,
}

// === impl DeferredRwLock ===

impl DeferredRwLock {
    pub fn new() -> Self {
        Self {
            readers: CachePadded(AtomicUsize::new(1)),
            writers: Mutex::new(()),
            queued: AtomicBool::new(false),
        }
    }

    /// Acquire a shared read lock.
    ///
    /// Returns `false` on success. Returns `true` if the lock is in
    /// synchronizing state instead: apply queued work, call
    /// [`sync_finished`](Self::sync_finished), then retry.
    #[inline]
    pub fn read_lock(&self) -> bool {
        if read_acquire(&self.readers) {
            false
        } else {
            self.read_lock_slow()
        }
    }

    /// Release a read lock taken with [`read_lock`](Self::read_lock).
    ///
    /// Returns `true` if the caller became responsible for applying
    /// queued work; it must then call [`sync_finished`](Self::sync_finished).
    #[inline]
    pub fn read_unlock(&self) -> bool {
        if read_release(&self.readers) {
            false
        } else {
            self.read_unlock_slow()
        }
    }

    /// Acquire the (asynchronous) write lock. Always returns holding the
    /// writer mutex; `true` means the caller is exclusive and must finish
    /// with [`sync_finished`](Self::sync_finished), `false` means readers
    /// may be active and mutations must be queued, finishing with
    /// [`write_unlock_async`](Self::write_unlock_async).
    pub fn write_lock_async(&self) -> bool {
        let guard = self.writers.lock();
        mem::forget(guard);
        if !self.queued.load(Ordering::Relaxed) {
            self.queued.store(true, Ordering::Relaxed);
            self.readers.fetch_sub(1, Ordering::Acquire) == 1
        } else {
            false
        }
    }

    /// Release the write lock after a `false` return of
    /// [`write_lock_async`](Self::write_lock_async).
    pub fn write_unlock_async(&self) {
        // Safety: per the protocol the caller holds the writer mutex,
        // acquired in `write_lock_async` (or a slow-path `true` return).
        unsafe { self.writers.force_unlock() }
    }

    /// Leave the synchronizing state: reset the reader count base and
    /// release the writer mutex. Must be called after any operation
    /// returned `true`.
    pub fn sync_finished(&self) {
        self.queued.store(false, Ordering::Relaxed);
        self.readers.fetch_add(1, Ordering::Release);
        self.write_unlock_async();
    }

    #[cold]
    fn read_lock_slow(&self) -> bool {
        let guard = self.writers.lock();
        if read_acquire(&self.readers) {
            drop(guard);
            false
        } else {
            mem::forget(guard);
            true
        }
    }

    #[cold]
    fn read_unlock_slow(&self) -> bool {
        let guard = self.writers.lock();
        // If another thread observed the 1 -> 0 transition it takes the
        // mutex before acting on it, and a 0 -> 1 transition only happens
        // with the mutex held; the mutex therefore provides all the
        // ordering needed for this relaxed load.
        if self.readers.load(Ordering::Relaxed) != 0 {
            drop(guard);
            false
        } else {
            mem::forget(guard);
            true
        }
    }
}

impl Default for DeferredRwLock {
    fn default() -> Self {
        Self::new()
    }
}

// === impl DeferrableRwLock ===

impl DeferrableRwLock {
    pub fn new() -> Self {
        Self {
            readers: CachePadded(AtomicUsize::new(1)),
            writers: Mutex::new(()),
            waiting_writers: Condvar::new(),
            queued: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
        }
    }

    /// See [`DeferredRwLock::read_lock`].
    #[inline]
    pub fn read_lock(&self) -> bool {
        if read_acquire(&self.readers) {
            false
        } else {
            self.read_lock_slow()
        }
    }

    /// See [`DeferredRwLock::read_unlock`].
    #[inline]
    pub fn read_unlock(&self) -> bool {
        if read_release(&self.readers) {
            false
        } else {
            self.read_unlock_slow()
        }
    }

    /// See [`DeferredRwLock::write_lock_async`]. Additionally never
    /// claims exclusivity while a synchronous writer is waiting, so that
    /// [`write_lock_sync`](Self::write_lock_sync) cannot be starved of
    /// the base slot it has already consumed.
    pub fn write_lock_async(&self) -> bool {
        let guard = self.writers.lock();
        mem::forget(guard);
        let mut sync = false;
        if !self.queued.load(Ordering::Relaxed) && !self.waiting.load(Ordering::Relaxed) {
            sync = self.readers.fetch_sub(1, Ordering::Acquire) == 1;
        }
        self.queued.store(true, Ordering::Relaxed);
        sync
    }

    /// See [`DeferredRwLock::write_unlock_async`].
    pub fn write_unlock_async(&self) {
        // Safety: per the protocol the caller holds the writer mutex.
        unsafe { self.writers.force_unlock() }
    }

    /// Block until no reader is active, no work is queued and no other
    /// synchronous writer won. On return the caller holds the lock
    /// exclusively and must release it with
    /// [`write_unlock_sync`](Self::write_unlock_sync).
    pub fn write_lock_sync(&self) {
        let mut guard = self.writers.lock();
        loop {
            if !self.queued.load(Ordering::Relaxed) && !self.waiting.load(Ordering::Relaxed) {
                // Consume the base slot, but only if no synchronization is
                // in flight (count 0): decrementing from 0 would corrupt
                // the counter.
                let mut cur = self.readers.load(Ordering::Relaxed);
                while cur != 0 {
                    match self.readers.compare_exchange_weak(
                        cur,
                        cur - 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(prev) => {
                            if prev == 1 {
                                mem::forget(guard);
                                return;
                            }
                            // Readers are active. The slot stays consumed:
                            // the last reader to drain will observe the
                            // 1 -> 0 transition, perform the
                            // synchronization and restore the slot, waking
                            // us in the process.
                            break;
                        }
                        Err(changed) => cur = changed,
                    }
                }
            }
            self.waiting.store(true, Ordering::Relaxed);
            self.waiting_writers.wait(&mut guard);
        }
    }

    /// Release a lock acquired with [`write_lock_sync`](Self::write_lock_sync).
    ///
    /// Equivalent to [`sync_finished`](Self::sync_finished).
    pub fn write_unlock_sync(&self) {
        self.sync_finished();
    }

    /// See [`DeferredRwLock::sync_finished`].
    pub fn sync_finished(&self) {
        self.queued.store(false, Ordering::Relaxed);
        self.waiting.store(false, Ordering::Relaxed);
        self.readers.fetch_add(1, Ordering::Release);
        self.write_unlock_async();
    }

    #[cold]
    fn read_lock_slow(&self) -> bool {
        let mut guard = self.writers.lock();
        while self.waiting.load(Ordering::Relaxed) {
            self.waiting.store(false, Ordering::Relaxed);
            self.waiting_writers.notify_all();
            drop(guard);
            guard = self.writers.lock();
        }
        if read_acquire(&self.readers) {
            drop(guard);
            false
        } else {
            mem::forget(guard);
            true
        }
    }

    #[cold]
    fn read_unlock_slow(&self) -> bool {
        let mut guard = self.writers.lock();
        while self.waiting.load(Ordering::Relaxed) {
            self.waiting.store(false, Ordering::Relaxed);
            drop(guard);
            self.waiting_writers.notify_all();
            guard = self.writers.lock();
        }
        // See DeferredRwLock::read_unlock_slow for why relaxed suffices.
        if self.readers.load(Ordering::Relaxed) != 0 {
            drop(guard);
            false
        } else {
            mem::forget(guard);
            true
        }
    }
}

impl Default for DeferrableRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn read_acquire(readers: &AtomicUsize) -> bool {
    let mut expected = readers.load(Ordering::Relaxed);
    loop {
        if expected == 0 {
            return false;
        }
        match readers.compare_exchange_weak(
            expected,
            expected + 1,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(changed) => expected = changed,
        }
    }
}

#[inline]
fn read_release(readers: &AtomicUsize) -> bool {
    readers.fetch_sub(1, Ordering::Release) != 1
}

/// A container protected by a [`DeferrableRwLock`].
///
/// `synchronize` is called whenever a lock operation reports that queued
/// destructive work must be applied; implementations must drain their
/// deferred-destroy state, call [`DeferrableRwLock::sync_finished`] on
/// [`lock`](Self::lock), and only then free the drained memory (outside
/// the lock).
pub(crate) trait SharedChain {
    fn lock(&self) -> &DeferrableRwLock;
    fn synchronize(&self);
}

/// RAII read lock over a [`SharedChain`], performing synchronization on
/// acquire and release as required. Panic-safe: the lock is released even
/// if a callback invoked under it unwinds.
pub(crate) struct ReadGuard<'a, T: SharedChain> {
    chain: &'a T,
}

impl<'a, T: SharedChain> ReadGuard<'a, T> {
    pub(crate) fn new(chain: &'a T) -> Self {
        while chain.lock().read_lock() {
            chain.synchronize();
        }
        Self { chain }
    }
}

impl<T: SharedChain> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        if self.chain.lock().read_unlock() {
            self.chain.synchronize();
        }
    }
}

/// RAII asynchronous write lock over a [`SharedChain`].
///
/// While held, mutations must be limited to reader-safe ones unless
/// [`exclusive`](Self::exclusive) reports `true`. Dropping the guard
/// either synchronizes (exclusive case) or releases the writer mutex.
pub(crate) struct AsyncWriteGuard<'a, T: SharedChain> {
    chain: &'a T,
    exclusive: bool,
}

impl<'a, T: SharedChain> AsyncWriteGuard<'a, T> {
    pub(crate) fn new(chain: &'a T) -> Self {
        let exclusive = chain.lock().write_lock_async();
        Self { chain, exclusive }
    }

    /// Whether the lock is held exclusively (no readers active or able to
    /// become active); destructive mutation is permitted only then.
    #[allow(dead_code, reason = "part of the guard contract")]
    pub(crate) fn exclusive(&self) -> bool {
        self.exclusive
    }
}

impl<T: SharedChain> Drop for AsyncWriteGuard<'_, T> {
    fn drop(&mut self) {
        if self.exclusive {
            self.chain.synchronize();
        } else {
            self.chain.lock().write_unlock_async();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord_};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn read_fast_path() {
        let lock = DeferredRwLock::new();
        for _ in 0..100 {
            assert!(!lock.read_lock());
        }
        for _ in 0..100 {
            assert!(!lock.read_unlock());
        }
    }

    #[test]
    fn deferrable_read_fast_path_nested() {
        let lock = DeferrableRwLock::new();
        assert!(!lock.read_lock());
        assert!(!lock.read_lock());
        assert!(!lock.read_unlock());
        assert!(!lock.read_unlock());
    }

    #[test]
    fn writer_exclusive_without_readers() {
        let lock = DeferredRwLock::new();
        assert!(lock.write_lock_async());
        lock.sync_finished();

        // and again, to prove sync_finished restored the base slot
        assert!(lock.write_lock_async());
        lock.sync_finished();
    }

    #[test]
    fn writer_not_exclusive_with_reader() {
        let lock = DeferredRwLock::new();
        assert!(!lock.read_lock());

        assert!(!lock.write_lock_async());
        lock.write_unlock_async();

        // the queued flag diverts the reader onto the slow path; it
        // becomes responsible for the synchronization
        assert!(lock.read_unlock());
        lock.sync_finished();

        assert!(!lock.read_lock());
        assert!(!lock.read_unlock());
    }

    #[test]
    fn second_async_writer_sees_queued() {
        let lock = DeferredRwLock::new();
        assert!(!lock.read_lock());

        assert!(!lock.write_lock_async());
        lock.write_unlock_async();
        // still queued: a second writer may not claim exclusivity, and
        // must not consume the base slot a second time
        assert!(!lock.write_lock_async());
        lock.write_unlock_async();

        // the single draining reader performs the synchronization
        assert!(lock.read_unlock());
        lock.sync_finished();

        assert!(!lock.read_lock());
        assert!(!lock.read_unlock());
    }

    #[test]
    fn write_lock_sync_blocks_until_reader_drains() {
        let lock = Arc::new(DeferrableRwLock::new());
        let applied = Arc::new(Counter::new(0));

        assert!(!lock.read_lock());

        let l2 = lock.clone();
        let a2 = applied.clone();
        let writer = thread::spawn(move || {
            let start = Instant::now();
            l2.write_lock_sync();
            a2.fetch_add(1, Ord_::SeqCst);
            l2.write_unlock_sync();
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(applied.load(Ord_::SeqCst), 0);

        if lock.read_unlock() {
            lock.sync_finished();
        }

        let waited = writer.join().unwrap();
        assert!(waited >= Duration::from_millis(50));
        assert_eq!(applied.load(Ord_::SeqCst), 1);

        // lock is usable afterwards
        assert!(!lock.read_lock());
        assert!(!lock.read_unlock());
    }

    /// Shared chain whose "queued destructive work" is a counter, so the
    /// deferred-apply plumbing can be stress-tested without real nodes.
    struct CountingChain {
        lock: DeferrableRwLock,
        queued_work: Counter,
        applied: Counter,
    }

    impl CountingChain {
        fn new() -> Self {
            Self {
                lock: DeferrableRwLock::new(),
                queued_work: Counter::new(0),
                applied: Counter::new(0),
            }
        }

        fn queue_and_flush(&self) {
            let guard = AsyncWriteGuard::new(self);
            self.queued_work.fetch_add(1, Ord_::SeqCst);
            drop(guard);
        }
    }

    impl SharedChain for CountingChain {
        fn lock(&self) -> &DeferrableRwLock {
            &self.lock
        }

        fn synchronize(&self) {
            let pending = self.queued_work.swap(0, Ord_::SeqCst);
            self.lock.sync_finished();
            self.applied.fetch_add(pending, Ord_::SeqCst);
        }
    }

    #[test]
    fn stress_readers_vs_async_writers() {
        let chain = Arc::new(CountingChain::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let chain = chain.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    let _guard = ReadGuard::new(&*chain);
                }
            }));
        }
        for _ in 0..2 {
            let chain = chain.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    chain.queue_and_flush();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // force a final synchronization point
        chain.lock.write_lock_sync();
        let pending = chain.queued_work.swap(0, Ord_::SeqCst);
        chain.lock.write_unlock_sync();
        chain.applied.fetch_add(pending, Ord_::SeqCst);

        assert_eq!(chain.applied.load(Ord_::SeqCst), 2_000);
    }
}
