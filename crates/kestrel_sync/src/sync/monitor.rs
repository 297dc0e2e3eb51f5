//! # Monitor
//!
//! Shared/exclusive access to one entity, plus blocking until the entity
//! satisfies a predicate.
//!
//! ## Safety Note
//!
//! The entity lives in an `UnsafeCell`; every access happens under a
//! [`MonitorLock`] hold taken by this module, and a borrow flag turns any
//! same-thread reentry that would alias a `&mut` into a panic.

#![allow(unsafe_code)]
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────┐
//!                    │         Monitor<T, L>        │
//!                    │                              │
//!                    │  ┌──────────┐  ┌──────────┐  │
//!                    │  │ entity T │  │ borrows  │  │
//!                    │  └────┬─────┘  └────┬─────┘  │
//!                    │       │             │        │
//!                    │  ┌────┴─────────────┴─────┐  │
//!                    │  │  L: shared / exclusive │  │
//!                    │  │      + condition       │  │
//!                    │  └────────────────────────┘  │
//!                    └──────────────────────────────┘
//!                                  │
//!          ┌───────────────────────┼───────────────────────┐
//!          ▼                       ▼                       ▼
//!   ┌─────────────┐   ┌───────────────────────┐   ┌─────────────────┐
//!   │ read        │   │ read_when/read_within │   │ write*/set/swap │
//!   │ (shared)    │   │ exclusive → shared    │   │ exclusive +     │
//!   │             │   │ (downgrade)           │   │ signal          │
//!   └─────────────┘   └───────────────────────┘   └─────────────────┘
//! ```
//!
//! ## Ordering
//!
//! - Writers and predicate evaluations serialize on the exclusive half.
//! - Plain reads run concurrently with each other, never with a writer.
//! - A predicate-gated read evaluates its predicate under the exclusive half
//!   and downgrades to shared before running its callback, so no writer can
//!   slip between "predicate held" and "callback ran".

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::config::MonitorConfig;
use crate::error::{SyncError, SyncResult};
use crate::sync::lock::{MonitorLock, ReentrantRwLock};
use crate::time::{TimeTracker, TimeUnit};

/// Coordinates access to one entity across threads.
///
/// ## Usage
///
/// ```rust
/// use kestrel_sync::Monitor;
/// use std::{sync::Arc, thread};
///
/// let queue = Arc::new(Monitor::new(Vec::<String>::new()));
///
/// let consumer = {
///     let queue = Arc::clone(&queue);
///     thread::spawn(move || {
///         // Blocks until the queue has something in it.
///         queue.write_when(|q| q.pop(), |q| !q.is_empty()).unwrap()
///     })
/// };
///
/// queue.write(|q| q.push("Hello Monitor!".to_string()));
/// assert_eq!(consumer.join().unwrap().as_deref(), Some("Hello Monitor!"));
/// ```
///
/// # Panics
///
/// Re-entering the same monitor from inside one of its callbacks in a way
/// that would alias the entity panics: any access from a `write*` operator, or
/// a `write*` from a read callback or predicate. Reading inside a read is fine.
pub struct Monitor<T, L = ReentrantRwLock> {
    entity: UnsafeCell<T>,
    borrows: BorrowFlag,
    lock: L,
    label: Option<String>,
}

// SAFETY: `&Monitor` hands out `&T` to several threads at once (needs
// `T: Sync`) and lets any thread replace or move the entity (needs `T: Send`).
// `L: MonitorLock` guarantees the exclusion those accesses rely on.
unsafe impl<T: Send + Sync, L: MonitorLock> Sync for Monitor<T, L> {}

impl<T> Monitor<T> {
    /// Creates a monitor over `entity` with a default [`ReentrantRwLock`].
    #[must_use]
    pub fn new(entity: T) -> Self {
        Self::with_lock(entity, ReentrantRwLock::new())
    }

    /// Creates a monitor with the configured lock policy and label.
    #[must_use]
    pub fn with_config(entity: T, config: &MonitorConfig) -> Self {
        let mut monitor = Self::with_lock(entity, ReentrantRwLock::with_policy(config.policy));
        monitor.label.clone_from(&config.label);
        monitor
    }
}

impl<T: Default> Default for Monitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, L: MonitorLock> Monitor<T, L> {
    /// Creates a monitor over `entity` coordinated by a caller-supplied lock.
    #[must_use]
    pub fn with_lock(entity: T, lock: L) -> Self {
        Self {
            entity: UnsafeCell::new(entity),
            borrows: BorrowFlag::new(),
            lock,
            label: None,
        }
    }

    /// The lock coordinating this monitor.
    #[must_use]
    pub fn lock(&self) -> &L {
        &self.lock
    }

    /// Label used in tracing events.
    #[must_use]
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("unnamed")
    }

    /// Mutable access without locking; the `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.entity.get_mut()
    }

    /// Consumes the monitor, returning the entity.
    pub fn into_inner(self) -> T {
        self.entity.into_inner()
    }

    /// Runs `f` with shared access to the entity.
    ///
    /// `f` must not change the entity's observable state through interior
    /// mutability; waiters are not signalled for reads.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _hold = SharedHold::acquire(&self.lock);
        // SAFETY: shared half held until `_hold` drops, after `entity`.
        let entity = unsafe { self.entity_ref() };
        f(&entity)
    }

    /// Blocks until `predicate` holds, then runs `f` with shared access.
    ///
    /// The predicate is evaluated under the exclusive half; once it holds the
    /// lock is downgraded to shared with no gap, so `f` sees the entity exactly
    /// as the predicate accepted it.
    ///
    /// # Errors
    ///
    /// [`SyncError::Interrupted`] if the thread is interrupted before or while
    /// waiting. `f` has not run and no lock is held.
    pub fn read_when<R>(
        &self,
        f: impl FnOnce(&T) -> R,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> SyncResult<R> {
        let hold = ExclusiveHold::acquire_interruptibly(&self.lock)
            .map_err(|e| self.report_interrupt(e))?;
        self.await_predicate(&mut predicate, None)?;

        let _hold = hold.downgrade();
        // SAFETY: shared half held until `_hold` drops, after `entity`.
        let entity = unsafe { self.entity_ref() };
        Ok(f(&entity))
    }

    /// Like [`read_when`](Self::read_when), giving up after `time` `unit`s.
    ///
    /// Returns `Ok(None)` if the lock could not be taken or the predicate did
    /// not hold within the budget; `f` has not run and the entity is untouched.
    ///
    /// # Errors
    ///
    /// [`SyncError::Interrupted`], as for [`read_when`](Self::read_when).
    pub fn read_within<R>(
        &self,
        f: impl FnOnce(&T) -> R,
        mut predicate: impl FnMut(&T) -> bool,
        time: u64,
        unit: TimeUnit,
    ) -> SyncResult<Option<R>> {
        let tracker = TimeTracker::new(time, unit);
        let Some(hold) = self.try_exclusive_within(&tracker)? else {
            return Ok(None);
        };
        if !self.await_predicate(&mut predicate, Some(&tracker))? {
            return Ok(None);
        }

        let _hold = hold.downgrade();
        // SAFETY: shared half held until `_hold` drops, after `entity`.
        let entity = unsafe { self.entity_ref() };
        Ok(Some(f(&entity)))
    }

    /// Runs `f` with exclusive access, then signals waiters.
    ///
    /// `f` may mutate the entity in place or replace it (`*entity = new`).
    /// Waiters are signalled even if `f` panics part-way through a mutation.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _hold = ExclusiveHold::acquire(&self.lock);
        self.write_held(f)
    }

    /// Blocks until `predicate` holds, then runs `f` with exclusive access and
    /// signals waiters. The exclusive half is kept from the predicate check
    /// through `f`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Interrupted`] if the thread is interrupted before or while
    /// waiting. `f` has not run and no lock is held.
    pub fn write_when<R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> SyncResult<R> {
        let _hold = ExclusiveHold::acquire_interruptibly(&self.lock)
            .map_err(|e| self.report_interrupt(e))?;
        self.await_predicate(&mut predicate, None)?;
        Ok(self.write_held(f))
    }

    /// Like [`write_when`](Self::write_when), giving up after `time` `unit`s.
    ///
    /// Returns `Ok(None)` if the lock could not be taken or the predicate did
    /// not hold within the budget; `f` has not run and the entity is untouched.
    ///
    /// # Errors
    ///
    /// [`SyncError::Interrupted`], as for [`write_when`](Self::write_when).
    pub fn write_within<R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
        mut predicate: impl FnMut(&T) -> bool,
        time: u64,
        unit: TimeUnit,
    ) -> SyncResult<Option<R>> {
        let tracker = TimeTracker::new(time, unit);
        let Some(_hold) = self.try_exclusive_within(&tracker)? else {
            return Ok(None);
        };
        if !self.await_predicate(&mut predicate, Some(&tracker))? {
            return Ok(None);
        }
        Ok(Some(self.write_held(f)))
    }

    /// Replaces the entity and signals waiters. The old entity is dropped
    /// after the lock is released.
    pub fn set(&self, entity: T) {
        drop(self.swap(entity));
    }

    /// Replaces the entity, signals waiters, and returns the old entity.
    pub fn swap(&self, entity: T) -> T {
        self.write(|current| std::mem::replace(current, entity))
    }

    /// Runs a write operator. Caller holds the exclusive half.
    fn write_held<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        // Drops before the caller's hold, so the signal goes out under the lock.
        let _signal = SignalOnDrop(&self.lock);
        // SAFETY: the caller holds the exclusive half for longer than `entity`.
        let mut entity = unsafe { self.entity_mut() };
        f(&mut entity)
    }

    fn try_exclusive_within(&self, tracker: &TimeTracker) -> SyncResult<Option<ExclusiveHold<'_, L>>> {
        match self.lock.try_lock_exclusive_for(tracker.remaining()) {
            Ok(true) => Ok(Some(ExclusiveHold { lock: &self.lock })),
            Ok(false) => {
                tracing::debug!(monitor = self.label(), "timed out acquiring exclusive lock");
                Ok(None)
            }
            Err(e) => Err(self.report_interrupt(e)),
        }
    }

    /// Waits on the condition until `predicate` holds. Caller holds the
    /// exclusive half, and still holds it when this returns on any path.
    ///
    /// Returns `Ok(false)` once `tracker` (if any) has no time left.
    fn await_predicate(
        &self,
        predicate: &mut impl FnMut(&T) -> bool,
        tracker: Option<&TimeTracker>,
    ) -> SyncResult<bool> {
        loop {
            let satisfied = {
                // SAFETY: exclusive half held; the borrow ends before waiting.
                let entity = unsafe { self.entity_ref() };
                predicate(&entity)
            };
            if satisfied {
                return Ok(true);
            }

            let timeout = match tracker {
                None => None,
                Some(tracker) if tracker.has_more_time() => Some(tracker.remaining()),
                Some(tracker) => {
                    tracing::debug!(
                        monitor = self.label(),
                        budget_ms = u64::try_from(tracker.budget().as_millis()).unwrap_or(u64::MAX),
                        "predicate wait expired"
                    );
                    return Ok(false);
                }
            };

            tracing::trace!(monitor = self.label(), "parking until entity changes");
            // SAFETY: exclusive half held and no entity borrow is alive.
            let outcome = unsafe { self.lock.await_signal(timeout) }
                .map_err(|e| self.report_interrupt(e))?;
            tracing::trace!(monitor = self.label(), ?outcome, "woke");
        }
    }

    fn report_interrupt(&self, err: SyncError) -> SyncError {
        if err.is_interrupted() {
            tracing::debug!(monitor = self.label(), "wait interrupted");
        }
        err
    }

    /// # Safety
    ///
    /// The calling thread must hold either half of `self.lock` for as long as
    /// the returned guard lives.
    unsafe fn entity_ref(&self) -> EntityRef<'_, T> {
        self.borrows.share();
        EntityRef {
            // SAFETY: no `&mut` to the entity exists: other threads are excluded
            // by the lock, this thread by the borrow flag.
            value: unsafe { &*self.entity.get() },
            flag: &self.borrows,
        }
    }

    /// # Safety
    ///
    /// The calling thread must hold the exclusive half of `self.lock` for as
    /// long as the returned guard lives.
    unsafe fn entity_mut(&self) -> EntityMut<'_, T> {
        self.borrows.exclusive();
        EntityMut {
            // SAFETY: no other reference to the entity exists: other threads are
            // excluded by the lock, this thread by the borrow flag.
            value: unsafe { &mut *self.entity.get() },
            flag: &self.borrows,
        }
    }
}

impl<T, L> std::fmt::Debug for Monitor<T, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Same-thread borrow tracking for the entity.
///
/// `>0` shared borrows, `0` free, `-1` one exclusive borrow. Other threads are
/// already kept out by the lock; this catches a thread re-entering its own
/// monitor from inside a callback.
struct BorrowFlag(AtomicIsize);

const EXCLUSIVE: isize = -1;

impl BorrowFlag {
    fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    fn share(&self) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            assert!(
                current != EXCLUSIVE,
                "monitor entity is already mutably borrowed by this thread"
            );
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn exclusive(&self) {
        assert!(
            self.0
                .compare_exchange(0, EXCLUSIVE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "monitor entity is already borrowed by this thread"
        );
    }
}

struct EntityRef<'a, T> {
    value: &'a T,
    flag: &'a BorrowFlag,
}

impl<T> Deref for EntityRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> Drop for EntityRef<'_, T> {
    fn drop(&mut self) {
        self.flag.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct EntityMut<'a, T> {
    value: &'a mut T,
    flag: &'a BorrowFlag,
}

impl<T> Deref for EntityMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> DerefMut for EntityMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

impl<T> Drop for EntityMut<'_, T> {
    fn drop(&mut self) {
        self.flag.0.store(0, Ordering::Release);
    }
}

/// One shared hold, released on drop.
struct SharedHold<'a, L: MonitorLock> {
    lock: &'a L,
}

impl<'a, L: MonitorLock> SharedHold<'a, L> {
    fn acquire(lock: &'a L) -> Self {
        lock.lock_shared();
        Self { lock }
    }
}

impl<L: MonitorLock> Drop for SharedHold<'_, L> {
    fn drop(&mut self) {
        // SAFETY: taken in `acquire` or `ExclusiveHold::downgrade`; every
        // entity borrow made under it has been dropped first.
        unsafe { self.lock.unlock_shared() };
    }
}

/// One exclusive hold, released on drop.
struct ExclusiveHold<'a, L: MonitorLock> {
    lock: &'a L,
}

impl<'a, L: MonitorLock> ExclusiveHold<'a, L> {
    fn acquire(lock: &'a L) -> Self {
        lock.lock_exclusive();
        Self { lock }
    }

    fn acquire_interruptibly(lock: &'a L) -> SyncResult<Self> {
        lock.lock_exclusive_interruptibly()?;
        Ok(Self { lock })
    }

    /// Takes a shared hold, then gives up the exclusive one.
    fn downgrade(self) -> SharedHold<'a, L> {
        let lock = self.lock;
        lock.lock_shared();
        drop(self);
        SharedHold { lock }
    }
}

impl<L: MonitorLock> Drop for ExclusiveHold<'_, L> {
    fn drop(&mut self) {
        // SAFETY: taken when this hold was built; every entity borrow made
        // under it has been dropped first.
        unsafe { self.lock.unlock_exclusive() };
    }
}

/// Signals the condition on drop, unwinding included.
struct SignalOnDrop<'a, L: MonitorLock>(&'a L);

impl<L: MonitorLock> Drop for SignalOnDrop<'_, L> {
    fn drop(&mut self) {
        self.0.signal_all();
    }
}
