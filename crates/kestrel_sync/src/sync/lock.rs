//! # Reentrant Read/Write Lock with a Bound Condition
//!
//! A [`Monitor`](crate::Monitor) needs more from its lock than
//! `parking_lot::RwLock` offers:
//!
//! - **Reentrancy**: the owning thread may re-acquire either half.
//! - **Downgrading**: the exclusive owner may take a shared hold and then
//!   release the exclusive one, with no instant at which it holds nothing.
//! - **A condition bound to the exclusive half**: waiting releases every
//!   exclusive hold the thread has and restores them all on wake.
//! - **Interruptible and timed acquisition.**

#![allow(unsafe_code)]
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────┐
//!                 │             LockCore             │
//!                 │                                  │
//!                 │  Mutex<LockState>                │
//!                 │    writer / write_holds          │
//!                 │    readers: ThreadId -> holds    │
//!                 │    queued_writers                │
//!                 │                                  │
//!                 │  handoff   (Condvar) lock freed  │
//!                 │  condition (Condvar) entity moved│
//!                 └──────────────────────────────────┘
//! ```
//!
//! The state mutex is only ever held for a few instructions. Threads that
//! cannot take the lock park on `handoff`; threads waiting for the entity to
//! change park on `condition`. Both condvars pair with the state mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::LockPolicy;
use crate::error::SyncResult;
use crate::sync::interrupt::{Parked, Unpark};

/// How a condition wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a signal (or spuriously). The caller must re-check its predicate.
    Signalled,
    /// The timeout elapsed without a wakeup.
    TimedOut,
}

/// A read/write lock pair plus the condition bound to its exclusive half.
///
/// This is the extension point of [`Monitor`](crate::Monitor): a monitor can be
/// built over any implementation with [`Monitor::with_lock`](crate::Monitor::with_lock).
///
/// # Safety
///
/// The monitor hands out `&mut` to its entity under the exclusive half and
/// `&` under the shared half, so implementors must guarantee:
///
/// - `lock_exclusive*` does not return success while another thread holds
///   either half;
/// - `lock_shared` does not return while another thread holds the exclusive
///   half;
/// - both halves are reentrant for the holding thread, and the exclusive owner
///   can take the shared half (downgrading);
/// - `await_signal` returns, on every path, with the caller holding the
///   exclusive half exactly as often as it did on entry.
pub unsafe trait MonitorLock: Send + Sync {
    /// Takes a shared hold, blocking uninterruptibly.
    fn lock_shared(&self);

    /// Releases one shared hold of the calling thread.
    ///
    /// # Safety
    ///
    /// The caller must hold the shared half and must not be relying on that
    /// hold to keep a borrow of the guarded data alive.
    unsafe fn unlock_shared(&self);

    /// Takes an exclusive hold, blocking uninterruptibly.
    fn lock_exclusive(&self);

    /// Takes an exclusive hold, failing if the calling thread is interrupted
    /// before or while blocking.
    ///
    /// # Errors
    ///
    /// [`SyncError::Interrupted`](crate::SyncError::Interrupted), with nothing held.
    fn lock_exclusive_interruptibly(&self) -> SyncResult<()>;

    /// Takes an exclusive hold if one becomes available within `timeout`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Interrupted`](crate::SyncError::Interrupted), with nothing held.
    fn try_lock_exclusive_for(&self, timeout: Duration) -> SyncResult<bool>;

    /// Releases one exclusive hold of the calling thread.
    ///
    /// # Safety
    ///
    /// Same contract as [`unlock_shared`](Self::unlock_shared), for the
    /// exclusive half.
    unsafe fn unlock_exclusive(&self);

    /// Releases every exclusive hold of the calling thread, parks until
    /// signalled, interrupted, or `timeout` elapses, then re-acquires the same
    /// number of holds.
    ///
    /// # Errors
    ///
    /// [`SyncError::Interrupted`](crate::SyncError::Interrupted). The exclusive
    /// holds have been re-acquired even then.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive half and no borrow of the guarded
    /// data may be alive across the call.
    unsafe fn await_signal(&self, timeout: Option<Duration>) -> SyncResult<WaitOutcome>;

    /// Wakes every thread in [`await_signal`](Self::await_signal).
    fn signal_all(&self);

    /// True if the calling thread holds the exclusive half.
    fn holds_exclusive(&self) -> bool;

    /// True if the calling thread holds the shared half.
    fn holds_shared(&self) -> bool;
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    readers: HashMap<ThreadId, usize>,
    queued_writers: usize,
}

impl LockState {
    fn admits_writer(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    fn admits_reader(&self, policy: LockPolicy) -> bool {
        self.writer.is_none()
            && (policy == LockPolicy::ReaderPreferring || self.queued_writers == 0)
    }
}

struct LockCore {
    state: Mutex<LockState>,
    handoff: Condvar,
    condition: Condvar,
    policy: LockPolicy,
}

impl Unpark for LockCore {
    fn unpark(&self) {
        // Taking the state mutex orders this wakeup after the parked thread's
        // last status check.
        let _state = self.state.lock();
        self.handoff.notify_all();
        self.condition.notify_all();
    }
}

/// Default [`MonitorLock`]: reentrant, downgradable, interruptible.
///
/// # Panics
///
/// Requesting the exclusive half while holding only the shared half (an
/// upgrade) panics, as does releasing a half the calling thread does not hold.
#[derive(Clone)]
pub struct ReentrantRwLock {
    core: Arc<LockCore>,
}

impl ReentrantRwLock {
    /// Creates a writer-preferring lock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(LockPolicy::default())
    }

    /// Creates a lock with the given admission policy.
    #[must_use]
    pub fn with_policy(policy: LockPolicy) -> Self {
        Self {
            core: Arc::new(LockCore {
                state: Mutex::new(LockState::default()),
                handoff: Condvar::new(),
                condition: Condvar::new(),
                policy,
            }),
        }
    }

    /// Admission policy of this lock.
    #[must_use]
    pub fn policy(&self) -> LockPolicy {
        self.core.policy
    }

    /// Returns whether any thread holds the exclusive half.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.core.state.lock().writer.is_some()
    }

    /// Number of threads holding the shared half.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.core.state.lock().readers.len()
    }

    /// Number of threads queued for the exclusive half.
    #[must_use]
    pub fn queued_writers(&self) -> usize {
        self.core.state.lock().queued_writers
    }

    fn parked(&self) -> Parked {
        Parked::on(Arc::clone(&self.core) as Arc<dyn Unpark>)
    }

    /// Shared acquisition path for every `lock_exclusive*` flavour.
    ///
    /// Returns `Ok(false)` only when `deadline` passes first.
    fn acquire_exclusive(&self, deadline: Option<Instant>, interruptible: bool) -> SyncResult<bool> {
        let me = thread::current().id();
        let parked = interruptible.then(|| self.parked());
        if let Some(parked) = &parked {
            parked.check()?;
        }

        let mut state = self.core.state.lock();
        if state.writer == Some(me) {
            state.write_holds += 1;
            return Ok(true);
        }
        assert!(
            !state.readers.contains_key(&me),
            "cannot upgrade a shared hold to an exclusive one"
        );

        if !state.admits_writer() {
            state.queued_writers += 1;
            let admitted = self.wait_for_writer_slot(&mut state, deadline, parked.as_ref());
            state.queued_writers -= 1;
            if state.queued_writers == 0 && state.writer.is_none() {
                // Readers held back by this writer may proceed.
                self.core.handoff.notify_all();
            }
            if !admitted? {
                return Ok(false);
            }
        }

        state.writer = Some(me);
        state.write_holds = 1;
        Ok(true)
    }

    fn wait_for_writer_slot(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        deadline: Option<Instant>,
        parked: Option<&Parked>,
    ) -> SyncResult<bool> {
        loop {
            if let Some(parked) = parked {
                parked.check()?;
            }
            if state.admits_writer() {
                return Ok(true);
            }
            match deadline {
                None => self.core.handoff.wait(state),
                Some(deadline) => {
                    if self.core.handoff.wait_until(state, deadline).timed_out() {
                        return Ok(state.admits_writer());
                    }
                }
            }
        }
    }

    /// Blocks until the calling thread can own the exclusive half again.
    fn reacquire_exclusive(&self, state: &mut MutexGuard<'_, LockState>, holds: usize) {
        if !state.admits_writer() {
            state.queued_writers += 1;
            while !state.admits_writer() {
                self.core.handoff.wait(state);
            }
            state.queued_writers -= 1;
        }
        state.writer = Some(thread::current().id());
        state.write_holds = holds;
    }
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("ReentrantRwLock")
            .field("policy", &self.core.policy)
            .field("write_locked", &state.writer.is_some())
            .field("write_holds", &state.write_holds)
            .field("readers", &state.readers.len())
            .field("queued_writers", &state.queued_writers)
            .finish()
    }
}

// SAFETY: exclusion is enforced by `LockState` under the state mutex. A writer
// is admitted only when no thread holds either half, a new reader only when no
// writer holds the lock, and `await_signal` restores the caller's holds before
// returning on every path.
unsafe impl MonitorLock for ReentrantRwLock {
    fn lock_shared(&self) {
        let me = thread::current().id();
        let mut state = self.core.state.lock();
        if state.writer == Some(me) || state.readers.contains_key(&me) {
            *state.readers.entry(me).or_insert(0) += 1;
            return;
        }
        while !state.admits_reader(self.core.policy) {
            self.core.handoff.wait(&mut state);
        }
        state.readers.insert(me, 1);
    }

    unsafe fn unlock_shared(&self) {
        let me = thread::current().id();
        let mut state = self.core.state.lock();
        let Some(holds) = state.readers.get_mut(&me) else {
            panic!("unlock_shared called by a thread holding no shared lock");
        };
        *holds -= 1;
        if *holds == 0 {
            state.readers.remove(&me);
            if state.readers.is_empty() {
                self.core.handoff.notify_all();
            }
        }
    }

    fn lock_exclusive(&self) {
        // Without an interrupt check or deadline this always admits.
        let _ = self.acquire_exclusive(None, false);
    }

    fn lock_exclusive_interruptibly(&self) -> SyncResult<()> {
        self.acquire_exclusive(None, true).map(|_| ())
    }

    fn try_lock_exclusive_for(&self, timeout: Duration) -> SyncResult<bool> {
        // A deadline past the end of time is no deadline.
        let deadline = Instant::now().checked_add(timeout);
        self.acquire_exclusive(deadline, true)
    }

    unsafe fn unlock_exclusive(&self) {
        let me = thread::current().id();
        let mut state = self.core.state.lock();
        assert!(
            state.writer == Some(me),
            "unlock_exclusive called by a thread not holding the exclusive lock"
        );
        state.write_holds -= 1;
        if state.write_holds == 0 {
            state.writer = None;
            self.core.handoff.notify_all();
        }
    }

    unsafe fn await_signal(&self, timeout: Option<Duration>) -> SyncResult<WaitOutcome> {
        let me = thread::current().id();
        let parked = self.parked();
        let mut state = self.core.state.lock();
        assert!(
            state.writer == Some(me),
            "await_signal called by a thread not holding the exclusive lock"
        );
        parked.check()?;

        let holds = state.write_holds;
        state.writer = None;
        state.write_holds = 0;
        self.core.handoff.notify_all();

        let outcome = match timeout.and_then(|t| Instant::now().checked_add(t)) {
            None => {
                self.core.condition.wait(&mut state);
                WaitOutcome::Signalled
            }
            Some(deadline) => {
                if self.core.condition.wait_until(&mut state, deadline).timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Signalled
                }
            }
        };

        self.reacquire_exclusive(&mut state, holds);
        drop(state);
        parked.check()?;
        Ok(outcome)
    }

    fn signal_all(&self) {
        self.core.condition.notify_all();
    }

    fn holds_exclusive(&self) -> bool {
        self.core.state.lock().writer == Some(thread::current().id())
    }

    fn holds_shared(&self) -> bool {
        self.core
            .state
            .lock()
            .readers
            .contains_key(&thread::current().id())
    }
}
