//! # Thread Interruption
//!
//! Every blocking monitor call can be cancelled from another thread. Each
//! thread owns an interrupt status; [`current`] hands out a handle to it that
//! other threads use to raise it:
//!
//! ```rust,ignore
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! let worker = thread::spawn(move || {
//!     tx.send(interrupt::current()).unwrap();
//!     loop {
//!         if queue.write_when(|q| q.pop(), |q| !q.is_empty()).is_err() {
//!             break; // interrupted
//!         }
//!     }
//! });
//! rx.recv().unwrap().interrupt();
//! worker.join().unwrap();
//! ```
//!
//! Raising the status wakes the thread if it is parked inside a
//! [`ReentrantRwLock`](crate::ReentrantRwLock). Interruptible calls check the
//! status on entry and whenever they wake, and clear it when they report
//! [`SyncError::Interrupted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};

/// Something a parked thread can be woken from.
pub(crate) trait Unpark: Send + Sync {
    /// Wakes every thread parked on this target so it re-checks its status.
    fn unpark(&self);
}

#[derive(Default)]
struct InterruptState {
    interrupted: AtomicBool,
    parked_on: Mutex<Option<Arc<dyn Unpark>>>,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState::default());
}

fn current_state() -> Arc<InterruptState> {
    CURRENT.with(Arc::clone)
}

/// Handle to one thread's interrupt status. Cheap to clone and send.
#[derive(Clone)]
pub struct InterruptHandle {
    state: Arc<InterruptState>,
}

impl InterruptHandle {
    /// Raises the interrupt status and wakes the thread if it is parked.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
        // Clone out of the slot first: unparking takes the lock's own mutex,
        // which the parked thread may hold while it deregisters.
        let target = self.state.parked_on.lock().clone();
        if let Some(target) = target {
            tracing::debug!("interrupting parked thread");
            target.unpark();
        }
    }

    /// Returns the status without clearing it.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }

    /// Returns true if both handles refer to the same thread.
    #[must_use]
    pub fn same_thread(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Returns the calling thread's interrupt handle.
#[must_use]
pub fn current() -> InterruptHandle {
    InterruptHandle {
        state: current_state(),
    }
}

/// Tests and clears the calling thread's interrupt status.
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.swap(false, Ordering::SeqCst))
}

/// Registration of the calling thread as parked on a target.
///
/// Must be created before the parker last checks its status, so that an
/// interrupt raised in between finds the target and wakes it.
pub(crate) struct Parked {
    state: Arc<InterruptState>,
}

impl Parked {
    pub(crate) fn on(target: Arc<dyn Unpark>) -> Self {
        let state = current_state();
        *state.parked_on.lock() = Some(target);
        Self { state }
    }

    /// Consumes a pending interrupt as an error.
    pub(crate) fn check(&self) -> SyncResult<()> {
        if self.state.interrupted.swap(false, Ordering::SeqCst) {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }
}

impl Drop for Parked {
    fn drop(&mut self) {
        *self.state.parked_on.lock() = None;
    }
}
