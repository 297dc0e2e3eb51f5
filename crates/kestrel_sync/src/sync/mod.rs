//! # Synchronization Primitives
//!
//! ## The Problem
//!
//! ```text
//! Thread 1 (producer):  push jobs into a shared queue
//! Thread 2 (consumer):  wait until the queue is non-empty, then pop
//!
//! Mutex alone:       consumer spins on lock → burns CPU
//! Mutex + Condvar:   every call site re-implements the wait loop,
//!                    the timeout bookkeeping and the signalling
//! ```
//!
//! ## The Solution: Monitors
//!
//! ```text
//! monitor.write_when(|q| q.pop(), |q| !q.is_empty())
//!   1. take the exclusive lock
//!   2. park on the condition until the predicate holds
//!   3. run the operator
//!   4. signal every waiter, release
//! ```
//!
//! Reads without a predicate share the lock. Writers always signal. For
//! long edits, a [`Sandbox`] copies the entity out, lets the thread work on
//! it with no lock held, and publishes it back with compare-and-set.

pub mod interrupt;
mod lock;
mod monitor;
mod sandbox;

pub use interrupt::InterruptHandle;
pub use lock::{MonitorLock, ReentrantRwLock, WaitOutcome};
pub use monitor::Monitor;
pub use sandbox::{Duplicator, Sandbox};
