//! # KESTREL Sync
//!
//! Monitor-style coordination of shared entities between threads:
//!
//! - [`Monitor`]: shared reads, signalling writes, and reads/writes that block
//!   until a predicate holds, optionally within a time budget.
//! - [`Sandbox`]: a private working copy of a monitored entity, published
//!   back unconditionally or with compare-and-set.
//! - [`TimeTracker`]: remaining-time bookkeeping for bounded waits.
//!
//! ## Rules
//!
//! 1. **Writers always signal** - every write wakes every waiter, even if the
//!    operator panics half-way
//! 2. **Expiry is not an error** - a bounded call that runs out of time
//!    returns `Ok(None)` with the entity untouched
//! 3. **Interruption is never swallowed** - a blocked call that is interrupted
//!    releases its locks and returns [`SyncError::Interrupted`]
//!
//! ## Example
//!
//! ```rust
//! use kestrel_sync::{Monitor, TimeUnit};
//!
//! let counter = Monitor::new(0_u32);
//! counter.write(|n| *n += 1);
//!
//! let seen = counter.read_within(|n| *n, |n| *n > 0, 10, TimeUnit::Milliseconds)?;
//! assert_eq!(seen, Some(1));
//! # Ok::<(), kestrel_sync::SyncError>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod sync;
pub mod time;

pub use config::{LockPolicy, MonitorConfig};
pub use error::{BoxError, SyncError, SyncResult};
pub use sync::interrupt;
pub use sync::{
    Duplicator, InterruptHandle, Monitor, MonitorLock, ReentrantRwLock, Sandbox, WaitOutcome,
};
pub use time::{Clock, ManualClock, Precision, SystemClock, TimeTracker, TimeUnit};
