//! # Wait Budget Tracking
//!
//! A condition wait can return before its timeout without anything having
//! changed (spurious wakeups), so a bounded call cannot trust a single wait's
//! result. [`TimeTracker`] remembers when the call started and answers how much
//! of the budget is left, however many times the caller has been woken.
//!
//! ```text
//!   origin                                   origin + budget
//!     |-----wait-----|--wait--|------wait------|
//!                    ^        ^                ^
//!               spurious   signal          has_more_time() == false
//! ```
//!
//! The clock is chosen from the requested unit: sub-millisecond units read a
//! monotonic nanosecond counter, everything coarser reads the wall clock and
//! reports whole milliseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Unit of a requested wait budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// 10^-9 s.
    Nanoseconds,
    /// 10^-6 s.
    Microseconds,
    /// 10^-3 s.
    Milliseconds,
    /// Seconds.
    Seconds,
    /// 60 seconds.
    Minutes,
    /// 3600 seconds.
    Hours,
    /// 86400 seconds.
    Days,
}

impl TimeUnit {
    const fn nanos(self) -> u128 {
        match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => NANOS_PER_MICRO,
            Self::Milliseconds => NANOS_PER_MILLI,
            Self::Seconds => NANOS_PER_SECOND,
            Self::Minutes => 60 * NANOS_PER_SECOND,
            Self::Hours => 3_600 * NANOS_PER_SECOND,
            Self::Days => 86_400 * NANOS_PER_SECOND,
        }
    }

    /// Clock precision used to track a budget expressed in this unit.
    #[must_use]
    pub const fn precision(self) -> Precision {
        match self {
            Self::Nanoseconds | Self::Microseconds => Precision::Nanos,
            _ => Precision::Millis,
        }
    }

    /// Converts `amount` of this unit to a [`Duration`], saturating at
    /// [`Duration::MAX`].
    #[must_use]
    pub fn to_duration(self, amount: u64) -> Duration {
        duration_from_nanos(u128::from(amount) * self.nanos())
    }
}

/// Granularity of the clock behind a [`TimeTracker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Precision {
    /// Monotonic counter, nanosecond ticks.
    Nanos,
    /// Wall clock, millisecond ticks.
    Millis,
}

impl Precision {
    const fn tick_nanos(self) -> u128 {
        match self {
            Self::Nanos => 1,
            Self::Millis => NANOS_PER_MILLI,
        }
    }
}

/// Source of timestamps for a [`TimeTracker`].
///
/// `now` returns the time since the clock's own epoch; only differences between
/// readings of the same precision are meaningful.
pub trait Clock {
    /// Reads the clock that serves `precision`.
    fn now(&self, precision: Precision) -> Duration;
}

/// The process clocks: a monotonic counter for [`Precision::Nanos`] and the
/// wall clock for [`Precision::Millis`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self, precision: Precision) -> Duration {
        match precision {
            Precision::Nanos => {
                static ANCHOR: OnceLock<Instant> = OnceLock::new();
                ANCHOR.get_or_init(Instant::now).elapsed()
            }
            // A wall clock set before 1970 reads as the epoch itself.
            Precision::Millis => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// Hand-driven clock for tests. Clones share the same reading.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    /// Sets the reading. Setting it backwards models a wall clock adjustment.
    pub fn set(&self, at: Duration) {
        let at = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.store(at, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self, _precision: Precision) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Remaining wait budget for one bounded call.
#[derive(Debug)]
pub struct TimeTracker<C: Clock = SystemClock> {
    clock: C,
    precision: Precision,
    origin: Duration,
    budget: Duration,
}

impl TimeTracker {
    /// Starts tracking a budget of `time` `unit`s on the system clocks.
    #[must_use]
    pub fn new(time: u64, unit: TimeUnit) -> Self {
        Self::with_clock(time, unit, SystemClock)
    }
}

impl<C: Clock> TimeTracker<C> {
    /// Starts tracking a budget of `time` `unit`s on `clock`.
    #[must_use]
    pub fn with_clock(time: u64, unit: TimeUnit, clock: C) -> Self {
        let precision = unit.precision();
        let origin = clock.now(precision);
        Self {
            clock,
            precision,
            origin,
            budget: unit.to_duration(time),
        }
    }

    /// Precision of the clock this tracker reads.
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// The full budget this tracker was started with.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    fn remaining_nanos(&self) -> i128 {
        let now = self.clock.now(self.precision);
        as_i128(self.origin) + as_i128(self.budget) - as_i128(now)
    }

    /// Budget left, in ticks of [`precision`](Self::precision). Negative once
    /// the budget is overdrawn.
    ///
    /// A partial tick counts as a whole one, so the result only reaches zero
    /// once the full budget has really elapsed.
    #[must_use]
    pub fn time_left(&self) -> i64 {
        let remaining = self.remaining_nanos();
        let tick = as_i128_nanos(self.precision.tick_nanos());
        let ticks = if remaining > 0 {
            (remaining + tick - 1) / tick
        } else {
            remaining / tick
        };
        i64::try_from(ticks).unwrap_or(if ticks > 0 { i64::MAX } else { i64::MIN })
    }

    /// True while some of the budget is left.
    #[must_use]
    pub fn has_more_time(&self) -> bool {
        self.time_left() > 0
    }

    /// Budget left as a [`Duration`], zero once exhausted.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        u128::try_from(self.remaining_nanos()).map_or(Duration::ZERO, duration_from_nanos)
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = nanos / NANOS_PER_SECOND;
    match u64::try_from(secs) {
        // Both casts are in range: secs fits u64 and the remainder is < 10^9.
        #[allow(clippy::cast_possible_truncation)]
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SECOND) as u32),
        Err(_) => Duration::MAX,
    }
}

fn as_i128(duration: Duration) -> i128 {
    as_i128_nanos(duration.as_nanos())
}

fn as_i128_nanos(nanos: u128) -> i128 {
    i128::try_from(nanos).unwrap_or(i128::MAX)
}
