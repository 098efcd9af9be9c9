use std::fmt;

use crate::Instant;

/// Source of monotonic time for a connection
///
/// Every deadline the connection computes is relative to the values returned here, so an
/// implementation must never go backwards. Wall-clock time is never consulted.
pub trait Clock: Send + fmt::Debug {
    /// The current time
    fn now(&self) -> Instant;

    /// A cheaper, possibly slightly stale, notion of the current time
    ///
    /// Used where a packet has just been received or sent and the exact time of that event
    /// matters more than precision.
    fn approximate_now(&self) -> Instant {
        self.now()
    }
}

/// A [`Clock`] backed by [`Instant::now`]
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
