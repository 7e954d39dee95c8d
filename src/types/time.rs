//! Tick time: the second/nanosecond pair used by the task manager's timeout
//! bookkeeping.

use core::fmt;

const NANOS_PER_SEC: i32 = 1_000_000_000;

/// A point (or span) on the manager's tick clock.
///
/// Ordered by seconds, then nanoseconds. The manager treats whatever clock
/// the host feeds into [`tick`](crate::task::TaskManager::tick) as opaque
/// monotonic time; unix timestamps work well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TickTime {
    /// Whole seconds.
    pub sec: i64,
    /// Nanoseconds, `0..1_000_000_000`.
    pub nsec: i32,
}

impl TickTime {
    /// The zero instant; also the "no timeout" sentinel.
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    /// Creates a tick time, normalizing nanosecond overflow into seconds.
    #[must_use]
    pub fn new(sec: i64, nsec: i32) -> Self {
        let mut out = Self { sec, nsec };
        while out.nsec >= NANOS_PER_SEC {
            out.nsec -= NANOS_PER_SEC;
            out.sec += 1;
        }
        while out.nsec < 0 {
            out.nsec += NANOS_PER_SEC;
            out.sec -= 1;
        }
        out
    }

    /// Returns true for the zero instant.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// Returns this instant advanced by the given span.
    #[must_use]
    pub fn advanced_by(self, sec: i64, nsec: i32) -> Self {
        Self::new(self.sec + sec, self.nsec + nsec)
    }
}

impl fmt::Display for TickTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_sec_then_nsec() {
        assert!(TickTime::new(1, 999_999_999) < TickTime::new(2, 0));
        assert!(TickTime::new(2, 1) > TickTime::new(2, 0));
        assert_eq!(TickTime::new(3, 0), TickTime::new(3, 0));
    }

    #[test]
    fn new_normalizes_nanos() {
        let t = TickTime::new(1, NANOS_PER_SEC + 7);
        assert_eq!(t, TickTime::new(2, 7));
        let u = TickTime::new(2, -1);
        assert_eq!(u, TickTime::new(1, 999_999_999));
    }

    #[test]
    fn advanced_by_carries() {
        let t = TickTime::new(3, 900_000_000).advanced_by(0, 200_000_000);
        assert_eq!(t, TickTime::new(4, 100_000_000));
    }
}
