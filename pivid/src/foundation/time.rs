use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// Presentation timestamp of a decoded frame, measured from the stream origin.
pub type MediaTime = Duration;

/// Nanosecond-resolution instant on the process-wide steady clock.
///
/// Stored as the offset from the clock's origin (process start for the
/// production clock, zero for a test clock), so instants are plain ordered
/// values that any [`crate::foundation::clock::Clock`] can produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SteadyTime(Duration);

impl SteadyTime {
    pub const ZERO: SteadyTime = SteadyTime(Duration::ZERO);

    pub fn from_origin(offset: Duration) -> Self {
        Self(offset)
    }

    pub fn since_origin(self) -> Duration {
        self.0
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    pub fn duration_since(self, earlier: SteadyTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    pub fn checked_sub(self, rhs: Duration) -> Option<SteadyTime> {
        self.0.checked_sub(rhs).map(SteadyTime)
    }

    /// Seconds since the clock origin, for logs only.
    pub fn secs(self) -> f64 {
        self.0.as_secs_f64()
    }
}

impl Add<Duration> for SteadyTime {
    type Output = SteadyTime;

    fn add(self, rhs: Duration) -> SteadyTime {
        SteadyTime(self.0 + rhs)
    }
}

impl AddAssign<Duration> for SteadyTime {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl Sub<Duration> for SteadyTime {
    type Output = SteadyTime;

    fn sub(self, rhs: Duration) -> SteadyTime {
        SteadyTime(self.0.saturating_sub(rhs))
    }
}

impl Sub<SteadyTime> for SteadyTime {
    type Output = Duration;

    fn sub(self, rhs: SteadyTime) -> Duration {
        self.duration_since(rhs)
    }
}

impl fmt::Display for SteadyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.secs())
    }
}

/// Wall-clock time as seconds since the Unix epoch.
///
/// Only used to anchor a script's `zero_time`; everything that needs to be
/// ordered or precise runs on [`SteadyTime`].
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct WallTime(pub f64);

impl WallTime {
    pub fn seconds(self) -> f64 {
        self.0
    }
}

impl Add<f64> for WallTime {
    type Output = WallTime;

    fn add(self, rhs: f64) -> WallTime {
        WallTime(self.0 + rhs)
    }
}

impl Sub<WallTime> for WallTime {
    type Output = f64;

    fn sub(self, rhs: WallTime) -> f64 {
        self.0 - rhs.0
    }
}

/// Convert script seconds to a media timestamp, clamping negatives to zero.
pub fn media_time_from_secs(secs: f64) -> MediaTime {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_time_orders_and_subtracts() {
        let a = SteadyTime::from_origin(Duration::from_millis(10));
        let b = a + Duration::from_millis(15);
        assert!(b > a);
        assert_eq!(b - a, Duration::from_millis(15));
        assert_eq!(a - b, Duration::ZERO);
    }

    #[test]
    fn media_time_clamps_negative_and_nan() {
        assert_eq!(media_time_from_secs(-1.0), Duration::ZERO);
        assert_eq!(media_time_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(media_time_from_secs(0.5), Duration::from_millis(500));
    }

    #[test]
    fn wall_time_difference_is_seconds() {
        let a = WallTime(100.0);
        let b = a + 2.5;
        assert_eq!(b - a, 2.5);
    }
}
