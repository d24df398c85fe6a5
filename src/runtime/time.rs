//! Conversions from std time types into the kernel timespec representation.

use std::time::{Duration, Instant};

/// Seconds plus nanosecond remainder, as io_uring timeouts expect them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelTimespec {
    pub sec: u64,
    pub nsec: u32,
}

impl From<KernelTimespec> for io_uring::types::Timespec {
    fn from(ts: KernelTimespec) -> Self {
        io_uring::types::Timespec::new().sec(ts.sec).nsec(ts.nsec)
    }
}

/// Split a relative interval into whole seconds and the nanosecond remainder.
pub fn to_timespec(interval: Duration) -> KernelTimespec {
    KernelTimespec {
        sec: interval.as_secs(),
        nsec: interval.subsec_nanos(),
    }
}

/// Express an absolute `CLOCK_MONOTONIC` reading as a timespec.
pub fn monotonic_to_timespec(since_boot: Duration) -> KernelTimespec {
    to_timespec(since_boot)
}

/// Map a deadline onto `CLOCK_MONOTONIC`, the clock absolute io_uring
/// timeouts are measured against.
///
/// Deadlines in the past map to the current monotonic time.
pub fn deadline_to_timespec(deadline: Instant) -> KernelTimespec {
    let remaining = deadline.saturating_duration_since(Instant::now());
    monotonic_to_timespec(monotonic_now() + remaining)
}

/// Current `CLOCK_MONOTONIC` reading.
pub fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_seconds() {
        let ts = to_timespec(Duration::from_secs(3));
        assert_eq!(ts, KernelTimespec { sec: 3, nsec: 0 });
    }

    #[test]
    fn test_sub_second_remainder() {
        let ts = to_timespec(Duration::from_millis(2_500));
        assert_eq!(ts.sec, 2);
        assert_eq!(ts.nsec, 500_000_000);

        let ts = to_timespec(Duration::from_micros(1_000_001));
        assert_eq!(ts.sec, 1);
        assert_eq!(ts.nsec, 1_000);
    }

    #[test]
    fn test_zero() {
        assert_eq!(to_timespec(Duration::ZERO), KernelTimespec::default());
    }

    #[test]
    fn test_deadline_is_not_before_now() {
        let before = monotonic_now();
        let ts = deadline_to_timespec(Instant::now() + Duration::from_millis(50));
        let at = Duration::new(ts.sec, ts.nsec);
        assert!(at >= before + Duration::from_millis(50));

        // A deadline in the past saturates to "now".
        let past = Instant::now() - Duration::from_millis(10);
        let ts = deadline_to_timespec(past);
        assert!(Duration::new(ts.sec, ts.nsec) >= before);
    }
}
