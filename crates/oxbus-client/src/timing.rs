//! Monotonic time source and precision sleeps.
//!
//! Timestamps come from a process-global `quanta` clock; the intentional
//! delays (inter-frame spacing, the timeout-wheel tick) use absolute
//! `clock_nanosleep` on `CLOCK_MONOTONIC`, restarted on `EINTR`.

use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer};
use tracing::warn;

static GLOBAL_CLOCK: Lazy<quanta::Clock> = Lazy::new(quanta::Clock::new);

/// Nanoseconds on the process-global monotonic clock.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nanos(pub u64);

impl Nanos {
    pub const ZERO: Nanos = Nanos(0);

    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Nanos(us * 1_000)
    }

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Nanos(ms * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Nanos(s * 1_000_000_000)
    }

    #[inline]
    pub fn as_micros_u64(self) -> u64 {
        self.0 / 1_000
    }

    #[inline]
    pub fn as_millis_u64(self) -> u64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub fn now() -> Self {
        let clock = &*GLOBAL_CLOCK;
        Nanos(clock.delta_as_nanos(0, clock.raw()))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Nanos) -> Self {
        Nanos(self.0.saturating_sub(rhs.0))
    }
}

impl FromStr for Nanos {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let d: std::time::Duration = s.trim().parse::<humantime::Duration>()?.into();
        Ok(Nanos(d.as_nanos() as u64))
    }
}

impl<'de> Deserialize<'de> for Nanos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct NanosVisitor;

        impl Visitor<'_> for NanosVisitor {
            type Value = Nanos;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an integer or a string with optional suffix (s, ms, us, ...)")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Nanos(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom(format!("duration cannot be negative, got {value}")));
                }
                Ok(Nanos(value as u64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Nanos::from_str(value)
                    .map_err(|e| E::custom(format!("couldn't parse '{value}' as duration: {e}")))
            }
        }

        deserializer.deserialize_any(NanosVisitor)
    }
}

/// Current reading of the kernel monotonic clock, in nanoseconds.
pub(crate) fn monotonic_ns() -> Option<u64> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        warn!("clock_gettime failed: {}", std::io::Error::last_os_error());
        return None;
    }
    Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// Sleeps until an absolute point on the kernel monotonic clock,
/// restarting on EINTR. Returns whether the deadline was reached.
pub(crate) fn sleep_until_monotonic_ns(deadline_ns: u64) -> bool {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (deadline_ns % 1_000_000_000) as libc::c_long,
    };
    loop {
        let rc = unsafe {
            libc::clock_nanosleep(libc::CLOCK_MONOTONIC, libc::TIMER_ABSTIME, &ts, std::ptr::null_mut())
        };
        if rc == 0 {
            return true;
        }
        if rc != libc::EINTR {
            warn!("clock_nanosleep failed with {rc}");
            return false;
        }
    }
}

/// Sleeps for a relative interval with nanosecond precision.
pub(crate) fn sleep_micros(micros: u64) {
    if micros == 0 {
        return;
    }
    if let Some(now) = monotonic_ns() {
        sleep_until_monotonic_ns(now + micros * 1_000);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotone() {
        let a = Nanos::now();
        let b = Nanos::now();
        assert!(b >= a);
    }

    #[test]
    fn parses_human_durations() {
        let n: Nanos = serde_json::from_str(r#""250ms""#).unwrap();
        assert_eq!(n, Nanos::from_millis(250));
        let n: Nanos = serde_json::from_str(r#""10us""#).unwrap();
        assert_eq!(n, Nanos::from_micros(10));
        let n: Nanos = serde_json::from_str("1000").unwrap();
        assert_eq!(n, Nanos(1000));
    }

    #[test]
    fn sleep_reaches_deadline() {
        let start = Nanos::now();
        sleep_micros(2_000);
        assert!(Nanos::now().saturating_sub(start) >= Nanos::from_micros(1_000));
    }
}
