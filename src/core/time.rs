//! Time representation for the playback core.
//!
//! Container timestamps are integers in a per-stream time base; clocks and
//! frame presentation times are `f64` seconds where `NaN` means unknown.

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

/// Presentation time in seconds. `NaN` means "unknown".
pub type Seconds = f64;

/// Time constants for conversions
pub mod constants {
    /// Container-level time base: microseconds.
    pub const TIME_BASE: i64 = 1_000_000;
    pub const MICROS_PER_SECOND: f64 = 1_000_000.0;
    pub const MILLIS_PER_SECOND: f64 = 1_000.0;
}

/// A rational number, used for stream time bases and aspect ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// The microsecond time base used for container-level positions.
    pub const MICROS: Rational = Rational::new(1, constants::TIME_BASE as i32);

    /// Unset / undefined value (0/1).
    pub const UNDEFINED: Rational = Rational::new(0, 1);

    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            return f64::NAN;
        }
        self.num as f64 / self.den as f64
    }

    /// Both terms are strictly positive.
    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn invert(self) -> Rational {
        Rational::new(self.den, self.num)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational::UNDEFINED
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescale `ts` from time base `from` to time base `to`, rounding to nearest
/// with halves away from zero.
pub fn rescale(ts: i64, from: Rational, to: Rational) -> i64 {
    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let rounded = if num >= 0 { (num + half) / den } else { (num - half) / den };
    rounded as i64
}

/// Convert a timestamp in `time_base` units to seconds.
#[inline]
pub fn ts_to_seconds(ts: i64, time_base: Rational) -> Seconds {
    ts as f64 * time_base.to_f64()
}

/// Convert an optional timestamp to seconds, mapping `None` to `NaN`.
#[inline]
pub fn opt_ts_to_seconds(ts: Option<i64>, time_base: Rational) -> Seconds {
    ts.map_or(f64::NAN, |ts| ts_to_seconds(ts, time_base))
}

/// Convert seconds to microseconds (container time base)
#[inline]
pub fn from_seconds(seconds: Seconds) -> i64 {
    (seconds * constants::MICROS_PER_SECOND) as i64
}

/// Convert microseconds (container time base) to seconds
#[inline]
pub fn to_seconds(micros: i64) -> Seconds {
    micros as f64 / constants::MICROS_PER_SECOND
}

/// Convert milliseconds to seconds
#[inline]
pub fn millis_to_seconds(millis: u32) -> Seconds {
    millis as f64 / constants::MILLIS_PER_SECOND
}

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

/// Monotonic wall time in seconds since the first call in this process.
pub fn now() -> Seconds {
    epoch().elapsed().as_secs_f64()
}

/// Format seconds as HH:MM:SS.mmm
pub fn format_time(seconds: Seconds) -> String {
    if !seconds.is_finite() {
        return "--:--:--.---".to_string();
    }
    let sign = if seconds < 0.0 { "-" } else { "" };
    let total_millis = (seconds.abs() * 1000.0).round() as i64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis / 60_000) % 60;
    let secs = (total_millis / 1000) % 60;
    let millis = total_millis % 1000;

    format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, secs, millis)
}

/// Format seconds as HH:MM:SS, truncating.
pub fn format_hms(seconds: Seconds) -> String {
    let total = if seconds.is_finite() { seconds.max(0.0) as i64 } else { 0 };
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_conversion() {
        let time = from_seconds(1.5);
        assert_eq!(time, 1_500_000);
        assert!((to_seconds(time) - 1.5).abs() < 0.000001);
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        // 90kHz to milliseconds
        assert_eq!(rescale(90_000, Rational::new(1, 90_000), Rational::new(1, 1000)), 1000);
        assert_eq!(rescale(45, Rational::new(1, 90_000), Rational::new(1, 1000)), 1);
        assert_eq!(rescale(-45, Rational::new(1, 90_000), Rational::new(1, 1000)), -1);
        assert_eq!(rescale(44, Rational::new(1, 90_000), Rational::new(1, 1000)), 0);
    }

    #[test]
    fn test_rescale_audio_time_base() {
        let pkt_tb = Rational::new(1, 1000);
        let sample_tb = Rational::new(1, 48_000);
        assert_eq!(rescale(500, pkt_tb, sample_tb), 24_000);
        assert_eq!(rescale(24_000, sample_tb, pkt_tb), 500);
    }

    #[test]
    fn test_ts_to_seconds() {
        assert!((ts_to_seconds(3000, Rational::new(1, 1000)) - 3.0).abs() < 1e-9);
        assert!(opt_ts_to_seconds(None, Rational::new(1, 1000)).is_nan());
    }

    #[test]
    fn test_rational() {
        assert!(Rational::new(16, 9).is_valid());
        assert!(!Rational::UNDEFINED.is_valid());
        assert!(Rational::new(1, 0).to_f64().is_nan());
        assert_eq!(Rational::new(1, 25).invert(), Rational::new(25, 1));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(3661.5), "01:01:01.500");
        assert_eq!(format_time(f64::NAN), "--:--:--.---");
        assert_eq!(format_hms(3725.9), "01:02:05");
    }

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }
}
