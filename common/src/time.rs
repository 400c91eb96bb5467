//! Wall clock time as handed out by the gateway.
//!
//! The gateway is the only time source of the network. Every acknowledgement
//! carries the current time as 32 bit Unix seconds (big endian), and the node
//! never sets its clock from anywhere else.

use core::fmt;

pub const SECONDS_PER_MINUTE: u32 = 60;
pub const SECONDS_PER_HOUR: u32 = 60 * SECONDS_PER_MINUTE;
pub const SECONDS_PER_DAY: u32 = 24 * SECONDS_PER_HOUR;

/// Seconds since 1970-01-01 00:00:00 UTC.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Timestamp(u32);

impl Timestamp {
    /// The "never" timestamp, used for fields that were not set yet.
    pub const UNSET: Timestamp = Timestamp(0);

    pub const fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    pub const fn as_secs(&self) -> u32 {
        self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// Number of whole days since the epoch. Two timestamps on the same UTC
    /// day share the day number.
    pub fn day_number(&self) -> u32 {
        self.0 / SECONDS_PER_DAY
    }

    /// Number of whole hours since the epoch.
    pub fn hour_number(&self) -> u32 {
        self.0 / SECONDS_PER_HOUR
    }

    pub fn seconds_of_day(&self) -> u32 {
        self.0 % SECONDS_PER_DAY
    }

    /// Seconds elapsed since `earlier`, zero if `earlier` lies in the future.
    pub fn saturating_sub(&self, earlier: Timestamp) -> u32 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.seconds_of_day();
        write!(
            f,
            "day {} {:02}:{:02}:{:02}",
            self.day_number(),
            secs / SECONDS_PER_HOUR,
            (secs % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE,
            secs % SECONDS_PER_MINUTE
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{NaiveDate, NaiveDateTime, Timelike};
    use rstest::rstest;

    fn datetime(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    fn timestamp(dt: NaiveDateTime) -> Timestamp {
        Timestamp::from_secs(dt.and_utc().timestamp() as u32)
    }

    #[rstest]
    #[case(datetime(1970, 1, 1, 0, 0, 3))]
    #[case(datetime(1999, 12, 31, 23, 59, 59))]
    #[case(datetime(2024, 2, 29, 13, 14, 15))]
    #[case(datetime(2024, 3, 1, 0, 0, 0))]
    #[case(datetime(2098, 11, 28, 6, 30, 0))]
    fn test_day_number_vs_chrono(#[case] dt: NaiveDateTime) {
        let ts = timestamp(dt);
        let days = dt.date().signed_duration_since(datetime(1970, 1, 1, 0, 0, 0).date());
        assert_eq!(i64::from(ts.day_number()), days.num_days(), "{}", dt);
        assert_eq!(ts.hour_number() % 24, dt.hour());
    }

    #[test]
    fn test_day_and_hour_rollover() {
        let ts = timestamp(datetime(2022, 7, 25, 23, 59, 59));
        let next = Timestamp::from_secs(ts.as_secs() + 1);
        assert_eq!(next.day_number(), ts.day_number() + 1);
        assert_eq!(next.hour_number(), ts.hour_number() + 1);
        assert_eq!(next.seconds_of_day(), 0);
    }

    #[test]
    fn test_display() {
        let ts = timestamp(datetime(1970, 1, 2, 8, 5, 9));
        assert_eq!(ts.to_string(), "day 1 08:05:09");
    }

    #[test]
    fn test_saturating_sub() {
        let a = Timestamp::from_secs(100);
        let b = Timestamp::from_secs(160);
        assert_eq!(b.saturating_sub(a), 60);
        assert_eq!(a.saturating_sub(b), 0);
    }
}
