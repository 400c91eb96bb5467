//! Event counting.
//!
//! Sensor edges are counted into the hourly and daily counters. Two edges in
//! the same clock second are one event (contact bounce, a car's second axle).

use lora_counter_common::{state::MAX_HOURLY_COUNT, CountersState, Timestamp};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CountOutcome {
    Counted,
    /// Another event was counted in the same second
    SameSecond,
    /// Counting is suspended outside of opening hours
    Closed,
}

/// Count one sensor event at `now`.
pub fn record_event(counters: &mut CountersState, now: Timestamp, open_hours: bool) -> CountOutcome {
    if !open_hours {
        return CountOutcome::Closed;
    }
    // A reset stamps `last_count_time` without counting
    if counters.daily_count > 0 && counters.last_count_time == now {
        return CountOutcome::SameSecond;
    }
    if now.hour_number() != counters.last_count_time.hour_number() {
        counters.hourly_count = 0;
    }
    counters.hourly_count = (counters.hourly_count + 1).min(MAX_HOURLY_COUNT);
    counters.daily_count = counters.daily_count.saturating_add(1);
    counters.last_count_time = now;
    CountOutcome::Counted
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rollover {
    None,
    Hour,
    Day,
}

/// Restart the counters when a new hour or day began since the last count.
///
/// Calling this again within the same day is a no-op.
pub fn check_rollover(counters: &mut CountersState, now: Timestamp) -> Rollover {
    if now.day_number() != counters.last_count_time.day_number() {
        counters.reset(now);
        return Rollover::Day;
    }
    if counters.hourly_count != 0 && now.hour_number() != counters.last_count_time.hour_number() {
        counters.hourly_count = 0;
        return Rollover::Hour;
    }
    Rollover::None
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;
    use rstest::rstest;

    fn ts(h: u32, m: u32, s: u32) -> Timestamp {
        let dt = NaiveDate::from_ymd_opt(2022, 7, 25)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap();
        Timestamp::from_secs(dt.and_utc().timestamp() as u32)
    }

    #[test]
    fn test_same_second_is_one_event() {
        let mut counters = CountersState::default();
        assert_eq!(record_event(&mut counters, ts(9, 0, 0), true), CountOutcome::Counted);
        assert_eq!(record_event(&mut counters, ts(9, 0, 0), true), CountOutcome::SameSecond);
        assert_eq!(record_event(&mut counters, ts(9, 0, 1), true), CountOutcome::Counted);
        assert_eq!(counters.hourly_count, 2);
        assert_eq!(counters.daily_count, 2);
        assert_eq!(counters.last_count_time, ts(9, 0, 1));
    }

    #[test]
    fn test_closed_hours_do_not_count() {
        let mut counters = CountersState::default();
        assert_eq!(record_event(&mut counters, ts(22, 0, 0), false), CountOutcome::Closed);
        assert_eq!(counters, CountersState::default());
    }

    #[test]
    fn test_hourly_count_restarts_each_hour() {
        let mut counters = CountersState::default();
        record_event(&mut counters, ts(9, 59, 58), true);
        record_event(&mut counters, ts(9, 59, 59), true);
        record_event(&mut counters, ts(10, 0, 0), true);
        assert_eq!(counters.hourly_count, 1);
        assert_eq!(counters.daily_count, 3);
    }

    #[test]
    fn test_hourly_count_saturates() {
        let mut counters = CountersState {
            hourly_count: MAX_HOURLY_COUNT,
            daily_count: 5000,
            last_count_time: ts(9, 0, 0),
            ..CountersState::default()
        };
        record_event(&mut counters, ts(9, 0, 1), true);
        assert_eq!(counters.hourly_count, MAX_HOURLY_COUNT);
        assert_eq!(counters.daily_count, 5001);
    }

    #[test]
    fn test_day_rollover_is_idempotent() {
        let mut counters = CountersState {
            hourly_count: 3,
            daily_count: 30,
            last_count_time: ts(23, 59, 0),
            message_count: 4,
            success_count: 4,
            rssi: -70,
            ..CountersState::default()
        };
        let next_day = Timestamp::from_secs(ts(0, 0, 5).as_secs() + 86_400);
        assert_eq!(check_rollover(&mut counters, next_day), Rollover::Day);
        let after_first = counters;
        assert_eq!(counters.daily_count, 0);
        assert_eq!(counters.message_count, 0);
        assert_eq!(counters.last_count_time, next_day);
        assert_eq!(counters.rssi, -70);

        let later = Timestamp::from_secs(next_day.as_secs() + 60);
        assert_eq!(check_rollover(&mut counters, later), Rollover::None);
        assert_eq!(counters, after_first);
    }

    #[test]
    fn test_event_in_reset_second_counts() {
        let mut counters = CountersState {
            daily_count: 12,
            last_count_time: ts(23, 59, 59),
            ..CountersState::default()
        };
        let midnight = Timestamp::from_secs(ts(0, 0, 0).as_secs() + 86_400);
        assert_eq!(check_rollover(&mut counters, midnight), Rollover::Day);
        assert_eq!(record_event(&mut counters, midnight, true), CountOutcome::Counted);
        assert_eq!(counters.daily_count, 1);
    }

    #[rstest]
    #[case(ts(9, 30, 0), Rollover::None)]
    #[case(ts(10, 0, 0), Rollover::Hour)]
    #[case(ts(23, 59, 59), Rollover::Hour)]
    fn test_hour_rollover(#[case] now: Timestamp, #[case] expected: Rollover) {
        let mut counters = CountersState {
            hourly_count: 7,
            daily_count: 70,
            last_count_time: ts(9, 10, 0),
            ..CountersState::default()
        };
        assert_eq!(check_rollover(&mut counters, now), expected);
        assert_eq!(counters.daily_count, 70);
        // Second check in the same hour changes nothing
        assert_eq!(check_rollover(&mut counters, now), Rollover::None);
    }
}
