//! Wake scheduling.
//!
//! Reports are aligned to the reporting boundary, the next wall clock instant
//! that is a multiple of the reporting period. Each joined node shifts its
//! boundary by a stagger of `node_number × node_stagger_seconds` so that the
//! nodes of a deployment do not all talk at once.
//!
//! The scheduler remembers the index of the last period a report was
//! acknowledged in. Wakes inside an already reported period sleep until the
//! next one, wakes inside an unreported period report right away.

use rand::{rngs::SmallRng, Rng, SeedableRng};

use lora_counter_common::{SystemState, Timestamp};
use lora_counter_config::NodeConfig;

/// Back-off exponent cap.
const MAX_BACKOFF_EXPONENT: u8 = 3;

pub struct Scheduler {
    backoff_base_seconds: u32,
    node_stagger_seconds: u32,
    guard_window_seconds: u32,
    clock_invalid_retry_seconds: u32,
    last_reported_period: Option<u32>,
    rng: SmallRng,
}

impl Scheduler {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            backoff_base_seconds: config.backoff_base_seconds,
            node_stagger_seconds: config.node_stagger_seconds,
            guard_window_seconds: config.guard_window_seconds,
            clock_invalid_retry_seconds: config.clock_invalid_retry_seconds,
            last_reported_period: None,
            rng: SmallRng::seed_from_u64(0),
        }
    }

    /// Reseed the back-off coin from the last connection and node number.
    ///
    /// Nodes that joined in the same instant get different node numbers and
    /// thus different back-off sequences.
    pub fn reseed(&mut self, system: &SystemState) {
        let seed = u64::from(system.last_connection.as_secs()) * u64::from(system.node_number);
        self.rng = SmallRng::seed_from_u64(seed);
    }

    /// Offset of this node's period start to the reporting boundary.
    pub fn stagger_secs(&self, system: &SystemState) -> u32 {
        if !system.is_joined() {
            return 0;
        }
        (u32::from(system.node_number) * self.node_stagger_seconds) % system.report_period_secs()
    }

    /// Index of the node's reporting period `now` falls into.
    pub fn period_index(&self, now: Timestamp, system: &SystemState) -> u32 {
        now.as_secs().saturating_sub(self.stagger_secs(system)) / system.report_period_secs()
    }

    /// Whether no report was acknowledged in the current period yet.
    pub fn report_due(&self, now: Option<Timestamp>, system: &SystemState) -> bool {
        match now {
            Some(now) => self.last_reported_period != Some(self.period_index(now, system)),
            None => true,
        }
    }

    /// Record that the report of the current period was acknowledged.
    pub fn mark_reported(&mut self, now: Timestamp, system: &SystemState) {
        self.last_reported_period = Some(self.period_index(now, system));
    }

    /// Forget the reported period, e.g. after the cadence changed.
    pub fn forget(&mut self) {
        self.last_reported_period = None;
    }

    /// Seconds until the start of the node's next reporting period, in
    /// `1..=period`.
    fn seconds_to_boundary(&self, now: Timestamp, system: &SystemState) -> u32 {
        let period = system.report_period_secs();
        let stagger = self.stagger_secs(system);
        let phase = (now.as_secs() % period + period - stagger) % period;
        (period - phase).min(period)
    }

    /// Randomized exponential back-off: `base × coin × 2^retry_count`, with
    /// the exponent capped at 3.
    pub fn backoff_secs(&mut self, retry_count: u8) -> u32 {
        let coin = u32::from(self.rng.gen_bool(0.5));
        (self.backoff_base_seconds * coin) << retry_count.min(MAX_BACKOFF_EXPONENT)
    }

    /// How long to sleep before the next event.
    ///
    /// After a failed exchange this is the back-off. With an invalid clock it
    /// is a short fixed interval, the node must keep trying to catch the
    /// gateway to get the time. Otherwise the node sleeps until its next
    /// period starts.
    pub fn seconds_until_next_event(
        &mut self,
        now: Option<Timestamp>,
        system: &SystemState,
        retry_count: u8,
    ) -> u32 {
        if retry_count > 0 {
            return self.backoff_secs(retry_count);
        }
        match now {
            Some(now) => self.seconds_to_boundary(now, system),
            None => self.clock_invalid_retry_seconds,
        }
    }

    /// Whether the next period starts within the guard window of `now`.
    ///
    /// Only the boundary counts. An unreported period is picked up by the
    /// timer wake, never by sensor edges.
    pub fn in_guard_window(&self, now: Timestamp, system: &SystemState) -> bool {
        self.seconds_to_boundary(now, system) <= self.guard_window_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lora_counter_common::{AlertCode, SensorType};
    use rstest::rstest;

    /// Multiple of 3600, i.e. a boundary for all periods
    const T0: u32 = 1_658_750_400;

    fn system(node_number: u8, frequency_minutes: u16) -> SystemState {
        let mut s = SystemState::factory_defaults(27617, SensorType::Pir);
        s.node_number = node_number;
        s.frequency_minutes = frequency_minutes;
        s.alert_code = AlertCode::None;
        s.last_connection = Timestamp::from_secs(T0);
        s
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(&NodeConfig::default())
    }

    #[rstest]
    // 15 min period, node 3: stagger 30 s
    #[case(3, 15, 300, 630)]
    #[case(3, 15, 0, 30)]
    #[case(3, 15, 30, 900)]
    #[case(3, 15, 31, 899)]
    // Unconfigured nodes have no stagger
    #[case(11, 60, 1800, 1800)]
    // Stagger wraps at the period length
    #[case(10, 1, 0, 40)]
    fn test_seconds_to_boundary(
        #[case] node_number: u8,
        #[case] frequency_minutes: u16,
        #[case] offset: u32,
        #[case] expected: u32,
    ) {
        let mut s = scheduler();
        let state = system(node_number, frequency_minutes);
        let now = Timestamp::from_secs(T0 + offset);
        assert_eq!(s.seconds_until_next_event(Some(now), &state, 0), expected);
    }

    #[test]
    fn test_clock_invalid() {
        let mut s = scheduler();
        assert_eq!(s.seconds_until_next_event(None, &system(3, 15), 0), 60);
    }

    #[test]
    fn test_backoff_bound() {
        let config = NodeConfig::default();
        for node_number in 1..=10 {
            let mut state = system(node_number, 15);
            for lc in 0..50 {
                state.last_connection = Timestamp::from_secs(T0 + lc * 977);
                let mut s = scheduler();
                s.reseed(&state);
                for retry_count in 0..=5u8 {
                    let secs = s.backoff_secs(retry_count);
                    let step = config.backoff_base_seconds << retry_count.min(3);
                    assert!(secs == 0 || secs == step, "{} for retry {}", secs, retry_count);
                    assert!(secs <= config.backoff_base_seconds * 8);
                }
            }
        }
    }

    #[test]
    fn test_backoff_coin_takes_both_sides() {
        let mut s = scheduler();
        s.reseed(&system(4, 15));
        let values: Vec<u32> = (0..64).map(|_| s.backoff_secs(1)).collect();
        assert!(values.contains(&0));
        assert!(values.contains(&60));
    }

    #[test]
    fn test_report_due_once_per_period() {
        let mut s = scheduler();
        let state = system(3, 15);
        let start = Timestamp::from_secs(T0 + 100);
        assert!(s.report_due(Some(start), &state));
        s.mark_reported(start, &state);
        assert!(!s.report_due(Some(start), &state));
        // Same period, 10 minutes later
        assert!(!s.report_due(Some(Timestamp::from_secs(T0 + 700)), &state));
        // Next period starts at the boundary plus stagger
        assert!(!s.report_due(Some(Timestamp::from_secs(T0 + 929)), &state));
        assert!(s.report_due(Some(Timestamp::from_secs(T0 + 930)), &state));
    }

    #[rstest]
    #[case(T0 + 500, false)]
    #[case(T0 + 927, false)]
    #[case(T0 + 928, true)]
    #[case(T0 + 929, true)]
    #[case(T0 + 930, false)]
    #[case(T0 + 931, false)]
    fn test_guard_window(#[case] now: u32, #[case] expected: bool) {
        let mut s = scheduler();
        let state = system(3, 15);
        s.mark_reported(Timestamp::from_secs(T0 + 100), &state);
        assert_eq!(s.in_guard_window(Timestamp::from_secs(now), &state), expected);
    }

    #[test]
    fn test_unreported_period_is_not_a_guard_window() {
        let s = scheduler();
        let state = system(3, 15);
        let now = Timestamp::from_secs(T0 + 400);
        assert!(s.report_due(Some(now), &state));
        assert!(!s.in_guard_window(now, &state));
    }

    /// Simulate timer and sensor wakes in random order over many periods and
    /// check that every period gets exactly one report.
    #[test]
    fn test_no_period_is_skipped() {
        let mut rng = SmallRng::seed_from_u64(0xC0FFEE);
        for node_number in [1u8, 3, 10] {
            let state = system(node_number, 5);
            let mut s = scheduler();
            let mut now = T0 + rng.gen_range(0..300);
            let mut reported: Vec<u32> = Vec::new();

            for _ in 0..2_000 {
                // Idle: report if due
                if s.report_due(Some(Timestamp::from_secs(now)), &state) {
                    let index = s.period_index(Timestamp::from_secs(now), &state);
                    assert!(!reported.contains(&index));
                    reported.push(index);
                    s.mark_reported(Timestamp::from_secs(now), &state);
                }
                // Sleeping: sensor edges may cut the sleep short
                loop {
                    let secs = s.seconds_until_next_event(Some(Timestamp::from_secs(now)), &state, 0);
                    if rng.gen_bool(0.6) {
                        now += rng.gen_range(0..secs);
                        if s.in_guard_window(Timestamp::from_secs(now), &state) {
                            break;
                        }
                    } else {
                        now += secs;
                        break;
                    }
                }
            }

            for pair in reported.windows(2) {
                assert_eq!(pair[1], pair[0] + 1, "node {} skipped a period", node_number);
            }
        }
    }
}
