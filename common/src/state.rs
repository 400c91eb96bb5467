//! Durable node state.
//!
//! `SystemState` holds identity and configuration handed out by the gateway,
//! `CountersState` holds the measurements of the current day. Both survive
//! deep sleep and power loss (see the `lora-counter-config` crate for the
//! storage layout).

use core::fmt;

use crate::alert::AlertCode;
use crate::time::Timestamp;

/// Address of the gateway, always zero.
pub const GATEWAY_NODE_NUMBER: u8 = 0;
/// Highest node number the gateway hands out.
pub const MAX_NODE_NUMBER: u8 = 10;
/// Node number of a node that has not joined yet.
pub const UNCONFIGURED_NODE_NUMBER: u8 = 11;

/// Default shared magic number of a deployment.
pub const DEFAULT_MAGIC_NUMBER: u16 = 27617;
/// Version of the state structures. A mismatch resets the node.
pub const STRUCTURES_VERSION: u8 = 1;
/// Default reporting cadence until the gateway says otherwise.
pub const DEFAULT_FREQUENCY_MINUTES: u16 = 60;
pub const MAX_FREQUENCY_MINUTES: u16 = 60;
/// Upper validation bound of the hourly count.
pub const MAX_HOURLY_COUNT: u16 = 1024;

#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[cfg_attr(feature = "serde", derive(serde_repr::Serialize_repr, serde_repr::Deserialize_repr))]
#[repr(u8)]
pub enum SensorType {
    /// Pressure hose vehicle counter
    Pressure = 0,
    /// Passive infrared pedestrian counter
    Pir = 1,
}

impl SensorType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Pressure),
            1 => Some(Self::Pir),
            _ => None,
        }
    }
}

impl Default for SensorType {
    fn default() -> Self {
        Self::Pressure
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pressure => write!(f, "pressure"),
            Self::Pir => write!(f, "PIR"),
        }
    }
}

/// Charger state as reported by the fuel gauge.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[cfg_attr(feature = "serde", derive(serde_repr::Serialize_repr, serde_repr::Deserialize_repr))]
#[repr(u8)]
pub enum BatteryState {
    Unknown = 0,
    NotCharging = 1,
    Charging = 2,
    Charged = 3,
    Discharging = 4,
    Fault = 5,
    Disconnected = 6,
}

impl BatteryState {
    /// Unknown raw values map to `Unknown`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::NotCharging,
            2 => Self::Charging,
            3 => Self::Charged,
            4 => Self::Discharging,
            5 => Self::Fault,
            6 => Self::Disconnected,
            _ => Self::Unknown,
        }
    }
}

impl Default for BatteryState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A state value outside of its valid range.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum BoundsError {
    FrequencyMinutes(u16),
    NodeNumber(u8),
    HourlyCount(u16),
}

impl fmt::Display for BoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrequencyMinutes(v) => write!(f, "frequency minutes out of range ({})", v),
            Self::NodeNumber(v) => write!(f, "node number out of range ({})", v),
            Self::HourlyCount(v) => write!(f, "hourly count out of range ({})", v),
        }
    }
}

/// Identity and configuration of the node.
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct SystemState {
    /// 0 = gateway, 1..=10 = assigned, 11 = not joined yet
    pub node_number: u8,
    /// Shared tag used to reject foreign traffic
    pub magic_number: u16,
    /// Version of the storage schema
    pub structures_version: u8,
    pub reset_count: u8,
    /// Last time the gateway acknowledged a message
    pub last_connection: Timestamp,
    /// Reporting cadence set by the gateway (1..=60)
    pub frequency_minutes: u16,
    pub alert_code: AlertCode,
    pub alert_timestamp: Timestamp,
    pub sensor_type: SensorType,
    /// Whether events are counted right now
    pub open_hours: bool,
}

impl SystemState {
    /// Factory defaults: not joined, hourly reports, must join.
    pub fn factory_defaults(magic_number: u16, sensor_type: SensorType) -> Self {
        Self {
            node_number: UNCONFIGURED_NODE_NUMBER,
            magic_number,
            structures_version: STRUCTURES_VERSION,
            reset_count: 0,
            last_connection: Timestamp::UNSET,
            frequency_minutes: DEFAULT_FREQUENCY_MINUTES,
            alert_code: AlertCode::Unconfigured,
            alert_timestamp: Timestamp::UNSET,
            sensor_type,
            open_hours: true,
        }
    }

    pub fn validate(&self) -> Result<(), BoundsError> {
        if self.frequency_minutes == 0 || self.frequency_minutes > MAX_FREQUENCY_MINUTES {
            return Err(BoundsError::FrequencyMinutes(self.frequency_minutes));
        }
        if self.node_number > UNCONFIGURED_NODE_NUMBER {
            return Err(BoundsError::NodeNumber(self.node_number));
        }
        Ok(())
    }

    /// Whether the gateway assigned a node number (1..=10).
    pub fn is_joined(&self) -> bool {
        (1..=MAX_NODE_NUMBER).contains(&self.node_number)
    }

    /// Reporting period in seconds.
    pub fn report_period_secs(&self) -> u32 {
        u32::from(self.frequency_minutes.max(1)) * 60
    }

    pub fn raise_alert(&mut self, alert: AlertCode, at: Timestamp) {
        self.alert_code = alert;
        self.alert_timestamp = at;
    }

    pub fn clear_alert(&mut self) {
        self.alert_code = AlertCode::None;
    }
}

/// Counts and health values of the current reporting day.
#[derive(PartialEq, Debug, Copy, Clone, Default)]
pub struct CountersState {
    pub hourly_count: u16,
    pub daily_count: u16,
    pub last_count_time: Timestamp,
    /// Reports sent, wraps together with `success_count`
    pub message_count: u8,
    /// Reports acknowledged
    pub success_count: u8,
    pub internal_temp_c: i8,
    /// Battery state of charge in percent
    pub state_of_charge: f64,
    pub battery_state: BatteryState,
    pub rssi: i16,
    pub snr: i16,
}

impl CountersState {
    pub fn validate(&self) -> Result<(), BoundsError> {
        if self.hourly_count > MAX_HOURLY_COUNT {
            return Err(BoundsError::HourlyCount(self.hourly_count));
        }
        Ok(())
    }

    /// Zero the counts and the message tally. Health values are kept.
    pub fn reset(&mut self, at: Timestamp) {
        self.hourly_count = 0;
        self.daily_count = 0;
        self.message_count = 0;
        self.success_count = 0;
        self.last_count_time = at;
    }

    /// Advance the message counter for a new report.
    ///
    /// When the counter would wrap, the success counter restarts as well, so
    /// that the success ratio never divides by zero or exceeds 100%.
    pub fn next_message(&mut self) -> u8 {
        if self.message_count == u8::MAX {
            self.message_count = 0;
            self.success_count = 0;
        }
        self.message_count += 1;
        self.message_count
    }

    /// Acknowledged share of the sent reports in percent.
    pub fn success_rate(&self) -> f32 {
        if self.message_count == 0 {
            return 0.0;
        }
        f32::from(self.success_count) / f32::from(self.message_count) * 100.0
    }
}
