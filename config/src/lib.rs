#![cfg_attr(not(test), no_std)]
//! # Persistent Node State
//!
//! The node state is kept in byte addressable non-volatile memory (FRAM). It
//! consists of two records that are validated independently, so that a
//! corrupted counters record never costs the node its node number.
//!
//! ## Memory Map
//!
//! ```text
//!         0           8          16          24          32
//!         +-----------+-----------+-----------+-----------+
//! 0x0000  | Magic (0x20A99E75)                            |
//!         +-----------+-----------+-----------+-----------+
//! 0x0004  | Version               | Length                |
//!         +-----------+-----------+-----------+-----------+
//! 0x0008  | CRC                   | Reserved              |
//!         +-----------+-----------+-----------+-----------+
//! 0x000C  | System record body (18 bytes)                 |
//!         ~                                               ~
//!         +-----------+-----------+-----------+-----------+
//! 0x0064  | Magic (0x20A99E74)                            |
//!         +-----------+-----------+-----------+-----------+
//! 0x0068  | Version               | Length                |
//!         +-----------+-----------+-----------+-----------+
//! 0x006C  | CRC                   | Reserved              |
//!         +-----------+-----------+-----------+-----------+
//! 0x0070  | Counters record body (24 bytes)               |
//!         ~                                               ~
//!         +-----------+-----------+-----------+-----------+
//! ```
//!
//! ## Header (12 bytes)
//!
//! - `Magic`: Identifies the record type (4 bytes, u32, LE)
//! - `Version`: The constant `2`, can be used to change the record layout in
//!   the future (2 bytes, u16, LE)
//! - `Length`: Length of the body in bytes (2 bytes, u16, LE)
//! - `CRC`: CRC-16/CCITT-FALSE over the body (2 bytes, u16, LE)
//! - The reserved bytes are written as zero.
//!
//! ## System Record Body
//!
//! `node_number` (u8), `magic_number` (u16), `structures_version` (u8),
//! `reset_count` (u8), `last_connection` (u32), `frequency_minutes` (u16),
//! `alert_code` (u8), `alert_timestamp` (u32), `sensor_type` (u8),
//! `open_hours` (u8).
//!
//! ## Counters Record Body
//!
//! `hourly_count` (u16), `daily_count` (u16), `last_count_time` (u32),
//! `message_count` (u8), `success_count` (u8), `internal_temp_c` (i8),
//! `state_of_charge` (f64), `battery_state` (u8), `rssi` (i16), `snr` (i16).
//!
//! All multi-byte values are little endian.

use core::fmt;

use lora_counter_common::{
    crc::crc16,
    message::DeviceIdentity,
    state::{STRUCTURES_VERSION, DEFAULT_MAGIC_NUMBER},
    AlertCode, BatteryState, BoundsError, CountersState, SensorType, SystemState, Timestamp,
};

pub const SYSTEM_RECORD_OFFSET: usize = 0;
pub const COUNTERS_RECORD_OFFSET: usize = 100;
pub const HEADER_SIZE: usize = 12;
pub const RECORD_VERSION: u16 = 2;

pub const SYSTEM_RECORD_MAGIC: u32 = 0x20A9_9E75;
pub const COUNTERS_RECORD_MAGIC: u32 = 0x20A9_9E74;

pub const SYSTEM_BODY_SIZE: usize = 18;
pub const COUNTERS_BODY_SIZE: usize = 24;
pub const MAX_RECORD_SIZE: usize = HEADER_SIZE + COUNTERS_BODY_SIZE;

/// Number of bytes covered by both records.
pub const STORAGE_SIZE: usize = COUNTERS_RECORD_OFFSET + HEADER_SIZE + COUNTERS_BODY_SIZE;

#[derive(PartialEq, Debug, Copy, Clone)]
pub enum ConfigError {
    /// Wrong magic bytes, the record data might be corrupted.
    WrongMagicBytes { expected: u32, found: u32 },
    /// The version field is not supported.
    UnsupportedVersion(u16),
    /// The length field does not match the record layout.
    LengthMismatch { expected: usize, found: usize },
    /// The body does not match its checksum.
    ChecksumMismatch,
    /// The buffer is shorter than the record.
    Truncated { expected: usize, found: usize },
    /// The record was written by firmware with other state structures.
    StructuresVersion(u8),
    /// A field holds a value outside of its domain.
    InvalidField(&'static str),
    /// A value violates its bounds.
    OutOfBounds(BoundsError),
}

impl From<BoundsError> for ConfigError {
    fn from(e: BoundsError) -> Self {
        Self::OutOfBounds(e)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongMagicBytes { expected, found } => {
                write!(f, "Wrong magic bytes (expected {:#010x}, found {:#010x})", expected, found)
            }
            Self::UnsupportedVersion(v) => write!(f, "Unsupported record format version ({})", v),
            Self::LengthMismatch { expected, found } => {
                write!(f, "Record length mismatch (expected {}, found {})", expected, found)
            }
            Self::ChecksumMismatch => write!(f, "Record checksum mismatch"),
            Self::Truncated { expected, found } => {
                write!(f, "Record truncated ({} of {} bytes)", found, expected)
            }
            Self::StructuresVersion(v) => write!(f, "Unsupported structures version ({})", v),
            Self::InvalidField(name) => write!(f, "Invalid value in field {}", name),
            Self::OutOfBounds(e) => write!(f, "Out of bounds: {}", e),
        }
    }
}

/// A fixed layout record with a validated header.
pub trait Record: Sized {
    const MAGIC: u32;
    const BODY_SIZE: usize;
    const SIZE: usize = HEADER_SIZE + Self::BODY_SIZE;

    fn write_body(&self, body: &mut [u8]);
    fn read_body(body: &[u8]) -> Result<Self, ConfigError>;
    fn validate(&self) -> Result<(), ConfigError>;
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Serialize a record (header and body) into `out`.
///
/// Returns the number of bytes written.
pub fn serialize<R: Record>(record: &R, out: &mut [u8]) -> Result<usize, ConfigError> {
    if out.len() < R::SIZE {
        return Err(ConfigError::Truncated {
            expected: R::SIZE,
            found: out.len(),
        });
    }
    let (header, rest) = out.split_at_mut(HEADER_SIZE);
    let body = &mut rest[..R::BODY_SIZE];
    record.write_body(body);

    header[0..4].copy_from_slice(&R::MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&RECORD_VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&(R::BODY_SIZE as u16).to_le_bytes());
    header[8..10].copy_from_slice(&crc16(body).to_le_bytes());
    header[10..12].copy_from_slice(&[0, 0]);
    Ok(R::SIZE)
}

/// Read and validate a record.
///
/// Any header mismatch, checksum error or out of bounds value is an error.
/// The caller decides what to fall back to.
pub fn deserialize<R: Record>(data: &[u8]) -> Result<R, ConfigError> {
    if data.len() < HEADER_SIZE {
        return Err(ConfigError::Truncated {
            expected: R::SIZE,
            found: data.len(),
        });
    }

    // Validate header
    let magic = le_u32(data, 0);
    if magic != R::MAGIC {
        return Err(ConfigError::WrongMagicBytes {
            expected: R::MAGIC,
            found: magic,
        });
    }
    let version = le_u16(data, 4);
    if version != RECORD_VERSION {
        return Err(ConfigError::UnsupportedVersion(version));
    }
    let length = usize::from(le_u16(data, 6));
    if length != R::BODY_SIZE {
        return Err(ConfigError::LengthMismatch {
            expected: R::BODY_SIZE,
            found: length,
        });
    }
    let body = data
        .get(HEADER_SIZE..R::SIZE)
        .ok_or(ConfigError::Truncated {
            expected: R::SIZE,
            found: data.len(),
        })?;
    if crc16(body) != le_u16(data, 8) {
        return Err(ConfigError::ChecksumMismatch);
    }

    let record = R::read_body(body)?;
    record.validate()?;
    Ok(record)
}

impl Record for SystemState {
    const MAGIC: u32 = SYSTEM_RECORD_MAGIC;
    const BODY_SIZE: usize = SYSTEM_BODY_SIZE;

    fn write_body(&self, body: &mut [u8]) {
        body[0] = self.node_number;
        body[1..3].copy_from_slice(&self.magic_number.to_le_bytes());
        body[3] = self.structures_version;
        body[4] = self.reset_count;
        body[5..9].copy_from_slice(&self.last_connection.as_secs().to_le_bytes());
        body[9..11].copy_from_slice(&self.frequency_minutes.to_le_bytes());
        body[11] = self.alert_code.to_raw();
        body[12..16].copy_from_slice(&self.alert_timestamp.as_secs().to_le_bytes());
        body[16] = self.sensor_type as u8;
        body[17] = self.open_hours as u8;
    }

    fn read_body(body: &[u8]) -> Result<Self, ConfigError> {
        let sensor_type =
            SensorType::from_raw(body[16]).ok_or(ConfigError::InvalidField("sensor_type"))?;
        Ok(Self {
            node_number: body[0],
            magic_number: le_u16(body, 1),
            structures_version: body[3],
            reset_count: body[4],
            last_connection: Timestamp::from_secs(le_u32(body, 5)),
            frequency_minutes: le_u16(body, 9),
            alert_code: AlertCode::from_raw(body[11]),
            alert_timestamp: Timestamp::from_secs(le_u32(body, 12)),
            sensor_type,
            open_hours: body[17] != 0,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.structures_version != STRUCTURES_VERSION {
            return Err(ConfigError::StructuresVersion(self.structures_version));
        }
        Ok(SystemState::validate(self)?)
    }
}

impl Record for CountersState {
    const MAGIC: u32 = COUNTERS_RECORD_MAGIC;
    const BODY_SIZE: usize = COUNTERS_BODY_SIZE;

    fn write_body(&self, body: &mut [u8]) {
        body[0..2].copy_from_slice(&self.hourly_count.to_le_bytes());
        body[2..4].copy_from_slice(&self.daily_count.to_le_bytes());
        body[4..8].copy_from_slice(&self.last_count_time.as_secs().to_le_bytes());
        body[8] = self.message_count;
        body[9] = self.success_count;
        body[10] = self.internal_temp_c as u8;
        body[11..19].copy_from_slice(&self.state_of_charge.to_le_bytes());
        body[19] = self.battery_state as u8;
        body[20..22].copy_from_slice(&self.rssi.to_le_bytes());
        body[22..24].copy_from_slice(&self.snr.to_le_bytes());
    }

    fn read_body(body: &[u8]) -> Result<Self, ConfigError> {
        let mut soc = [0; 8];
        soc.copy_from_slice(&body[11..19]);
        let state_of_charge = f64::from_le_bytes(soc);
        if !state_of_charge.is_finite() {
            return Err(ConfigError::InvalidField("state_of_charge"));
        }
        Ok(Self {
            hourly_count: le_u16(body, 0),
            daily_count: le_u16(body, 2),
            last_count_time: Timestamp::from_secs(le_u32(body, 4)),
            message_count: body[8],
            success_count: body[9],
            internal_temp_c: body[10] as i8,
            state_of_charge,
            battery_state: BatteryState::from_raw(body[19]),
            rssi: le_u16(body, 20) as i16,
            snr: le_u16(body, 22) as i16,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        Ok(CountersState::validate(self)?)
    }
}

/// Serialize both records into a full storage image, as written by the
/// provisioning tool.
pub fn serialize_image(
    system: &SystemState,
    counters: &CountersState,
) -> Result<[u8; STORAGE_SIZE], ConfigError> {
    let mut image = [0; STORAGE_SIZE];
    serialize(system, &mut image[SYSTEM_RECORD_OFFSET..])?;
    serialize(counters, &mut image[COUNTERS_RECORD_OFFSET..])?;
    Ok(image)
}

/// Provisioning values and timing tunables of a node.
#[derive(PartialEq, Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NodeConfig {
    /// Magic number shared by the gateway and all nodes of a deployment
    pub magic_number: u16,
    /// Kind of sensor attached to the node
    pub sensor_type: SensorType,
    /// Hardware id (24 ASCII characters)
    pub device_id: DeviceIdentity,
    /// How long to listen for an acknowledgement after a send
    pub listen_window_seconds: u32,
    /// Consecutive send failures before the radio is considered locked up
    pub max_retries: u8,
    /// Upper bound of the random delay before a resend
    pub retry_jitter_seconds: u32,
    /// Base offset of the exponential back-off
    pub backoff_base_seconds: u32,
    /// Per node offset to the reporting boundary
    pub node_stagger_seconds: u32,
    /// Sensor wakes this close before a report is due go straight to the report
    pub guard_window_seconds: u32,
    /// Sleep duration while the wall clock is not valid
    pub clock_invalid_retry_seconds: u32,
    /// Time for in-flight I/O to settle before a power-cycle
    pub fatal_dwell_seconds: u32,
    /// Coalescing delay of storage writes
    pub save_delay_ms: u32,
    /// Receive polling interval while listening
    pub listen_poll_ms: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            magic_number: DEFAULT_MAGIC_NUMBER,
            sensor_type: SensorType::Pressure,
            device_id: DeviceIdentity::default(),
            listen_window_seconds: 5,
            max_retries: 3,
            retry_jitter_seconds: 20,
            backoff_base_seconds: 30,
            node_stagger_seconds: 10,
            guard_window_seconds: 2,
            clock_invalid_retry_seconds: 60,
            fatal_dwell_seconds: 30,
            save_delay_ms: 100,
            listen_poll_ms: 10,
        }
    }
}

impl NodeConfig {
    /// Check the tunables for values that would stall the node.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidField("max_retries"));
        }
        if self.listen_window_seconds == 0 {
            return Err(ConfigError::InvalidField("listen_window_seconds"));
        }
        if self.listen_poll_ms == 0 {
            return Err(ConfigError::InvalidField("listen_poll_ms"));
        }
        if self.clock_invalid_retry_seconds == 0 {
            return Err(ConfigError::InvalidField("clock_invalid_retry_seconds"));
        }
        Ok(())
    }

    /// Factory default system state of this node.
    pub fn factory_system_state(&self) -> SystemState {
        SystemState::factory_defaults(self.magic_number, self.sensor_type)
    }
}
