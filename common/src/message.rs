//! Node ↔ gateway messages.
//!
//! Every frame starts with the big endian magic number of the deployment.
//! The message kind is not part of the payload, it travels as the radio
//! header flag. A receiver checks the magic number before it looks at the
//! kind, frames of other deployments sharing the channel are dropped there.
//!
//! ## Frame Layouts
//!
//! ```text
//! DataReport   (17) | magic:2 | hourly:2 | daily:2 | sensor | temp | soc | batt | resets | msg | ok | rssi:2 | snr:2 |
//! DataAck      (12) | magic:2 | time:4 | freq:2 | alert | sensor | open | msg |
//! JoinRequest  (29) | magic:2 | checksum:2 | device id:24 | sensor |
//! JoinAck      (10) | magic:2 | time:4 | freq:2 | node | sensor |
//! AlertReport   (3) | magic:2 | alert |
//! AlertAck      (9) | magic:2 | time:4 | freq:2 | alert |
//! ```
//!
//! Multi-byte fields are big endian. Reports (node to gateway) must be
//! complete. Acknowledgements (gateway to node) may be cut short, missing
//! trailing fields decode as `None`.

use core::fmt;

use crate::alert::AlertCode;
use crate::crc::crc16;
use crate::state::{BatteryState, CountersState, SensorType, SystemState};
use crate::time::Timestamp;

pub const MAX_FRAME_LEN: usize = 32;
pub const DEVICE_ID_LEN: usize = 24;

pub const DATA_REPORT_LEN: usize = 17;
pub const DATA_ACK_LEN: usize = 12;
pub const JOIN_REQUEST_LEN: usize = 4 + DEVICE_ID_LEN + 1;
pub const JOIN_ACK_LEN: usize = 10;
pub const ALERT_REPORT_LEN: usize = 3;
pub const ALERT_ACK_LEN: usize = 9;

/// Message kind, sent as the radio header flag.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum MessageKind {
    JoinRequest = 1,
    JoinAck = 2,
    DataReport = 3,
    DataAck = 4,
    AlertReport = 5,
    AlertAck = 6,
}

impl MessageKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::JoinRequest),
            2 => Some(Self::JoinAck),
            3 => Some(Self::DataReport),
            4 => Some(Self::DataAck),
            5 => Some(Self::AlertReport),
            6 => Some(Self::AlertAck),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u8 {
        self as u8
    }

    /// Full length of a frame of this kind.
    pub fn frame_len(self) -> usize {
        match self {
            Self::JoinRequest => JOIN_REQUEST_LEN,
            Self::JoinAck => JOIN_ACK_LEN,
            Self::DataReport => DATA_REPORT_LEN,
            Self::DataAck => DATA_ACK_LEN,
            Self::AlertReport => ALERT_REPORT_LEN,
            Self::AlertAck => ALERT_ACK_LEN,
        }
    }

    /// The acknowledgement the gateway answers a report with.
    pub fn acknowledgement(self) -> Option<Self> {
        match self {
            Self::JoinRequest => Some(Self::JoinAck),
            Self::DataReport => Some(Self::DataAck),
            Self::AlertReport => Some(Self::AlertAck),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::JoinRequest => "Join Req",
            Self::JoinAck => "Join Ack",
            Self::DataReport => "Data Report",
            Self::DataAck => "Data Ack",
            Self::AlertReport => "Alert Rpt",
            Self::AlertAck => "Alert Ack",
        };
        f.write_str(name)
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum DecodeError {
    /// The frame belongs to another deployment.
    MagicMismatch { expected: u16, found: u16 },
    /// The radio flag is not a known message kind.
    UnknownKind(u8),
    /// A report is shorter than its layout.
    TooShort { expected: usize, found: usize },
    /// The join request checksum does not match the device id.
    ChecksumMismatch,
    /// A field holds a value outside of its domain.
    InvalidField(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MagicMismatch { expected, found } => {
                write!(f, "Wrong magic number (expected {}, found {})", expected, found)
            }
            Self::UnknownKind(k) => write!(f, "Unknown message kind ({})", k),
            Self::TooShort { expected, found } => {
                write!(f, "Frame too short ({} of {} bytes)", found, expected)
            }
            Self::ChecksumMismatch => write!(f, "Device id checksum mismatch"),
            Self::InvalidField(name) => write!(f, "Invalid value in field {}", name),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum EncodeError {
    /// Acknowledgements are built from gateway data, not from node state.
    NotANodeMessage(MessageKind),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotANodeMessage(kind) => write!(f, "{} is not sent by a node", kind),
        }
    }
}

/// Globally unique hardware id of a node (24 ASCII characters).
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct DeviceIdentity(pub [u8; DEVICE_ID_LEN]);

impl DeviceIdentity {
    /// Returns `None` unless `id` is exactly 24 ASCII characters.
    pub fn from_ascii(id: &str) -> Option<Self> {
        if id.len() != DEVICE_ID_LEN || !id.is_ascii() {
            return None;
        }
        let mut bytes = [0; DEVICE_ID_LEN];
        bytes.copy_from_slice(id.as_bytes());
        Some(Self(bytes))
    }

    /// Reduce the id to the 16 bit checksum sent in a join request.
    pub fn checksum(&self) -> u16 {
        crc16(&self.0)
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self([b'0'; DEVICE_ID_LEN])
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceIdentity({})", self)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for DeviceIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdentityVisitor;

        impl<'de> serde::de::Visitor<'de> for IdentityVisitor {
            type Value = DeviceIdentity;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a device id of {} ASCII characters", DEVICE_ID_LEN)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                DeviceIdentity::from_ascii(v).ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_str(IdentityVisitor)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DeviceIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match core::str::from_utf8(&self.0) {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => Err(serde::ser::Error::custom("device id is not ASCII")),
        }
    }
}

/// Periodic count report.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct DataReport {
    pub hourly_count: u16,
    pub daily_count: u16,
    pub sensor_type: SensorType,
    pub internal_temp_c: i8,
    /// State of charge in whole percent
    pub state_of_charge: u8,
    pub battery_state: BatteryState,
    pub reset_count: u8,
    pub message_count: u8,
    pub success_count: u8,
    pub rssi: i16,
    pub snr: i16,
}

impl DataReport {
    pub fn from_state(system: &SystemState, counters: &CountersState) -> Self {
        Self {
            hourly_count: counters.hourly_count,
            daily_count: counters.daily_count,
            sensor_type: system.sensor_type,
            internal_temp_c: counters.internal_temp_c,
            state_of_charge: counters.state_of_charge.clamp(0.0, 100.0) as u8,
            battery_state: counters.battery_state,
            reset_count: system.reset_count,
            message_count: counters.message_count,
            success_count: counters.success_count,
            rssi: counters.rssi,
            snr: counters.snr,
        }
    }
}

/// Gateway answer to a `DataReport`.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub struct DataAck {
    pub timestamp: Option<Timestamp>,
    pub frequency_minutes: Option<u16>,
    pub alert_code: Option<AlertCode>,
    pub sensor_type: Option<SensorType>,
    pub open_hours: Option<bool>,
    /// Message count of the acknowledged report
    pub message_count: Option<u8>,
}

/// Request for a node number, sent by unconfigured nodes.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct JoinRequest {
    pub identity: DeviceIdentity,
    pub sensor_type: SensorType,
}

/// Gateway answer to a `JoinRequest`.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub struct JoinAck {
    pub timestamp: Option<Timestamp>,
    pub frequency_minutes: Option<u16>,
    pub node_number: Option<u8>,
    pub sensor_type: Option<SensorType>,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct AlertReport {
    pub alert_code: AlertCode,
}

/// Gateway answer to an `AlertReport`.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub struct AlertAck {
    pub timestamp: Option<Timestamp>,
    pub frequency_minutes: Option<u16>,
    /// The alert code the gateway took note of
    pub alert_code: Option<AlertCode>,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Message {
    JoinRequest(JoinRequest),
    JoinAck(JoinAck),
    DataReport(DataReport),
    DataAck(DataAck),
    AlertReport(AlertReport),
    AlertAck(AlertAck),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::JoinRequest(_) => MessageKind::JoinRequest,
            Self::JoinAck(_) => MessageKind::JoinAck,
            Self::DataReport(_) => MessageKind::DataReport,
            Self::DataAck(_) => MessageKind::DataAck,
            Self::AlertReport(_) => MessageKind::AlertReport,
            Self::AlertAck(_) => MessageKind::AlertAck,
        }
    }

    /// Timestamp and reporting cadence carried by every acknowledgement.
    pub fn time_and_frequency(&self) -> (Option<Timestamp>, Option<u16>) {
        match self {
            Self::JoinAck(ack) => (ack.timestamp, ack.frequency_minutes),
            Self::DataAck(ack) => (ack.timestamp, ack.frequency_minutes),
            Self::AlertAck(ack) => (ack.timestamp, ack.frequency_minutes),
            _ => (None, None),
        }
    }
}

/// An encoded frame, ready to be handed to the radio.
#[derive(Clone)]
pub struct Frame {
    kind: MessageKind,
    data: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Frame {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({}, {:02x?})", self.kind, self.as_bytes())
    }
}

/// The encoder appends big endian fields to a frame buffer.
///
/// It keeps track of the offset and returns the finished frame with its
/// length.
struct Encoder {
    data: [u8; MAX_FRAME_LEN],
    index: usize,
}

impl Encoder {
    fn new(magic: u16) -> Self {
        let mut encoder = Self {
            data: [0; MAX_FRAME_LEN],
            index: 0,
        };
        encoder.u16(magic);
        encoder
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.data[self.index..self.index + bytes.len()].copy_from_slice(bytes);
        self.index += bytes.len();
    }

    fn u8(&mut self, value: u8) {
        self.bytes(&[value]);
    }

    fn i8(&mut self, value: i8) {
        self.bytes(&value.to_be_bytes());
    }

    fn u16(&mut self, value: u16) {
        self.bytes(&value.to_be_bytes());
    }

    fn i16(&mut self, value: i16) {
        self.bytes(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_be_bytes());
    }

    fn finish(self, kind: MessageKind) -> Frame {
        Frame {
            kind,
            data: self.data,
            len: self.index,
        }
    }
}

/// Reads big endian fields from a received frame.
///
/// Once a field runs past the end of the data, the decoder is exhausted and
/// every following field reads as `None`.
struct Decoder<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        match self.data.get(self.index..self.index + N) {
            Some(slice) => {
                let mut out = [0; N];
                out.copy_from_slice(slice);
                self.index += N;
                Some(out)
            }
            None => {
                self.index = self.data.len();
                None
            }
        }
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    fn i8(&mut self) -> Option<i8> {
        self.array().map(i8::from_be_bytes)
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn i16(&mut self) -> Option<i16> {
        self.array().map(i16::from_be_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }
}

impl DataReport {
    fn write(&self, encoder: &mut Encoder) {
        encoder.u16(self.hourly_count);
        encoder.u16(self.daily_count);
        encoder.u8(self.sensor_type as u8);
        encoder.i8(self.internal_temp_c);
        encoder.u8(self.state_of_charge);
        encoder.u8(self.battery_state as u8);
        encoder.u8(self.reset_count);
        encoder.u8(self.message_count);
        encoder.u8(self.success_count);
        encoder.i16(self.rssi);
        encoder.i16(self.snr);
    }

    fn read(decoder: &mut Decoder) -> Option<Result<Self, DecodeError>> {
        let hourly_count = decoder.u16()?;
        let daily_count = decoder.u16()?;
        let sensor_type = decoder.u8()?;
        let internal_temp_c = decoder.i8()?;
        let state_of_charge = decoder.u8()?;
        let battery_state = BatteryState::from_raw(decoder.u8()?);
        let reset_count = decoder.u8()?;
        let message_count = decoder.u8()?;
        let success_count = decoder.u8()?;
        let rssi = decoder.i16()?;
        let snr = decoder.i16()?;
        let sensor_type = match SensorType::from_raw(sensor_type) {
            Some(t) => t,
            None => return Some(Err(DecodeError::InvalidField("sensor_type"))),
        };
        Some(Ok(Self {
            hourly_count,
            daily_count,
            sensor_type,
            internal_temp_c,
            state_of_charge,
            battery_state,
            reset_count,
            message_count,
            success_count,
            rssi,
            snr,
        }))
    }
}

impl JoinRequest {
    fn write(&self, encoder: &mut Encoder) {
        encoder.u16(self.identity.checksum());
        encoder.bytes(&self.identity.0);
        encoder.u8(self.sensor_type as u8);
    }

    fn read(decoder: &mut Decoder) -> Option<Result<Self, DecodeError>> {
        let checksum = decoder.u16()?;
        let identity = DeviceIdentity(decoder.array()?);
        let sensor_type = decoder.u8()?;
        if identity.checksum() != checksum {
            return Some(Err(DecodeError::ChecksumMismatch));
        }
        Some(
            SensorType::from_raw(sensor_type)
                .map(|sensor_type| Self {
                    identity,
                    sensor_type,
                })
                .ok_or(DecodeError::InvalidField("sensor_type")),
        )
    }
}

impl AlertReport {
    fn write(&self, encoder: &mut Encoder) {
        encoder.u8(self.alert_code.to_raw());
    }

    fn read(decoder: &mut Decoder) -> Option<Result<Self, DecodeError>> {
        let alert_code = AlertCode::from_raw(decoder.u8()?);
        Some(Ok(Self { alert_code }))
    }
}

// Acknowledgement writers stop at the first field that is not present.

impl DataAck {
    fn write(&self, encoder: &mut Encoder) -> Option<()> {
        encoder.u32(self.timestamp?.as_secs());
        encoder.u16(self.frequency_minutes?);
        encoder.u8(self.alert_code?.to_raw());
        encoder.u8(self.sensor_type? as u8);
        encoder.u8(self.open_hours? as u8);
        encoder.u8(self.message_count?);
        Some(())
    }

    fn read(decoder: &mut Decoder) -> Self {
        Self {
            timestamp: decoder.u32().map(Timestamp::from_secs),
            frequency_minutes: decoder.u16(),
            alert_code: decoder.u8().map(AlertCode::from_raw),
            sensor_type: decoder.u8().and_then(SensorType::from_raw),
            open_hours: decoder.u8().map(|v| v != 0),
            message_count: decoder.u8(),
        }
    }
}

impl JoinAck {
    fn write(&self, encoder: &mut Encoder) -> Option<()> {
        encoder.u32(self.timestamp?.as_secs());
        encoder.u16(self.frequency_minutes?);
        encoder.u8(self.node_number?);
        encoder.u8(self.sensor_type? as u8);
        Some(())
    }

    fn read(decoder: &mut Decoder) -> Self {
        Self {
            timestamp: decoder.u32().map(Timestamp::from_secs),
            frequency_minutes: decoder.u16(),
            node_number: decoder.u8(),
            sensor_type: decoder.u8().and_then(SensorType::from_raw),
        }
    }
}

impl AlertAck {
    fn write(&self, encoder: &mut Encoder) -> Option<()> {
        encoder.u32(self.timestamp?.as_secs());
        encoder.u16(self.frequency_minutes?);
        encoder.u8(self.alert_code?.to_raw());
        Some(())
    }

    fn read(decoder: &mut Decoder) -> Self {
        Self {
            timestamp: decoder.u32().map(Timestamp::from_secs),
            frequency_minutes: decoder.u16(),
            alert_code: decoder.u8().map(AlertCode::from_raw),
        }
    }
}

/// Encoder and decoder bound to the magic number of one deployment.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct Codec {
    magic: u16,
}

impl Codec {
    pub const fn new(magic: u16) -> Self {
        Self { magic }
    }

    pub fn magic(&self) -> u16 {
        self.magic
    }

    /// Build the frame a node sends for `kind` from its durable state.
    pub fn encode(
        &self,
        kind: MessageKind,
        system: &SystemState,
        counters: &CountersState,
        identity: &DeviceIdentity,
    ) -> Result<Frame, EncodeError> {
        let message = match kind {
            MessageKind::DataReport => Message::DataReport(DataReport::from_state(system, counters)),
            MessageKind::JoinRequest => Message::JoinRequest(JoinRequest {
                identity: *identity,
                sensor_type: system.sensor_type,
            }),
            MessageKind::AlertReport => Message::AlertReport(AlertReport {
                alert_code: system.alert_code,
            }),
            other => return Err(EncodeError::NotANodeMessage(other)),
        };
        Ok(self.encode_message(&message))
    }

    pub fn encode_message(&self, message: &Message) -> Frame {
        let mut encoder = Encoder::new(self.magic);
        match message {
            Message::DataReport(m) => m.write(&mut encoder),
            Message::JoinRequest(m) => m.write(&mut encoder),
            Message::AlertReport(m) => m.write(&mut encoder),
            Message::DataAck(m) => {
                let _ = m.write(&mut encoder);
            }
            Message::JoinAck(m) => {
                let _ = m.write(&mut encoder);
            }
            Message::AlertAck(m) => {
                let _ = m.write(&mut encoder);
            }
        }
        encoder.finish(message.kind())
    }

    /// Decode a received frame.
    ///
    /// The magic number is checked first. Nothing else of a foreign frame is
    /// looked at, not even the kind flag.
    pub fn decode(&self, kind: u8, data: &[u8]) -> Result<Message, DecodeError> {
        let mut decoder = Decoder::new(data);
        let found = decoder.u16().ok_or(DecodeError::TooShort {
            expected: 2,
            found: data.len(),
        })?;
        if found != self.magic {
            return Err(DecodeError::MagicMismatch {
                expected: self.magic,
                found,
            });
        }

        let kind = MessageKind::from_raw(kind).ok_or(DecodeError::UnknownKind(kind))?;
        let too_short = DecodeError::TooShort {
            expected: kind.frame_len(),
            found: data.len(),
        };
        match kind {
            MessageKind::DataReport => DataReport::read(&mut decoder)
                .ok_or(too_short)?
                .map(Message::DataReport),
            MessageKind::JoinRequest => JoinRequest::read(&mut decoder)
                .ok_or(too_short)?
                .map(Message::JoinRequest),
            MessageKind::AlertReport => AlertReport::read(&mut decoder)
                .ok_or(too_short)?
                .map(Message::AlertReport),
            MessageKind::DataAck => Ok(Message::DataAck(DataAck::read(&mut decoder))),
            MessageKind::JoinAck => Ok(Message::JoinAck(JoinAck::read(&mut decoder))),
            MessageKind::AlertAck => Ok(Message::AlertAck(AlertAck::read(&mut decoder))),
        }
    }
}
