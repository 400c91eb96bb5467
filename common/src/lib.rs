//! Types shared between the node firmware and the host tools: durable state,
//! alert codes, wall clock time and the radio message codec.
#![cfg_attr(not(test), no_std)]

pub mod alert;
pub mod crc;
pub mod message;
pub mod state;
pub mod time;

pub use alert::AlertCode;
pub use message::{Codec, DecodeError, DeviceIdentity, EncodeError, Frame, Message, MessageKind};
pub use state::{BatteryState, BoundsError, CountersState, SensorType, SystemState};
pub use time::Timestamp;
