//! Hardware seams of the node.
//!
//! The session core never touches registers. Radio, wall clock, power
//! management and the byte addressable state memory are reached through the
//! traits in this module, the board support crate implements them.

use core::fmt;

use lora_counter_common::Timestamp;

/// Millisecond tick of the uptime timer.
pub type Instant = fugit::TimerInstantU32<1000>;
pub type Duration = fugit::MillisDurationU32;

pub use fugit::{ExtU32, SecsDurationU32};

/// Why the radio driver could not deliver a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The mesh layer knows no route to the destination
    NoRoute,
    /// The next hop did not acknowledge
    Unreachable,
    Unknown,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute => write!(f, "no route"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Unknown => write!(f, "unknown error"),
        }
    }
}

/// The radio did not come up after an init or reinit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RadioError;

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "radio not responding")
    }
}

/// Metadata of a frame received into the caller's buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    pub source: u8,
    /// Message kind header flag
    pub kind: u8,
    pub hops: u8,
}

/// Radio driver and mesh layer.
pub trait Radio {
    /// Send one frame. Blocks at most for the driver's own timeout.
    fn send(&mut self, frame: &[u8], destination: u8, kind: u8) -> Result<(), SendError>;

    /// Non-blocking receive check.
    fn try_receive(&mut self, buf: &mut [u8]) -> Option<Received>;

    fn sleep_radio(&mut self);

    fn wake_radio(&mut self);

    /// Bring the radio up, used at boot and to recover from a lock-up.
    fn reinit_radio(&mut self) -> Result<(), RadioError>;

    /// Own address in the mesh.
    fn set_address(&mut self, address: u8);

    /// Signal strength of the last received frame in dBm.
    fn last_rssi(&self) -> i16;

    /// Signal to noise ratio of the last received frame in dB.
    fn last_snr(&self) -> i16;
}

/// Real time clock and uptime timer.
pub trait Clock {
    /// Wall clock time, `None` while the clock is not valid.
    fn now(&self) -> Option<Timestamp>;

    /// Set the wall clock. Only ever called with gateway time.
    fn set_time(&mut self, time: Timestamp);

    /// Monotonic time since boot.
    fn uptime(&self) -> Instant;
}

pub trait Power {
    /// Deep sleep until the duration elapsed or an interrupt fired.
    fn sleep(&mut self, duration: SecsDurationU32);

    /// Cut power to the node. The watchdog chip wakes it up again.
    fn power_cycle(&mut self);
}

/// Byte addressable non-volatile memory.
pub trait ByteStorage {
    type Error: fmt::Debug;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error>;

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error>;
}

/// Devices the session drives. The byte storage is owned by the persistent
/// store instead.
pub struct Peripherals<R, C, P, D, M> {
    pub radio: R,
    pub clock: C,
    pub power: P,
    /// Blocking delay provider
    pub delay: D,
    pub sensors: M,
}
