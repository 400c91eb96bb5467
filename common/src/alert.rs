//! Alert codes.
//!
//! An alert code is a durable directive that routes the node into its error
//! handling. It is set locally (radio trouble, missing configuration) or
//! remotely by the gateway through an acknowledgement. On the wire and in
//! persistent storage it stays a raw `u8`; this table is the only place where
//! the numbers are interpreted.

use core::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlertCode {
    /// No alert pending (0)
    None,
    /// The node has no node number yet and must join (1)
    Unconfigured,
    /// The wall clock is not valid, re-join to get the time (2)
    ClockInvalid,
    /// Unrecoverable in software, power-cycle the node (3)
    FatalReset,
    /// The radio stopped responding and needs a reinit (4)
    RadioReinit,
    /// Gateway directive: return to factory defaults (5)
    FactoryReset,
    /// Gateway directive: zero the counters only (6)
    CountersReset,
    /// A code this firmware does not know about
    Unknown(u8),
}

impl AlertCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Unconfigured,
            2 => Self::ClockInvalid,
            3 => Self::FatalReset,
            4 => Self::RadioReinit,
            5 => Self::FactoryReset,
            6 => Self::CountersReset,
            other => Self::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Unconfigured => 1,
            Self::ClockInvalid => 2,
            Self::FatalReset => 3,
            Self::RadioReinit => 4,
            Self::FactoryReset => 5,
            Self::CountersReset => 6,
            Self::Unknown(other) => other,
        }
    }

    /// Whether an alert is pending.
    pub fn is_set(self) -> bool {
        self != Self::None
    }

    /// Whether this alert is resolved by sending a join request.
    pub fn needs_join(self) -> bool {
        matches!(self, Self::Unconfigured | Self::ClockInvalid)
    }
}

impl Default for AlertCode {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for AlertCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Unconfigured => write!(f, "unconfigured (1)"),
            Self::ClockInvalid => write!(f, "clock not valid (2)"),
            Self::FatalReset => write!(f, "power-cycle (3)"),
            Self::RadioReinit => write!(f, "reinitialize radio (4)"),
            Self::FactoryReset => write!(f, "factory reset (5)"),
            Self::CountersReset => write!(f, "counters reset (6)"),
            Self::Unknown(v) => write!(f, "unknown ({})", v),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for AlertCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_raw())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for AlertCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <u8 as serde::Deserialize>::deserialize(deserializer).map(Self::from_raw)
    }
}
