//! Wake causes, handed from interrupt handlers to the main cycle.
//!
//! Interrupt handlers only ever set a bit. The main cycle takes all bits at
//! once, exactly once per pass.

use core::sync::atomic::{AtomicU8, Ordering};

use bitfield::Bit;

const SENSOR_BIT: usize = 0;
const BUTTON_BIT: usize = 1;

pub struct WakeFlags(AtomicU8);

impl WakeFlags {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Sensor edge. Safe to call from interrupt context.
    pub fn signal_sensor(&self) {
        self.0.fetch_or(1 << SENSOR_BIT, Ordering::Release);
    }

    /// User button. Safe to call from interrupt context.
    pub fn signal_button(&self) {
        self.0.fetch_or(1 << BUTTON_BIT, Ordering::Release);
    }

    /// Take and clear all pending causes.
    pub fn take(&self) -> WakeCause {
        let raw = self.0.swap(0, Ordering::Acquire);
        WakeCause {
            sensor: raw.bit(SENSOR_BIT),
            button: raw.bit(BUTTON_BIT),
        }
    }
}

impl Default for WakeFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WakeCause {
    pub sensor: bool,
    pub button: bool,
}

impl WakeCause {
    pub fn any(&self) -> bool {
        self.sensor || self.button
    }
}
