//! Health measurements sent with every data report.

use lora_counter_common::{BatteryState, CountersState};

#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Measurements {
    /// Enclosure temperature
    pub internal_temp_c: i8,
    /// Battery state of charge in percent
    pub state_of_charge: f64,
    pub battery_state: BatteryState,
}

impl Measurements {
    pub fn apply(&self, counters: &mut CountersState) {
        counters.internal_temp_c = self.internal_temp_c;
        counters.state_of_charge = self.state_of_charge;
        counters.battery_state = self.battery_state;
    }
}

/// Enclosure temperature sensor and fuel gauge.
pub trait Sensors {
    fn measure(&mut self) -> Measurements;
}

/// TMP36 analog temperature sensor on a 12 bit ADC.
pub struct Tmp36;

impl Tmp36 {
    /// Convert the raw ADC value to degrees Celsius.
    ///
    /// The sensor outputs 500 mV at 0 °C and 10 mV/°C.
    pub fn celsius_from_raw(raw: u16) -> f32 {
        const SUPPLY_MILLIVOLTS: f32 = 3300.0;
        const ADC_MAX: f32 = 4095.0;
        let millivolts = (raw as f32) / ADC_MAX * SUPPLY_MILLIVOLTS;
        (millivolts - 500.0) / 10.0
    }

    /// Like `celsius_from_raw`, rounded to whole degrees.
    pub fn celsius_i8_from_raw(raw: u16) -> i8 {
        let celsius = Self::celsius_from_raw(raw);
        let rounded = if celsius >= 0.0 {
            celsius + 0.5
        } else {
            celsius - 0.5
        };
        // Saturating cast
        rounded as i8
    }
}
