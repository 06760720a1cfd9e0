use serde::Serialize;
use thiserror::Error;

use crate::types::{OperatingState, TemperatureReading};

pub trait TemperatureSource {
    fn read(&mut self) -> TemperatureReading;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThermocoupleFault {
    #[error("open circuit (no thermocouple connected)")]
    OpenCircuit,
    #[error("thermocouple shorted to GND")]
    ShortToGround,
    #[error("thermocouple shorted to VCC")]
    ShortToVcc,
    #[error("fault bit set with unknown cause (0x{0:02x})")]
    Unknown(u8),
}

const MAX31855_FAULT_BIT: u32 = 1 << 16;
const MAX31855_TC_LSB_C: f32 = 0.25;
const MAX31855_CJ_LSB_C: f32 = 0.0625;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Max31855Frame {
    pub thermocouple_c: f32,
    pub cold_junction_c: f32,
}

impl Max31855Frame {
    pub fn reading(&self) -> TemperatureReading {
        TemperatureReading::from_celsius(self.thermocouple_c)
    }
}

/// Decode a raw 32-bit MAX31855 word (MSB first on the wire).
///
/// Bits 31..18 hold the signed 14-bit thermocouple temperature, bit 16 is
/// the fault flag, bits 15..4 the signed 12-bit cold-junction temperature
/// and bits 2..0 the fault cause. When several cause bits are set the
/// lowest one is reported.
pub fn decode_max31855(raw: u32) -> Result<Max31855Frame, ThermocoupleFault> {
    if raw & MAX31855_FAULT_BIT != 0 {
        let cause = (raw & 0x07) as u8;
        return Err(if cause & 0x01 != 0 {
            ThermocoupleFault::OpenCircuit
        } else if cause & 0x02 != 0 {
            ThermocoupleFault::ShortToGround
        } else if cause & 0x04 != 0 {
            ThermocoupleFault::ShortToVcc
        } else {
            ThermocoupleFault::Unknown(cause)
        });
    }

    let tc_raw = sign_extend((raw >> 18) & 0x3FFF, 14);
    let cj_raw = sign_extend((raw >> 4) & 0x0FFF, 12);

    Ok(Max31855Frame {
        thermocouple_c: tc_raw as f32 * MAX31855_TC_LSB_C,
        cold_junction_c: cj_raw as f32 * MAX31855_CJ_LSB_C,
    })
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

pub const ROOM_TEMP_F: f32 = 70.0;
const HEATING_RATE_F_PER_SEC: f32 = 2.0;
const COOLING_COEFF_PER_SEC: f32 = 0.02;
const TARGET_OVERSHOOT_F: f32 = 10.0;
const MODEL_MIN_F: f32 = ROOM_TEMP_F - 10.0;
const MODEL_MAX_F: f32 = 400.0;

#[derive(Debug, Clone)]
pub struct ThermalModel {
    temperature_f: f32,
    fault_injected: bool,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self::new(ROOM_TEMP_F)
    }
}

impl ThermalModel {
    pub fn new(initial_f: f32) -> Self {
        Self {
            temperature_f: initial_f,
            fault_injected: false,
        }
    }

    pub fn target_f(state: OperatingState) -> f32 {
        match state {
            OperatingState::Off => ROOM_TEMP_F,
            OperatingState::Warm => 150.0,
            OperatingState::Low => 200.0,
            OperatingState::High => 300.0,
        }
    }

    pub fn temperature_f(&self) -> f32 {
        self.temperature_f
    }

    pub fn inject_fault(&mut self, fault: bool) {
        self.fault_injected = fault;
    }

    pub fn fault_injected(&self) -> bool {
        self.fault_injected
    }

    // Advance the model by `dt_secs` and sample it. The pot keeps evolving
    // while the sensor is faulted; only the sample is lost.
    pub fn step(&mut self, state: OperatingState, relay_on: bool, dt_secs: f32) -> TemperatureReading {
        let target = Self::target_f(state);

        if relay_on && self.temperature_f < target {
            self.temperature_f = (self.temperature_f + HEATING_RATE_F_PER_SEC * dt_secs)
                .min(target + TARGET_OVERSHOOT_F);
        } else {
            let diff = self.temperature_f - ROOM_TEMP_F;
            self.temperature_f -= diff * COOLING_COEFF_PER_SEC * dt_secs;
        }
        self.temperature_f = self.temperature_f.clamp(MODEL_MIN_F, MODEL_MAX_F);

        if self.fault_injected {
            TemperatureReading::invalid()
        } else {
            TemperatureReading::from_fahrenheit(self.temperature_f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tc_quarter_degrees: i32, cj_sixteenths: i32) -> u32 {
        let tc = (tc_quarter_degrees as u32 & 0x3FFF) << 18;
        let cj = (cj_sixteenths as u32 & 0x0FFF) << 4;
        tc | cj
    }

    #[test]
    fn decodes_positive_temperatures() {
        // 100.25 C thermocouple, 25.0625 C cold junction.
        let decoded = decode_max31855(frame(401, 401)).unwrap();
        assert_eq!(decoded.thermocouple_c, 100.25);
        assert_eq!(decoded.cold_junction_c, 25.0625);

        let reading = decoded.reading();
        assert!(reading.valid);
        assert!((reading.temperature_f - 212.45).abs() < 1e-3);
    }

    #[test]
    fn sign_extends_negative_temperatures() {
        let decoded = decode_max31855(frame(-1, -16)).unwrap();
        assert_eq!(decoded.thermocouple_c, -0.25);
        assert_eq!(decoded.cold_junction_c, -1.0);

        let decoded = decode_max31855(0xFFFC_0000).unwrap();
        assert_eq!(decoded.thermocouple_c, -0.25);
    }

    #[test]
    fn reports_fault_causes() {
        assert_eq!(
            decode_max31855(0x0001_0001),
            Err(ThermocoupleFault::OpenCircuit)
        );
        assert_eq!(
            decode_max31855(0x0001_0002),
            Err(ThermocoupleFault::ShortToGround)
        );
        assert_eq!(
            decode_max31855(0x0001_0004),
            Err(ThermocoupleFault::ShortToVcc)
        );
        assert_eq!(
            decode_max31855(0x0001_0000),
            Err(ThermocoupleFault::Unknown(0))
        );
    }

    #[test]
    fn model_heats_toward_target_and_caps_overshoot() {
        let mut model = ThermalModel::new(195.0);
        let mut reading = TemperatureReading::invalid();
        for _ in 0..20 {
            reading = model.step(OperatingState::Low, true, 1.0);
        }
        assert!(reading.valid);
        assert!((195.0..=210.0).contains(&reading.temperature_f));
    }

    #[test]
    fn model_cools_toward_room_when_relay_open() {
        let mut model = ThermalModel::new(170.0);
        let reading = model.step(OperatingState::Off, false, 1.0);
        assert!((reading.temperature_f - 168.0).abs() < 1e-3);
    }

    #[test]
    fn injected_fault_invalidates_samples() {
        let mut model = ThermalModel::new(170.0);
        model.inject_fault(true);
        assert!(model.fault_injected());
        assert!(!model.step(OperatingState::Off, false, 1.0).valid);
        assert!((model.temperature_f() - 168.0).abs() < 1e-3);

        model.inject_fault(false);
        assert!(!model.fault_injected());
        assert!(model.step(OperatingState::Off, false, 1.0).valid);
    }
}
