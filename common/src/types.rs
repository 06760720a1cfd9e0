use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const UNKNOWN_STATE: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingState {
    #[default]
    Off,
    Warm,
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized crockpot state `{0}`")]
pub struct ParseStateError(pub String);

impl OperatingState {
    pub const ALL: [OperatingState; 4] = [Self::Off, Self::Warm, Self::Low, Self::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Warm => "WARM",
            Self::Low => "LOW",
            Self::High => "HIGH",
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Warm => 1,
            Self::Low => 2,
            Self::High => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Off),
            1 => Some(Self::Warm),
            2 => Some(Self::Low),
            3 => Some(Self::High),
            _ => None,
        }
    }

    pub fn is_heating(self) -> bool {
        self != Self::Off
    }

    pub fn step_up(self) -> Self {
        Self::from_index(self.index() + 1).unwrap_or(Self::High)
    }

    pub fn step_down(self) -> Self {
        self.index()
            .checked_sub(1)
            .and_then(Self::from_index)
            .unwrap_or(Self::Off)
    }
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingState {
    type Err = ParseStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| ParseStateError(value.to_string()))
    }
}

pub fn state_to_string(state: OperatingState) -> &'static str {
    state.as_str()
}

pub fn raw_state_to_string(raw: u8) -> &'static str {
    OperatingState::from_index(raw)
        .map(OperatingState::as_str)
        .unwrap_or(UNKNOWN_STATE)
}

pub fn string_to_state(value: &str) -> Option<OperatingState> {
    value.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TemperatureReading {
    pub temperature_f: f32,
    pub temperature_c: f32,
    pub valid: bool,
}

impl TemperatureReading {
    pub fn from_celsius(temperature_c: f32) -> Self {
        Self {
            temperature_f: celsius_to_fahrenheit(temperature_c),
            temperature_c,
            valid: true,
        }
    }

    pub fn from_fahrenheit(temperature_f: f32) -> Self {
        Self {
            temperature_f,
            temperature_c: fahrenheit_to_celsius(temperature_f),
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self::default()
    }
}

pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(fahrenheit: f32) -> f32 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Shared status aggregate. While `sensor_error` is set, `temperature_f`
/// holds the last valid reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CrockpotStatus {
    pub state: OperatingState,
    pub temperature_f: f32,
    pub uptime_seconds: u32,
    pub wifi_connected: bool,
    pub sensor_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_unique() {
        let names: Vec<&str> = OperatingState::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["OFF", "WARM", "LOW", "HIGH"]);

        let mut deduped = names.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), names.len());
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(string_to_state("off"), Some(OperatingState::Off));
        assert_eq!(string_to_state("WARM"), Some(OperatingState::Warm));
        assert_eq!(string_to_state("Low"), Some(OperatingState::Low));
        assert_eq!(string_to_state("hIgH"), Some(OperatingState::High));
    }

    #[test]
    fn rejects_unknown_state_strings() {
        assert_eq!(string_to_state(""), None);
        assert_eq!(string_to_state("medium"), None);
        assert_eq!(string_to_state(" low"), None);
        assert_eq!(
            "boil".parse::<OperatingState>(),
            Err(ParseStateError("boil".to_string()))
        );
    }

    #[test]
    fn raw_values_outside_enum_are_unknown() {
        assert_eq!(raw_state_to_string(2), "LOW");
        assert_eq!(raw_state_to_string(4), UNKNOWN_STATE);
        assert_eq!(raw_state_to_string(u8::MAX), UNKNOWN_STATE);
    }

    #[test]
    fn stepping_saturates_at_ends() {
        assert_eq!(OperatingState::Off.step_up(), OperatingState::Warm);
        assert_eq!(OperatingState::High.step_up(), OperatingState::High);
        assert_eq!(OperatingState::Low.step_down(), OperatingState::Warm);
        assert_eq!(OperatingState::Off.step_down(), OperatingState::Off);
    }

    #[test]
    fn converts_between_units() {
        let boiling = TemperatureReading::from_celsius(100.0);
        assert!(boiling.valid);
        assert!((boiling.temperature_f - 212.0).abs() < 1e-3);
        assert!((fahrenheit_to_celsius(32.0)).abs() < 1e-6);
        assert!(!TemperatureReading::invalid().valid);
    }

    #[test]
    fn boot_status_is_off_and_zeroed() {
        let status = CrockpotStatus::default();
        assert_eq!(status.state, OperatingState::Off);
        assert_eq!(status.temperature_f, 0.0);
        assert_eq!(status.uptime_seconds, 0);
        assert!(!status.wifi_connected);
        assert!(!status.sensor_error);
    }
}
