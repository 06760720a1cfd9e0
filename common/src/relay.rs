use std::fmt;

use log::{error, info};
use serde::Serialize;
use thiserror::Error;

use crate::types::OperatingState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invalid relay channel: {0}")]
    InvalidChannel(usize),
    #[error("relay {channel} output failed: {message}")]
    Pin {
        channel: RelayChannel,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayChannel {
    Main,
}

impl RelayChannel {
    pub const COUNT: usize = 1;
    pub const ALL: [RelayChannel; Self::COUNT] = [Self::Main];

    pub fn index(self) -> usize {
        match self {
            Self::Main => 0,
        }
    }

    pub fn from_index(index: usize) -> Result<Self, RelayError> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or(RelayError::InvalidChannel(index))
    }
}

impl fmt::Display for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("MAIN"),
        }
    }
}

pub fn relay_level_for(state: OperatingState) -> bool {
    match state {
        OperatingState::Off => false,
        OperatingState::Warm | OperatingState::Low | OperatingState::High => true,
    }
}

pub trait RelayPin {
    type Error: fmt::Display;

    fn set_level(&mut self, high: bool) -> Result<(), Self::Error>;
}

pub trait RelayActuator {
    fn apply_state(&mut self, state: OperatingState) -> Result<(), RelayError>;

    fn all_off(&mut self) -> Result<(), RelayError>;

    fn is_on(&self, channel: RelayChannel) -> bool;
}

pub struct RelayBank<P> {
    pins: [P; RelayChannel::COUNT],
    states: [bool; RelayChannel::COUNT],
    active_high: bool,
}

impl<P: RelayPin> RelayBank<P> {
    pub fn new(pins: [P; RelayChannel::COUNT], active_high: bool) -> Result<Self, RelayError> {
        let mut bank = Self {
            pins,
            states: [false; RelayChannel::COUNT],
            active_high,
        };

        for channel in RelayChannel::ALL {
            bank.drive(channel, false)?;
            info!("relay {channel} configured, output off");
        }

        Ok(bank)
    }

    pub fn set(&mut self, channel: RelayChannel, on: bool) -> Result<(), RelayError> {
        self.drive(channel, on)?;
        info!("relay {channel} set to {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    pub fn set_index(&mut self, index: usize, on: bool) -> Result<(), RelayError> {
        let channel = RelayChannel::from_index(index).inspect_err(|err| error!("{err}"))?;
        self.set(channel, on)
    }

    pub fn get(&self, channel: RelayChannel) -> bool {
        self.states[channel.index()]
    }

    fn drive(&mut self, channel: RelayChannel, on: bool) -> Result<(), RelayError> {
        let level = if self.active_high { on } else { !on };
        self.pins[channel.index()]
            .set_level(level)
            .map_err(|err| RelayError::Pin {
                channel,
                message: err.to_string(),
            })?;
        self.states[channel.index()] = on;
        Ok(())
    }
}

impl<P: RelayPin> RelayActuator for RelayBank<P> {
    fn apply_state(&mut self, state: OperatingState) -> Result<(), RelayError> {
        info!("applying crockpot state: {state}");
        self.set(RelayChannel::Main, relay_level_for(state))
    }

    fn all_off(&mut self) -> Result<(), RelayError> {
        info!("turning all relays OFF");

        // Attempt every channel even if one fails; report the first failure.
        let mut first_err = None;
        for channel in RelayChannel::ALL {
            if let Err(err) = self.drive(channel, false) {
                error!("{err}");
                first_err.get_or_insert(err);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    fn is_on(&self, channel: RelayChannel) -> bool {
        self.get(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPin;
    use pretty_assertions::assert_eq;

    #[test]
    fn init_drives_outputs_off() {
        let pin = RecordingPin::default();
        let bank = RelayBank::new([pin.clone()], true).unwrap();
        assert_eq!(pin.levels(), vec![false]);
        assert!(!bank.get(RelayChannel::Main));

        let inverted = RecordingPin::default();
        let _ = RelayBank::new([inverted.clone()], false).unwrap();
        assert_eq!(inverted.levels(), vec![true]);
    }

    #[test]
    fn heating_states_close_main_relay() {
        for state in OperatingState::ALL {
            let pin = RecordingPin::default();
            let mut bank = RelayBank::new([pin.clone()], true).unwrap();
            bank.apply_state(state).unwrap();

            assert_eq!(bank.is_on(RelayChannel::Main), state.is_heating());
            assert_eq!(pin.last_level(), Some(state.is_heating()));
        }
    }

    #[test]
    fn active_low_inverts_levels() {
        let pin = RecordingPin::default();
        let mut bank = RelayBank::new([pin.clone()], false).unwrap();
        bank.apply_state(OperatingState::High).unwrap();

        assert!(bank.get(RelayChannel::Main));
        assert_eq!(pin.levels(), vec![true, false]);
    }

    #[test]
    fn failed_write_keeps_cached_state() {
        let pin = RecordingPin::default();
        let mut bank = RelayBank::new([pin.clone()], true).unwrap();
        pin.fail_writes(true);

        let err = bank.apply_state(OperatingState::Low).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Pin {
                channel: RelayChannel::Main,
                ..
            }
        ));
        assert!(!bank.get(RelayChannel::Main));
    }

    #[test]
    fn rejects_out_of_range_channel() {
        let pin = RecordingPin::default();
        let mut bank = RelayBank::new([pin.clone()], true).unwrap();

        assert_eq!(bank.set_index(1, true), Err(RelayError::InvalidChannel(1)));
        assert_eq!(pin.levels(), vec![false]);
        assert!(bank.set_index(0, true).is_ok());
        assert!(bank.get(RelayChannel::Main));
    }

    #[test]
    fn all_off_clears_every_channel() {
        let pin = RecordingPin::default();
        let mut bank = RelayBank::new([pin.clone()], true).unwrap();
        bank.set(RelayChannel::Main, true).unwrap();
        bank.all_off().unwrap();

        assert!(!bank.get(RelayChannel::Main));
        assert_eq!(pin.last_level(), Some(false));
    }
}
