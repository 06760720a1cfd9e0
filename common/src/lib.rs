pub mod commands;
pub mod config;
pub mod crockpot;
pub mod datalog;
pub mod lock;
pub mod program;
pub mod relay;
pub mod session;
pub mod telegram;
pub mod temperature;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use commands::{handle_command, status_line, BotCommand};
pub use config::{
    CrockpotConfig, DataLogConfig, NetworkConfig, RelayHardwareConfig, RuntimeConfig,
    SensorHardwareConfig,
};
pub use crockpot::{Connectivity, ControlError, Crockpot, CycleReport, SafetyShutoff, Supervisor};
pub use datalog::{DataLog, LogEntry, LogStats};
pub use program::{CookingProgram, ProgramError, ProgramEvent, ProgramLibrary, ProgramRunner, ProgramStep};
pub use relay::{RelayActuator, RelayBank, RelayChannel, RelayError, RelayPin};
pub use session::{CookSession, SessionError};
pub use temperature::{decode_max31855, TemperatureSource, ThermalModel, ThermocoupleFault};
pub use topics::*;
pub use types::{
    raw_state_to_string, state_to_string, string_to_state, CrockpotStatus, OperatingState,
    TemperatureReading,
};
