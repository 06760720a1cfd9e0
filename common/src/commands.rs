use log::info;

use crate::{
    crockpot::Crockpot,
    relay::RelayActuator,
    types::{CrockpotStatus, OperatingState},
};

pub const HELP_MESSAGE: &str = "IoT Crockpot Commands:\n\
/status - Show current status\n\
/off - Turn off\n\
/warm - Set to warm\n\
/low - Set to low\n\
/high - Set to high\n\
/help - Show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Status,
    SetState(OperatingState),
    Help,
    Unknown(String),
}

impl BotCommand {
    // Commands match exactly. A trailing `@botname` mention, as sent in
    // group chats, is ignored.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let command = text.split_once('@').map_or(text, |(command, _)| command);

        match command {
            "/status" | "/start" => Self::Status,
            "/off" => Self::SetState(OperatingState::Off),
            "/warm" => Self::SetState(OperatingState::Warm),
            "/low" => Self::SetState(OperatingState::Low),
            "/high" => Self::SetState(OperatingState::High),
            "/help" => Self::Help,
            _ => Self::Unknown(text.to_string()),
        }
    }
}

pub fn status_message(status: &CrockpotStatus) -> String {
    format!(
        "Crockpot Status:\nState: {}\nTemperature: {:.1} F\nUptime: {} seconds\nWiFi: {}\nSensor: {}",
        status.state,
        status.temperature_f,
        status.uptime_seconds,
        if status.wifi_connected {
            "Connected"
        } else {
            "Disconnected"
        },
        if status.sensor_error { "ERROR" } else { "OK" },
    )
}

pub fn status_line(status: &CrockpotStatus) -> String {
    format!(
        "Status: {} | Temp: {:.1} F | Uptime: {} s | WiFi: {}",
        status.state,
        status.temperature_f,
        status.uptime_seconds,
        if status.wifi_connected { "OK" } else { "DISCONNECTED" },
    )
}

fn state_reply(state: OperatingState, applied: bool) -> String {
    match (state, applied) {
        (OperatingState::Off, true) => "Crockpot turned OFF".to_string(),
        (OperatingState::Off, false) => "Failed to turn off crockpot".to_string(),
        (state, true) => format!("Crockpot set to {state}"),
        (state, false) => format!(
            "Failed to set crockpot to {}",
            state.as_str().to_ascii_lowercase()
        ),
    }
}

pub fn handle_command<R: RelayActuator>(crockpot: &Crockpot<R>, text: &str) -> String {
    info!("processing command: {}", text.trim());

    match BotCommand::parse(text) {
        BotCommand::Status => status_message(&crockpot.get_status()),
        BotCommand::SetState(state) => state_reply(state, crockpot.set_state(state).is_ok()),
        BotCommand::Help => HELP_MESSAGE.to_string(),
        BotCommand::Unknown(command) => {
            format!("Unknown command: {command}\nType /help for available commands.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{relay::RelayBank, testing::RecordingPin};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn crockpot() -> (Crockpot<RelayBank<RecordingPin>>, RecordingPin) {
        let pin = RecordingPin::default();
        let relay = RelayBank::new([pin.clone()], true).unwrap();
        (Crockpot::new(relay, Duration::from_millis(10)).unwrap(), pin)
    }

    #[test]
    fn parses_vocabulary() {
        assert_eq!(BotCommand::parse("/start"), BotCommand::Status);
        assert_eq!(BotCommand::parse(" /status \n"), BotCommand::Status);
        assert_eq!(
            BotCommand::parse("/high@crockpot_bot"),
            BotCommand::SetState(OperatingState::High)
        );
        assert_eq!(
            BotCommand::parse("/HIGH"),
            BotCommand::Unknown("/HIGH".to_string())
        );
    }

    #[test]
    fn status_reply_matches_firmware_format() {
        let status = CrockpotStatus {
            state: OperatingState::Low,
            temperature_f: 187.46,
            uptime_seconds: 3600,
            wifi_connected: true,
            sensor_error: false,
        };

        assert_eq!(
            status_message(&status),
            "Crockpot Status:\nState: LOW\nTemperature: 187.5 F\nUptime: 3600 seconds\nWiFi: Connected\nSensor: OK"
        );
    }

    #[test]
    fn status_line_is_compact() {
        let status = CrockpotStatus {
            state: OperatingState::Warm,
            temperature_f: 150.04,
            uptime_seconds: 90,
            ..CrockpotStatus::default()
        };
        assert_eq!(
            status_line(&status),
            "Status: WARM | Temp: 150.0 F | Uptime: 90 s | WiFi: DISCONNECTED"
        );
    }

    #[test]
    fn state_commands_drive_accessor() {
        let (crockpot, pin) = crockpot();

        assert_eq!(handle_command(&crockpot, "/warm"), "Crockpot set to WARM");
        assert_eq!(crockpot.get_status().state, OperatingState::Warm);
        assert_eq!(pin.last_level(), Some(true));

        assert_eq!(handle_command(&crockpot, "/off"), "Crockpot turned OFF");
        assert_eq!(pin.last_level(), Some(false));
    }

    #[test]
    fn failed_state_change_is_reported() {
        let (crockpot, pin) = crockpot();
        pin.fail_writes(true);

        assert_eq!(
            handle_command(&crockpot, "/high"),
            "Failed to set crockpot to high"
        );
        assert_eq!(handle_command(&crockpot, "/off"), "Failed to turn off crockpot");
        assert_eq!(crockpot.get_status().state, OperatingState::Off);
    }

    #[test]
    fn help_and_unknown_replies() {
        let (crockpot, _) = crockpot();

        assert_eq!(handle_command(&crockpot, "/help"), HELP_MESSAGE);
        assert_eq!(
            handle_command(&crockpot, "/simmer"),
            "Unknown command: /simmer\nType /help for available commands."
        );
    }
}
