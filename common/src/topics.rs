pub const TOPIC_STATUS: &str = "crockpot/status";
pub const TOPIC_EVENT_SAFETY: &str = "crockpot/event/safety";

pub const TOPIC_CMD_STATE: &str = "crockpot/cmnd/state";
pub const TOPIC_CMD_PROGRAM: &str = "crockpot/cmnd/program";
