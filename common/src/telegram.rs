use serde::{Deserialize, Serialize};

pub const API_BASE: &str = "https://api.telegram.org/bot";
pub const POLL_TIMEOUT_SECS: u64 = 30;
pub const RETRY_INTERVAL_SECS: u64 = 10;
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdatesResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Vec<Update>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendMessage<'a> {
    pub chat_id: i64,
    pub text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCommand {
    pub chat_id: i64,
    pub text: String,
}

pub fn updates_url(token: &str, offset: i64) -> String {
    format!("{API_BASE}{token}/getUpdates?timeout={POLL_TIMEOUT_SECS}&offset={offset}")
}

pub fn send_message_url(token: &str) -> String {
    format!("{API_BASE}{token}/sendMessage")
}

impl UpdatesResponse {
    pub fn commands(&self, offset: i64) -> (Vec<IncomingCommand>, i64) {
        let mut next_offset = offset;
        let mut commands = Vec::new();

        for update in &self.result {
            next_offset = next_offset.max(update.update_id + 1);

            let Some(message) = &update.message else {
                continue;
            };
            let Some(text) = message.text.as_deref() else {
                continue;
            };
            if text.starts_with('/') {
                commands.push(IncomingCommand {
                    chat_id: message.chat.id,
                    text: text.to_string(),
                });
            }
        }

        (commands, next_offset)
    }
}

pub fn clamp_message(text: &str) -> &str {
    if text.len() <= MAX_MESSAGE_LEN {
        return text;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
