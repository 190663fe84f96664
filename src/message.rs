//! Message protocol definitions
//!
//! Line-based JSON protocol. Every message on the wire is one JSON object
//! terminated by a newline:
//!
//! ```text
//! {"sender":"SYSTEM","intent":"STATUS_SUCCESS","payload":"OK"}
//! ```
//!
//! Clients may also send plain text lines, which are treated as chat content.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Sender label used for every server-originated message
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Payload of the registration success reply
pub const REGISTRATION_OK: &str = "OK";

/// Payload of the registration failure reply
pub const INVALID_USERNAME: &str = "Invalid Username";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// How a receiving client should interpret a message
///
/// `StatusSuccess` / `StatusFailure` are control replies to a single
/// session. `Send` is chat content fanned out to other sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageIntent {
    StatusSuccess,
    StatusFailure,
    Send,
}

impl std::fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            MessageIntent::StatusSuccess => "STATUS_SUCCESS",
            MessageIntent::StatusFailure => "STATUS_FAILURE",
            MessageIntent::Send => "SEND",
        };
        f.write_str(tag)
    }
}

/// Immutable chat message: who sent it, what it is, and its text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    sender: String,
    intent: MessageIntent,
    payload: String,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        intent: MessageIntent,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            intent,
            payload: payload.into(),
        }
    }

    /// Message from the server itself
    pub fn system(intent: MessageIntent, payload: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, intent, payload)
    }

    /// Reply sent to a session whose username was accepted
    pub fn registration_ok() -> Self {
        Self::system(MessageIntent::StatusSuccess, REGISTRATION_OK)
    }

    /// Reply sent to a session whose username is already taken
    pub fn invalid_username() -> Self {
        Self::system(MessageIntent::StatusFailure, INVALID_USERNAME)
    }

    /// Announcement broadcast to everyone else when a user registers
    pub fn joined(username: &str) -> Self {
        Self::system(MessageIntent::Send, format!("{} has joined!", username))
    }

    /// Announcement broadcast to the remaining users when one leaves
    pub fn disconnected(username: &str) -> Self {
        Self::system(MessageIntent::Send, format!("{} has disconnected!", username))
    }

    /// Decode a line received from a client
    ///
    /// Clients only ever produce chat content: the sender is the session's
    /// username and the intent is `Send`, whatever the line claims.
    /// Lines that are not a JSON message are taken as plain chat text.
    pub fn inbound(username: &str, line: &str) -> Self {
        let line = line.trim_end_matches(LINE_ENDINGS);
        match serde_json::from_str::<Message>(line) {
            Ok(parsed) => Self::new(username, MessageIntent::Send, parsed.payload),
            Err(_) => Self::new(username, MessageIntent::Send, line),
        }
    }

    /// Decode a canonical wire line
    pub fn from_line(line: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(line.trim_end_matches(LINE_ENDINGS))?)
    }

    /// Canonical wire line (without the trailing newline)
    pub fn raw(&self) -> String {
        // Only strings and a unit enum: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn intent(&self) -> MessageIntent {
        self.intent
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.intent, self.sender, self.payload)
    }
}
