use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    /// Maps the channel's `personType` field. Managers and bots are human or automated agents.
    pub fn from_person_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Self::User,
            "manager" | "bot" | "agent" => Self::Agent,
            _ => Self::System,
        }
    }
}

/// An inbound chat message. Immutable once received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: SessionId,
    pub text: String,
    pub sender_type: SenderType,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        session_id: SessionId,
        text: impl Into<String>,
        sender_type: SenderType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self { session_id, text: text.into(), sender_type, timestamp }
    }

    pub fn from_user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(SessionId::new(session_id), text, SenderType::User, Utc::now())
    }

    pub fn is_from_user(&self) -> bool {
        self.sender_type == SenderType::User
    }
}

/// Reply handed to the outbound channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressReply {
    pub session_id: SessionId,
    pub reply_text: String,
}
