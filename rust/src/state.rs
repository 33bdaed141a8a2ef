use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    pub rev: u64,
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
    /// True while the bootstrap fetch for the open conversation is in flight.
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            conversation_id: None,
            messages: vec![],
            is_loading: false,
            last_error: None,
        }
    }
}

/// Identity of a message in the store.
///
/// A message starts out with a `Local` id minted at optimistic-insert time and is swapped
/// to the `Server` id once the remote service has acknowledged it. Only one of the two is
/// ever live for a given logical message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MessageId {
    Local(String),
    Server(String),
}

impl MessageId {
    pub fn new_local() -> Self {
        Self::Local(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Local(id) | Self::Server(id) => id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local:{id}"),
            Self::Server(id) => f.write_str(id),
        }
    }
}

/// Origin of a message. The service stores senders as free-form strings; the assistant has
/// historically been written as `ai`, which is accepted as an alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Sender {
    User,
    Assistant,
    Participant(String),
}

impl From<String> for Sender {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Self::User,
            "assistant" | "ai" => Self::Assistant,
            _ => Self::Participant(raw),
        }
    }
}

impl From<&str> for Sender {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<Sender> for String {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::User => "user".to_string(),
            Sender::Assistant => "assistant".to_string(),
            Sender::Participant(name) => name,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
            Self::Participant(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Confirmed,
    Failed { reason: String },
}

impl MessageStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub text: String,
    pub sender: Sender,
    /// Epoch millis, assigned client-side when the message was first inserted.
    pub timestamp: i64,
    pub server_timestamp: Option<i64>,
    pub status: MessageStatus,
}

impl Message {
    /// Local wall-clock time as `HH:MM`, matching what the chat view shows under a bubble.
    pub fn display_time(&self) -> String {
        use chrono::TimeZone;

        match chrono::Local.timestamp_millis_opt(self.timestamp).single() {
            Some(dt) => dt.format("%H:%M").to_string(),
            None => String::new(),
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
