use serde::{Deserialize, Serialize};

/// Which participant produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a visible chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Done,
    Canceled,
}

/// Status a message can be finalized with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Done,
    Canceled,
}

impl From<TerminalStatus> for MessageStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Done => Self::Done,
            TerminalStatus::Canceled => Self::Canceled,
        }
    }
}

/// A reconciled conversational message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// Stable sort key; assigned when the item was first observed.
    pub sequence_timestamp: u64,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

impl ChatMessage {
    /// The side-specific identifier this message is keyed by.
    pub fn source_id(&self) -> Option<&str> {
        match self.role {
            Role::User => self.item_id.as_deref(),
            Role::Assistant => self.response_id.as_deref(),
        }
    }
}
