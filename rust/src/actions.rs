use crate::state::MessageId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    // Conversation view
    OpenConversation { conversation_id: String },
    CloseConversation,

    // Messages
    SendMessage { text: String },
    RetryMessage { message_id: MessageId },

    // UI
    ClearError,
}

impl AppAction {
    /// Log-safe action tag (never includes message text).
    pub fn tag(&self) -> &'static str {
        match self {
            // Conversation view
            AppAction::OpenConversation { .. } => "OpenConversation",
            AppAction::CloseConversation => "CloseConversation",

            // Messages
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::RetryMessage { .. } => "RetryMessage",

            // UI
            AppAction::ClearError => "ClearError",
        }
    }
}
