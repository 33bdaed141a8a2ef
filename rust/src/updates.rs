use crate::error::ServiceError;
use crate::remote::{MessageRecord, PushKind};
use crate::state::{AppState, Message};
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    MessagesChanged {
        rev: u64,
        messages: Vec<Message>,
    },
    LoadingChanged {
        rev: u64,
        is_loading: bool,
    },
    ErrorChanged {
        rev: u64,
        last_error: Option<String>,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::MessagesChanged { rev, .. } => *rev,
            AppUpdate::LoadingChanged { rev, .. } => *rev,
            AppUpdate::ErrorChanged { rev, .. } => *rev,
        }
    }

    /// Fold this update into a locally held copy of the state.
    pub fn apply_to(self, state: &mut AppState) {
        match self {
            AppUpdate::FullState(s) => *state = s,
            AppUpdate::MessagesChanged { rev, messages } => {
                state.rev = rev;
                state.messages = messages;
            }
            AppUpdate::LoadingChanged { rev, is_loading } => {
                state.rev = rev;
                state.is_loading = is_loading;
            }
            AppUpdate::ErrorChanged { rev, last_error } => {
                state.rev = rev;
                state.last_error = last_error;
            }
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
    Shutdown,
}

#[derive(Debug)]
pub enum InternalEvent {
    // Sync path
    CreateFinished {
        local_id: String,
        attempt: u64,
        result: Result<MessageRecord, ServiceError>,
    },
    // The request keeps running; a late CreateFinished still arrives.
    CreateTimedOut {
        local_id: String,
        attempt: u64,
    },
    StatusUpdateFinished {
        server_id: String,
        attempt: u64,
        result: Result<MessageRecord, ServiceError>,
    },
    StatusUpdateTimedOut {
        server_id: String,
        attempt: u64,
    },

    // Conversation view
    BootstrapLoaded {
        token: u64,
        result: Result<Vec<MessageRecord>, ServiceError>,
    },
    PushReceived {
        token: u64,
        kind: PushKind,
        payload: serde_json::Value,
    },
}
