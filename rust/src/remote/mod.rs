//! Boundary to the remote message service.
//!
//! The service is append-oriented: records are created and occasionally have their status
//! updated, and two push streams announce creations and updates per conversation.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flume::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, SyncError};
use crate::state::{Message, MessageId, MessageStatus, Sender};

pub use memory::InMemoryMessageService;

/// Delivery status as the service stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Sending,
    Sent,
    Error,
}

/// A message as the service returns it from create/update/list and pushes it on streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender: Sender,
    /// Client timestamp supplied at create time.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Idempotency key the creating client supplied, echoed back by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// Decode a raw push payload, rejecting anything that lacks the fields the store needs.
    pub fn from_push_payload(payload: serde_json::Value) -> Result<Self, SyncError> {
        let record: Self = serde_json::from_value(payload)
            .map_err(|e| SyncError::MalformedPushEvent(e.to_string()))?;
        if record.id.trim().is_empty() {
            return Err(SyncError::MalformedPushEvent("empty id".to_string()));
        }
        if record.conversation_id.trim().is_empty() {
            return Err(SyncError::MalformedPushEvent(
                "empty conversationId".to_string(),
            ));
        }
        Ok(record)
    }

    pub fn server_timestamp_millis(&self) -> Option<i64> {
        self.created_at.map(|t| t.timestamp_millis())
    }

    /// Local status implied by the server's view of this record, for a record the server
    /// has accepted. `sending` counts as accepted: the record exists server-side.
    pub fn accepted_status(&self) -> MessageStatus {
        match self.status {
            Some(RecordStatus::Error) => MessageStatus::Failed {
                reason: "rejected by server".to_string(),
            },
            Some(RecordStatus::Sent) | Some(RecordStatus::Sending) | None => {
                MessageStatus::Confirmed
            }
        }
    }

    /// Build a store entry for a record this session did not originate.
    pub fn to_confirmed_message(&self) -> Message {
        Message {
            id: MessageId::Server(self.id.clone()),
            conversation_id: self.conversation_id.clone(),
            text: self.text.clone(),
            sender: self.sender.clone(),
            timestamp: self.timestamp.timestamp_millis(),
            server_timestamp: self.server_timestamp_millis(),
            status: MessageStatus::Confirmed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub conversation_id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessageStatusInput {
    pub id: String,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    Created,
    Updated,
}

impl PushKind {
    pub fn tag(&self) -> &'static str {
        match self {
            PushKind::Created => "created",
            PushKind::Updated => "updated",
        }
    }
}

/// Receiving half of a push subscription.
///
/// Payloads are delivered as raw JSON so that malformed events can be detected and dropped
/// by the consumer. Dropping the stream releases the subscription.
pub struct PushStream {
    rx: Receiver<serde_json::Value>,
}

impl PushStream {
    pub fn new(rx: Receiver<serde_json::Value>) -> Self {
        Self { rx }
    }

    /// Next payload, or `None` once the service has closed the stream.
    pub async fn next(&self) -> Option<serde_json::Value> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_next(&self) -> Result<serde_json::Value, TryRecvError> {
        self.rx.try_recv()
    }
}

#[async_trait]
pub trait MessageService: Send + Sync + 'static {
    async fn create_message(&self, input: CreateMessageInput)
        -> Result<MessageRecord, ServiceError>;

    async fn update_message_status(
        &self,
        input: UpdateMessageStatusInput,
    ) -> Result<MessageRecord, ServiceError>;

    /// Most recent `limit` messages of the conversation, oldest first.
    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, ServiceError>;

    async fn on_message_created(&self, conversation_id: &str) -> Result<PushStream, ServiceError>;

    async fn on_message_updated(&self, conversation_id: &str) -> Result<PushStream, ServiceError>;
}

pub type SharedMessageService = Arc<dyn MessageService>;
