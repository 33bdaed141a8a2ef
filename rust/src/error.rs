//! Error types for the sync engine and its remote-service boundary.

use thiserror::Error;

use crate::state::MessageId;

/// A call against the remote message service did not produce a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service answered but refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// No answer within the configured request timeout.
    #[error("request timed out")]
    Timeout,

    /// The request never reached the service, or the answer was lost.
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Create/update/list failed; the affected message becomes retryable.
    #[error("network failure: {0}")]
    NetworkFailure(#[from] ServiceError),

    /// Both the create response and a push event tried to settle the same message.
    #[error("message {local_id} was already reconciled as {server_id}")]
    ReconciliationConflict { local_id: String, server_id: String },

    /// A push payload that could not be read as a message record.
    #[error("malformed push event: {0}")]
    MalformedPushEvent(String),
}

/// Violations of the message store's invariants. These indicate a logic error in the
/// caller and are logged, never surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("message {0} is already in the store")]
    DuplicateId(MessageId),

    #[error("message {0} is not in the store")]
    NotFound(MessageId),
}
