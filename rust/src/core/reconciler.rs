use std::collections::HashMap;

use super::store::{MessageStore, Replaced};
use crate::error::SyncError;
use crate::remote::MessageRecord;
use crate::state::{Message, MessageId, Sender};

/// A locally originated message that has no server id yet.
#[derive(Debug, Clone)]
struct Outgoing {
    conversation_id: String,
    text: String,
    sender: Sender,
    timestamp: i64,
    // Some while a create for this message is in flight.
    attempt: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reconciled {
    Replaced,
    /// A copy under the server id was already in the store and got folded in.
    Collapsed,
    /// The local entry is gone (view closed or reset); nothing to update.
    Dismissed,
}

/// Bridges local ids to server ids for messages sent in this view.
///
/// An entry lives from the optimistic insert until the message is settled under its server
/// id, whichever of the create response or the creation push gets there first.
#[derive(Debug)]
pub(crate) struct IdentityReconciler {
    outgoing: HashMap<String, Outgoing>,
    match_window_ms: i64,
}

impl IdentityReconciler {
    pub(crate) fn new(match_window_ms: i64) -> Self {
        Self {
            outgoing: HashMap::new(),
            match_window_ms,
        }
    }

    pub(crate) fn track(&mut self, message: &Message) {
        let MessageId::Local(local_id) = &message.id else {
            return;
        };
        self.outgoing.insert(
            local_id.clone(),
            Outgoing {
                conversation_id: message.conversation_id.clone(),
                text: message.text.clone(),
                sender: message.sender.clone(),
                timestamp: message.timestamp,
                attempt: None,
            },
        );
    }

    pub(crate) fn begin_attempt(&mut self, local_id: &str, attempt: u64) -> bool {
        match self.outgoing.get_mut(local_id) {
            Some(o) => {
                o.attempt = Some(attempt);
                true
            }
            None => false,
        }
    }

    pub(crate) fn finish_attempt(&mut self, local_id: &str) {
        if let Some(o) = self.outgoing.get_mut(local_id) {
            o.attempt = None;
        }
    }

    pub(crate) fn is_current(&self, local_id: &str, attempt: u64) -> bool {
        self.outgoing
            .get(local_id)
            .is_some_and(|o| o.attempt == Some(attempt))
    }

    pub(crate) fn in_flight(&self, local_id: &str) -> bool {
        self.outgoing
            .get(local_id)
            .is_some_and(|o| o.attempt.is_some())
    }

    /// Which of our unsettled local messages, if any, `record` is the server copy of.
    ///
    /// An echoed client id is authoritative, including a foreign one. Without it, the record
    /// must agree on conversation, text and sender, and lie within the match window of the
    /// local timestamp; the closest candidate wins.
    pub(crate) fn match_push(&self, record: &MessageRecord) -> Option<String> {
        if let Some(client_id) = record.client_id.as_deref() {
            return self
                .outgoing
                .contains_key(client_id)
                .then(|| client_id.to_string());
        }
        let ts = record.timestamp.timestamp_millis();
        self.outgoing
            .iter()
            .filter(|(_, o)| {
                o.conversation_id == record.conversation_id
                    && o.text == record.text
                    && o.sender == record.sender
            })
            .map(|(id, o)| ((o.timestamp - ts).abs(), o.timestamp, id))
            .filter(|(delta, _, _)| *delta <= self.match_window_ms)
            .min()
            .map(|(_, _, id)| id.clone())
    }

    /// Swap `local_id` for the server identity carried by `record`.
    ///
    /// The client timestamp, text and sender of the local entry are kept; the status follows
    /// the server's view of the record. Returns `ReconciliationConflict` when the message was
    /// already settled under the server id by the other path.
    pub(crate) fn reconcile(
        &mut self,
        store: &mut MessageStore,
        local_id: &str,
        record: &MessageRecord,
    ) -> Result<Reconciled, SyncError> {
        let local = MessageId::Local(local_id.to_string());
        let server = MessageId::Server(record.id.clone());
        self.outgoing.remove(local_id);

        let Some(existing) = store.get(&local).cloned() else {
            if store.contains(&server) {
                return Err(SyncError::ReconciliationConflict {
                    local_id: local_id.to_string(),
                    server_id: record.id.clone(),
                });
            }
            return Ok(Reconciled::Dismissed);
        };

        let settled = Message {
            id: server,
            server_timestamp: record.server_timestamp_millis(),
            status: record.accepted_status(),
            ..existing
        };
        match store.replace(&local, settled) {
            Ok(Replaced::InPlace) => Ok(Reconciled::Replaced),
            Ok(Replaced::Collapsed) => Ok(Reconciled::Collapsed),
            Err(e) => {
                tracing::warn!(%e, "reconcile: local entry vanished");
                Ok(Reconciled::Dismissed)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_tracking(&self, local_id: &str) -> bool {
        self.outgoing.contains_key(local_id)
    }
}
