use std::time::Duration;

use flume::Sender;
use tokio::task::JoinHandle;

use super::reconciler::Reconciled;
use super::{AppCore, ConversationView};
use crate::remote::{MessageRecord, PushKind, RecordStatus, SharedMessageService};
use crate::state::{Message, MessageId, MessageStatus};
use crate::updates::{CoreMsg, InternalEvent};

/// Consumer tasks for a view's push streams. Dropping the set aborts the tasks, which drops
/// the streams and so releases the subscriptions.
pub(super) struct SubscriptionSet {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_stream(
    service: SharedMessageService,
    kind: PushKind,
    conversation_id: String,
    token: u64,
    tx: Sender<CoreMsg>,
    resubscribe_delay: Duration,
) {
    loop {
        let subscribed = match kind {
            PushKind::Created => service.on_message_created(&conversation_id).await,
            PushKind::Updated => service.on_message_updated(&conversation_id).await,
        };
        match subscribed {
            Ok(stream) => {
                tracing::debug!(kind = kind.tag(), %conversation_id, "subscribed");
                while let Some(payload) = stream.next().await {
                    let event = InternalEvent::PushReceived {
                        token,
                        kind,
                        payload,
                    };
                    if tx.send(CoreMsg::Internal(Box::new(event))).is_err() {
                        return;
                    }
                }
                tracing::info!(kind = kind.tag(), %conversation_id, "push stream ended; resubscribing");
            }
            Err(e) => {
                tracing::warn!(kind = kind.tag(), %conversation_id, %e, "subscribe failed; retrying");
            }
        }
        tokio::time::sleep(resubscribe_delay).await;
    }
}

impl ConversationView {
    /// Apply a server record arriving by creation push or bootstrap. Returns whether the
    /// store changed.
    pub(super) fn apply_server_record(&mut self, record: &MessageRecord) -> bool {
        let server = MessageId::Server(record.id.clone());
        if self.store.contains(&server) {
            tracing::debug!(server_id = %record.id, "record already present");
            return false;
        }

        if let Some(local_id) = self.reconciler.match_push(record) {
            match self.reconciler.reconcile(&mut self.store, &local_id, record) {
                Ok(Reconciled::Dismissed) => {}
                Ok(outcome) => {
                    tracing::info!(%local_id, server_id = %record.id, ?outcome, "push: reconciled local message");
                    return true;
                }
                Err(e) => {
                    tracing::debug!(%e, "push: deferred to create response");
                    return false;
                }
            }
        }

        match self.store.insert(record.to_confirmed_message()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%e, "push: insert refused");
                false
            }
        }
    }

    /// Patch status and server timestamp of a known record. Unknown ids are discarded:
    /// the creation event may simply not have arrived yet.
    pub(super) fn apply_updated(&mut self, record: &MessageRecord) -> bool {
        let id = MessageId::Server(record.id.clone());
        let Some(existing) = self.store.get(&id).cloned() else {
            tracing::debug!(server_id = %record.id, "update for unknown message discarded");
            return false;
        };

        let in_flight = self.status_updates.contains_key(&record.id);
        let status = match record.status {
            Some(RecordStatus::Sent) => {
                self.status_updates.remove(&record.id);
                MessageStatus::Confirmed
            }
            Some(RecordStatus::Error) if !in_flight => record.accepted_status(),
            _ => existing.status.clone(),
        };
        let updated = Message {
            status,
            server_timestamp: record
                .server_timestamp_millis()
                .or(existing.server_timestamp),
            ..existing.clone()
        };
        if updated == existing {
            return false;
        }
        match self.store.replace(&id, updated) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%e, "push: update replace failed");
                false
            }
        }
    }
}

impl AppCore {
    pub(super) fn start_subscriptions(&mut self) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        let delay = self.config.resubscribe_delay();
        let tasks = [PushKind::Created, PushKind::Updated]
            .into_iter()
            .map(|kind| {
                self.runtime.spawn(run_stream(
                    self.service.clone(),
                    kind,
                    view.conversation_id.clone(),
                    view.token,
                    self.core_sender.clone(),
                    delay,
                ))
            })
            .collect();
        view._subscriptions = Some(SubscriptionSet { tasks });
    }

    pub(super) fn on_push(&mut self, token: u64, kind: PushKind, payload: serde_json::Value) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        if view.token != token {
            tracing::debug!(kind = kind.tag(), token, "push for a previous view ignored");
            return;
        }

        let record = match MessageRecord::from_push_payload(payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(kind = kind.tag(), %e, "discarding push event");
                return;
            }
        };
        if record.conversation_id != view.conversation_id {
            tracing::debug!(kind = kind.tag(), server_id = %record.id, "push for another conversation");
            return;
        }

        let changed = match kind {
            PushKind::Created => view.apply_server_record(&record),
            PushKind::Updated => view.apply_updated(&record),
        };
        if changed {
            self.emit_messages();
        }
    }
}
