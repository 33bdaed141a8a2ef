use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::reconciler::Reconciled;
use super::AppCore;
use crate::error::{ServiceError, SyncError};
use crate::remote::{CreateMessageInput, MessageRecord, RecordStatus, UpdateMessageStatusInput};
use crate::state::{now_millis, Message, MessageId, MessageStatus};
use crate::updates::InternalEvent;

/// Await `fut`, calling `on_timeout` once if it has not resolved within `timeout`.
///
/// The future is not cancelled on timeout: its eventual output is still returned.
async fn with_deadline<F: Future>(
    timeout: Duration,
    fut: F,
    on_timeout: impl FnOnce(),
) -> F::Output {
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return out,
        _ = tokio::time::sleep(timeout) => on_timeout(),
    }
    fut.await
}

fn failed(err: &ServiceError) -> MessageStatus {
    MessageStatus::Failed {
        reason: err.to_string(),
    }
}

impl AppCore {
    /// Client timestamps are strictly increasing within a session so rapid sends never tie.
    fn next_outgoing_ts(&mut self) -> i64 {
        let ts = now_millis().max(self.last_outgoing_ts + 1);
        self.last_outgoing_ts = ts;
        ts
    }

    pub(super) fn send_message(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            tracing::debug!("send_message: empty text ignored");
            return;
        }
        let Some(conversation_id) = self.view.as_ref().map(|v| v.conversation_id.clone()) else {
            self.set_error("No conversation is open");
            return;
        };

        let message = Message {
            id: MessageId::new_local(),
            conversation_id,
            text,
            sender: self.config.local_sender(),
            timestamp: self.next_outgoing_ts(),
            server_timestamp: None,
            status: MessageStatus::Pending,
        };
        let local_id = message.id.as_str().to_string();

        let Some(view) = self.view.as_mut() else {
            return;
        };
        if let Err(e) = view.store.insert(message.clone()) {
            tracing::error!(%e, "send_message: optimistic insert refused");
            return;
        }
        view.reconciler.track(&message);
        tracing::info!(%local_id, conversation_id = %message.conversation_id, "send_message");

        // Visible before any network I/O starts.
        self.emit_messages();
        self.start_create(local_id);
    }

    fn start_create(&mut self, local_id: String) {
        let attempt = self.next_attempt();
        let owner = self.config.owner.clone();
        let Some(view) = self.view.as_mut() else {
            return;
        };
        let Some(message) = view.store.get(&MessageId::Local(local_id.clone())).cloned() else {
            tracing::warn!(%local_id, "start_create: message not in store");
            return;
        };
        if !view.reconciler.begin_attempt(&local_id, attempt) {
            view.reconciler.track(&message);
            view.reconciler.begin_attempt(&local_id, attempt);
        }

        let input = CreateMessageInput {
            // Same key on every attempt, so the service never stores the message twice.
            client_id: Some(local_id.clone()),
            conversation_id: message.conversation_id,
            text: message.text,
            sender: message.sender,
            timestamp: DateTime::<Utc>::from_timestamp_millis(message.timestamp)
                .unwrap_or_else(Utc::now),
            status: Some(RecordStatus::Sent),
            owner,
        };
        tracing::debug!(%local_id, attempt, "create_message: start");

        let service = self.service.clone();
        let tx = self.core_sender.clone();
        let timeout = self.config.request_timeout();
        self.runtime.spawn(async move {
            let result = with_deadline(timeout, service.create_message(input), || {
                AppCore::post_internal(
                    &tx,
                    InternalEvent::CreateTimedOut {
                        local_id: local_id.clone(),
                        attempt,
                    },
                );
            })
            .await;
            AppCore::post_internal(
                &tx,
                InternalEvent::CreateFinished {
                    local_id,
                    attempt,
                    result,
                },
            );
        });
    }

    pub(super) fn on_create_finished(
        &mut self,
        local_id: String,
        attempt: u64,
        result: Result<MessageRecord, ServiceError>,
    ) {
        let Some(view) = self.view.as_mut() else {
            tracing::debug!(%local_id, "create finished after view closed; dropped");
            return;
        };

        match result {
            Ok(record) => {
                // Reconciled even when stale or timed out: the record exists server-side.
                let outcome = view
                    .reconciler
                    .reconcile(&mut view.store, &local_id, &record);
                match outcome {
                    Ok(Reconciled::Dismissed) => {
                        tracing::debug!(%local_id, server_id = %record.id, "create result for dismissed message");
                    }
                    Ok(outcome) => {
                        tracing::info!(%local_id, server_id = %record.id, ?outcome, "create_message: reconciled");
                        let rejected = record.status == Some(RecordStatus::Error);
                        self.emit_messages();
                        if rejected {
                            self.set_error("Message was rejected by the server");
                        }
                    }
                    Err(e) => {
                        // The creation push got there first.
                        tracing::debug!(%e, "create_message: deferred to push");
                    }
                }
            }
            Err(err) => {
                if !view.reconciler.is_current(&local_id, attempt) {
                    tracing::debug!(%local_id, attempt, %err, "stale create failure ignored");
                    return;
                }
                view.reconciler.finish_attempt(&local_id);
                view.store
                    .update_status(&MessageId::Local(local_id.clone()), failed(&err));
                let err = SyncError::from(err);
                tracing::warn!(%local_id, attempt, %err, "create_message failed");
                self.emit_messages();
                self.set_error(format!("Message failed to send: {err}"));
            }
        }
    }

    pub(super) fn on_create_timed_out(&mut self, local_id: String, attempt: u64) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        if !view.reconciler.is_current(&local_id, attempt) {
            return;
        }
        view.reconciler.finish_attempt(&local_id);
        view.store.update_status(
            &MessageId::Local(local_id.clone()),
            failed(&ServiceError::Timeout),
        );
        tracing::warn!(%local_id, attempt, "create_message timed out");
        self.emit_messages();
        self.set_error(format!(
            "Message failed to send: {}",
            SyncError::from(ServiceError::Timeout)
        ));
    }

    pub(super) fn retry_message(&mut self, message_id: MessageId) {
        let Some(view) = self.view.as_mut() else {
            tracing::debug!(%message_id, "retry: no open conversation");
            return;
        };
        let Some(message) = view.store.get(&message_id) else {
            tracing::debug!(%message_id, "retry: unknown message");
            return;
        };
        if !message.status.is_failed() {
            tracing::debug!(%message_id, "retry: message is not failed");
            return;
        }

        let in_flight = match &message_id {
            MessageId::Local(id) => view.reconciler.in_flight(id),
            MessageId::Server(id) => view.status_updates.contains_key(id),
        };
        if in_flight {
            tracing::debug!(%message_id, "retry: operation already in flight");
            return;
        }

        view.store.update_status(&message_id, MessageStatus::Pending);
        tracing::info!(%message_id, "retry");
        self.emit_messages();

        match message_id {
            // Never acknowledged: create again under the same client id.
            MessageId::Local(id) => self.start_create(id),
            // Stored but reported as errored: ask the service to mark it sent.
            MessageId::Server(id) => self.start_status_update(id),
        }
    }

    fn start_status_update(&mut self, server_id: String) {
        let attempt = self.next_attempt();
        let Some(view) = self.view.as_mut() else {
            return;
        };
        view.status_updates.insert(server_id.clone(), attempt);
        tracing::debug!(%server_id, attempt, "update_message_status: start");

        let input = UpdateMessageStatusInput {
            id: server_id.clone(),
            status: RecordStatus::Sent,
        };
        let service = self.service.clone();
        let tx = self.core_sender.clone();
        let timeout = self.config.request_timeout();
        self.runtime.spawn(async move {
            let result = with_deadline(timeout, service.update_message_status(input), || {
                AppCore::post_internal(
                    &tx,
                    InternalEvent::StatusUpdateTimedOut {
                        server_id: server_id.clone(),
                        attempt,
                    },
                );
            })
            .await;
            AppCore::post_internal(
                &tx,
                InternalEvent::StatusUpdateFinished {
                    server_id,
                    attempt,
                    result,
                },
            );
        });
    }

    pub(super) fn on_status_update_finished(
        &mut self,
        server_id: String,
        attempt: u64,
        result: Result<MessageRecord, ServiceError>,
    ) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        let current = view.status_updates.get(&server_id) == Some(&attempt);
        let id = MessageId::Server(server_id.clone());

        match result {
            Ok(record) => {
                // Any success settles the record, so a newer attempt's failure is stale.
                view.status_updates.remove(&server_id);
                let Some(existing) = view.store.get(&id).cloned() else {
                    tracing::debug!(%server_id, "status update for message not in view");
                    return;
                };
                let updated = Message {
                    status: record.accepted_status(),
                    server_timestamp: record
                        .server_timestamp_millis()
                        .or(existing.server_timestamp),
                    ..existing.clone()
                };
                if updated == existing {
                    return;
                }
                if let Err(e) = view.store.replace(&id, updated) {
                    tracing::warn!(%e, "update_message_status: replace failed");
                    return;
                }
                tracing::info!(%server_id, attempt, "update_message_status: settled");
                self.emit_messages();
            }
            Err(err) => {
                if !current {
                    tracing::debug!(%server_id, attempt, %err, "stale status update failure ignored");
                    return;
                }
                view.status_updates.remove(&server_id);
                view.store.update_status(&id, failed(&err));
                let err = SyncError::from(err);
                tracing::warn!(%server_id, attempt, %err, "update_message_status failed");
                self.emit_messages();
                self.set_error(format!("Message failed to send: {err}"));
            }
        }
    }

    pub(super) fn on_status_update_timed_out(&mut self, server_id: String, attempt: u64) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        if view.status_updates.get(&server_id) != Some(&attempt) {
            return;
        }
        view.status_updates.remove(&server_id);
        view.store.update_status(
            &MessageId::Server(server_id.clone()),
            failed(&ServiceError::Timeout),
        );
        tracing::warn!(%server_id, attempt, "update_message_status timed out");
        self.emit_messages();
        self.set_error(format!(
            "Message failed to send: {}",
            SyncError::from(ServiceError::Timeout)
        ));
    }
}
