use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flume::Sender as FlumeSender;
use serde_json::Value;
use tokio::sync::watch;

use super::{
    CreateMessageInput, MessageRecord, MessageService, PushKind, PushStream, RecordStatus,
    UpdateMessageStatusInput,
};
use crate::error::ServiceError;
use crate::state::Sender;

#[derive(Debug, Default)]
struct ServiceState {
    next_id: u64,
    records: Vec<MessageRecord>,
    created_subscribers: HashMap<String, Vec<FlumeSender<Value>>>,
    updated_subscribers: HashMap<String, Vec<FlumeSender<Value>>>,

    create_calls: u32,
    update_calls: u32,
    fail_creates: u32,
    lose_create_acks: u32,
    reject_creates: u32,
    fail_updates: u32,
    fail_lists: u32,
    mute_created_events: bool,
    mute_updated_events: bool,
}

impl ServiceState {
    fn subscribers(&mut self, kind: PushKind) -> &mut HashMap<String, Vec<FlumeSender<Value>>> {
        match kind {
            PushKind::Created => &mut self.created_subscribers,
            PushKind::Updated => &mut self.updated_subscribers,
        }
    }

    fn publish(&mut self, kind: PushKind, conversation_id: &str, payload: Value) {
        if let Some(list) = self.subscribers(kind).get_mut(conversation_id) {
            list.retain(|tx| tx.send(payload.clone()).is_ok());
        }
    }

    fn publish_record(&mut self, kind: PushKind, record: &MessageRecord) {
        match serde_json::to_value(record) {
            Ok(payload) => self.publish(kind, &record.conversation_id, payload),
            Err(e) => tracing::warn!(%e, "in-memory service: record not serializable"),
        }
    }

    fn mint(
        &mut self,
        conversation_id: &str,
        text: &str,
        sender: Sender,
        client_id: Option<String>,
        owner: Option<String>,
        status: RecordStatus,
        timestamp: DateTime<Utc>,
    ) -> MessageRecord {
        self.next_id += 1;
        let now = Utc::now();
        let record = MessageRecord {
            id: format!("srv-{}", self.next_id),
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            sender,
            timestamp,
            status: Some(status),
            owner,
            client_id,
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.records.push(record.clone());
        record
    }

    fn apply_status(&mut self, id: &str, status: RecordStatus) -> Option<MessageRecord> {
        let record = self.records.iter_mut().find(|r| r.id == id)?;
        record.status = Some(status);
        record.updated_at = Some(Utc::now());
        let record = record.clone();
        if !self.mute_updated_events {
            self.publish_record(PushKind::Updated, &record);
        }
        Some(record)
    }
}

/// Pause switch for one stage of request handling. Requests reaching a paused stage wait
/// until it is resumed.
#[derive(Debug)]
struct Gate(watch::Sender<bool>);

impl Gate {
    fn new() -> Self {
        Self(watch::channel(false).0)
    }

    fn set_paused(&self, paused: bool) {
        self.0.send_replace(paused);
    }

    async fn pass(&self) {
        let mut rx = self.0.subscribe();
        loop {
            let paused = *rx.borrow_and_update();
            if !paused {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug)]
struct Gates {
    creates: Gate,
    acks: Gate,
    updates: Gate,
    update_acks: Gate,
    lists: Gate,
}

/// Process-local message service.
///
/// Behaves like the hosted service (server-assigned ids, `clientId` idempotency, push
/// fan-out per conversation) and exposes knobs to inject failures and reorder deliveries.
/// Used by the integration tests and the CLI.
#[derive(Debug, Clone)]
pub struct InMemoryMessageService {
    state: Arc<Mutex<ServiceState>>,
    gates: Arc<Gates>,
}

impl Default for InMemoryMessageService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState::default())),
            gates: Arc::new(Gates {
                creates: Gate::new(),
                acks: Gate::new(),
                updates: Gate::new(),
                update_acks: Gate::new(),
                lists: Gate::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Store a record as if another client had created it, without announcing it.
    pub fn seed(&self, conversation_id: &str, text: &str, sender: Sender) -> MessageRecord {
        self.lock().mint(
            conversation_id,
            text,
            sender,
            None,
            None,
            RecordStatus::Sent,
            Utc::now(),
        )
    }

    /// Store a record from another participant and announce it on the creation stream.
    pub fn post(&self, conversation_id: &str, text: &str, sender: Sender) -> MessageRecord {
        let mut st = self.lock();
        let record = st.mint(
            conversation_id,
            text,
            sender,
            None,
            None,
            RecordStatus::Sent,
            Utc::now(),
        );
        st.publish_record(PushKind::Created, &record);
        record
    }

    /// Change a stored record's status and announce it on the update stream.
    pub fn set_status(&self, id: &str, status: RecordStatus) -> Option<MessageRecord> {
        self.lock().apply_status(id, status)
    }

    /// Re-announce an existing record on the creation stream (duplicate or late delivery).
    pub fn replay_created(&self, id: &str) -> bool {
        let mut st = self.lock();
        let Some(record) = st.records.iter().find(|r| r.id == id).cloned() else {
            return false;
        };
        st.publish_record(PushKind::Created, &record);
        true
    }

    /// Deliver an arbitrary payload on one of a conversation's streams.
    pub fn inject(&self, kind: PushKind, conversation_id: &str, payload: Value) {
        self.lock().publish(kind, conversation_id, payload);
    }

    /// Drop every open stream of the conversation, as a server-side disconnect would.
    pub fn close_streams(&self, conversation_id: &str) {
        let mut st = self.lock();
        st.created_subscribers.remove(conversation_id);
        st.updated_subscribers.remove(conversation_id);
    }

    pub fn records(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Live subscriptions of `kind` for the conversation. Released streams are not counted.
    pub fn subscriber_count(&self, kind: PushKind, conversation_id: &str) -> usize {
        let mut st = self.lock();
        let Some(list) = st.subscribers(kind).get_mut(conversation_id) else {
            return 0;
        };
        list.retain(|tx| !tx.is_disconnected());
        list.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.lock().create_calls
    }

    pub fn update_calls(&self) -> u32 {
        self.lock().update_calls
    }

    /// Fail the next `n` creates before anything is stored.
    pub fn fail_next_creates(&self, n: u32) {
        self.lock().fail_creates = n;
    }

    /// Store the next `n` creates but report a transport failure to the caller.
    pub fn lose_next_create_acks(&self, n: u32) {
        self.lock().lose_create_acks = n;
    }

    /// Store the next `n` creates with `status = error`.
    pub fn reject_next_creates(&self, n: u32) {
        self.lock().reject_creates = n;
    }

    pub fn fail_next_updates(&self, n: u32) {
        self.lock().fail_updates = n;
    }

    pub fn fail_next_lists(&self, n: u32) {
        self.lock().fail_lists = n;
    }

    /// Stop announcing new records on the creation stream.
    pub fn mute_created_events(&self, muted: bool) {
        self.lock().mute_created_events = muted;
    }

    /// Stop announcing status changes on the update stream.
    pub fn mute_updated_events(&self, muted: bool) {
        self.lock().mute_updated_events = muted;
    }

    /// Hold creates before they are stored.
    pub fn pause_creates(&self, paused: bool) {
        self.gates.creates.set_paused(paused);
    }

    /// Hold create responses after the record is stored and announced.
    pub fn pause_acks(&self, paused: bool) {
        self.gates.acks.set_paused(paused);
    }

    /// Hold status updates before they are applied.
    pub fn pause_updates(&self, paused: bool) {
        self.gates.updates.set_paused(paused);
    }

    /// Hold status update responses after the record has changed.
    pub fn pause_update_acks(&self, paused: bool) {
        self.gates.update_acks.set_paused(paused);
    }

    pub fn pause_lists(&self, paused: bool) {
        self.gates.lists.set_paused(paused);
    }

    fn subscribe(&self, kind: PushKind, conversation_id: &str) -> PushStream {
        let (tx, rx) = flume::unbounded();
        self.lock()
            .subscribers(kind)
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        PushStream::new(rx)
    }
}

#[async_trait]
impl MessageService for InMemoryMessageService {
    async fn create_message(
        &self,
        input: CreateMessageInput,
    ) -> Result<MessageRecord, ServiceError> {
        self.gates.creates.pass().await;

        let (record, lose_ack) = {
            let mut st = self.lock();
            st.create_calls += 1;
            if st.fail_creates > 0 {
                st.fail_creates -= 1;
                return Err(ServiceError::Transport("service unavailable".to_string()));
            }
            if let Some(client_id) = input.client_id.as_deref() {
                let existing = st
                    .records
                    .iter()
                    .find(|r| r.client_id.as_deref() == Some(client_id))
                    .cloned();
                if let Some(existing) = existing {
                    return Ok(existing);
                }
            }
            let status = if st.reject_creates > 0 {
                st.reject_creates -= 1;
                RecordStatus::Error
            } else {
                input.status.unwrap_or(RecordStatus::Sent)
            };
            let record = st.mint(
                &input.conversation_id,
                &input.text,
                input.sender,
                input.client_id,
                input.owner,
                status,
                input.timestamp,
            );
            if !st.mute_created_events {
                st.publish_record(PushKind::Created, &record);
            }
            let lose_ack = st.lose_create_acks > 0;
            if lose_ack {
                st.lose_create_acks -= 1;
            }
            (record, lose_ack)
        };

        self.gates.acks.pass().await;
        if lose_ack {
            return Err(ServiceError::Transport(
                "connection reset before response".to_string(),
            ));
        }
        Ok(record)
    }

    async fn update_message_status(
        &self,
        input: UpdateMessageStatusInput,
    ) -> Result<MessageRecord, ServiceError> {
        self.gates.updates.pass().await;

        let record = {
            let mut st = self.lock();
            st.update_calls += 1;
            if st.fail_updates > 0 {
                st.fail_updates -= 1;
                return Err(ServiceError::Transport("service unavailable".to_string()));
            }
            st.apply_status(&input.id, input.status)
        };

        self.gates.update_acks.pass().await;
        record.ok_or_else(|| ServiceError::Rejected(format!("no message {}", input.id)))
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        self.gates.lists.pass().await;

        let mut st = self.lock();
        if st.fail_lists > 0 {
            st.fail_lists -= 1;
            return Err(ServiceError::Transport("service unavailable".to_string()));
        }
        let matching: Vec<MessageRecord> = st
            .records
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit as usize);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn on_message_created(&self, conversation_id: &str) -> Result<PushStream, ServiceError> {
        Ok(self.subscribe(PushKind::Created, conversation_id))
    }

    async fn on_message_updated(&self, conversation_id: &str) -> Result<PushStream, ServiceError> {
        Ok(self.subscribe(PushKind::Updated, conversation_id))
    }
}
