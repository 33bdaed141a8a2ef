mod bootstrap;
pub(crate) mod config;
mod reconciler;
mod store;
mod subscriptions;
mod sync;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::AppAction;
use crate::remote::SharedMessageService;
use crate::state::AppState;
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use config::AppConfig;
use reconciler::IdentityReconciler;
use store::MessageStore;
use subscriptions::SubscriptionSet;

/// Everything tied to the currently open conversation. Dropping it releases the push
/// subscriptions and forgets all in-flight bookkeeping; late results for it are ignored.
struct ConversationView {
    conversation_id: String,
    // Tags async results so that ones addressed to a previous view can be told apart.
    token: u64,
    store: MessageStore,
    reconciler: IdentityReconciler,
    status_updates: HashMap<String, u64>, // server id -> in-flight attempt
    loading: bool,
    _subscriptions: Option<SubscriptionSet>,
}

impl ConversationView {
    fn new(conversation_id: String, token: u64, match_window_ms: i64) -> Self {
        Self {
            conversation_id,
            token,
            store: MessageStore::default(),
            reconciler: IdentityReconciler::new(match_window_ms),
            status_updates: HashMap::new(),
            loading: false,
            _subscriptions: None,
        }
    }
}

pub struct AppCore {
    pub state: AppState,
    rev: u64,
    attempt_seq: u64,
    view_seq: u64,
    last_outgoing_ts: i64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: AppConfig,
    runtime: tokio::runtime::Runtime,
    service: SharedMessageService,

    view: Option<ConversationView>,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        config: AppConfig,
        shared_state: Arc<RwLock<AppState>>,
        service: SharedMessageService,
    ) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .expect("tokio runtime");

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            attempt_seq: 0,
            view_seq: 0,
            last_outgoing_ts: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            service,
            view: None,
        };

        // Ensure ChatApp::state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempt_seq += 1;
        self.attempt_seq
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit(&mut self, update: impl FnOnce(u64, &AppState) -> AppUpdate) {
        let rev = self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(update(rev, &snapshot));
    }

    fn emit_state(&mut self) {
        match &self.view {
            Some(view) => {
                self.state.conversation_id = Some(view.conversation_id.clone());
                self.state.messages = view.store.snapshot();
                self.state.is_loading = view.loading;
            }
            None => {
                self.state.conversation_id = None;
                self.state.messages.clear();
                self.state.is_loading = false;
            }
        }
        self.emit(|_, s| AppUpdate::FullState(s.clone()));
    }

    fn emit_messages(&mut self) {
        self.state.messages = self
            .view
            .as_ref()
            .map(|v| v.store.snapshot())
            .unwrap_or_default();
        self.emit(|rev, s| AppUpdate::MessagesChanged {
            rev,
            messages: s.messages.clone(),
        });
    }

    fn emit_loading(&mut self) {
        self.state.is_loading = self.view.as_ref().is_some_and(|v| v.loading);
        self.emit(|rev, s| AppUpdate::LoadingChanged {
            rev,
            is_loading: s.is_loading,
        });
    }

    fn emit_error(&mut self) {
        self.emit(|rev, s| AppUpdate::ErrorChanged {
            rev,
            last_error: s.last_error.clone(),
        });
    }

    fn set_error(&mut self, msg: impl Into<String>) {
        // Kept until the UI clears it, so a snapshot taken after a missed update still shows it.
        self.state.last_error = Some(msg.into());
        self.emit_error();
    }

    fn post_internal(sender: &Sender<CoreMsg>, event: InternalEvent) {
        // The actor is gone once the app shuts down; late results are dropped.
        let _ = sender.send(CoreMsg::Internal(Box::new(event)));
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action` directly: it carries message text.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
            CoreMsg::Shutdown => {
                // Release subscriptions before the runtime goes away.
                self.view = None;
            }
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::CreateFinished {
                local_id,
                attempt,
                result,
            } => self.on_create_finished(local_id, attempt, result),
            InternalEvent::CreateTimedOut { local_id, attempt } => {
                self.on_create_timed_out(local_id, attempt)
            }
            InternalEvent::StatusUpdateFinished {
                server_id,
                attempt,
                result,
            } => self.on_status_update_finished(server_id, attempt, result),
            InternalEvent::StatusUpdateTimedOut { server_id, attempt } => {
                self.on_status_update_timed_out(server_id, attempt)
            }
            InternalEvent::BootstrapLoaded { token, result } => {
                self.on_bootstrap_loaded(token, result)
            }
            InternalEvent::PushReceived {
                token,
                kind,
                payload,
            } => self.on_push(token, kind, payload),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::OpenConversation { conversation_id } => {
                let conversation_id = conversation_id.trim().to_string();
                if conversation_id.is_empty() {
                    self.set_error("Conversation id is empty");
                    return;
                }
                if self
                    .view
                    .as_ref()
                    .is_some_and(|v| v.conversation_id == conversation_id)
                {
                    return;
                }
                self.view_seq += 1;
                tracing::info!(%conversation_id, token = self.view_seq, "open_conversation");
                // Replacing the view drops the old one's subscriptions.
                self.view = Some(ConversationView::new(
                    conversation_id,
                    self.view_seq,
                    self.config.match_window_ms(),
                ));
                self.start_bootstrap();
                self.start_subscriptions();
                self.emit_state();
            }
            AppAction::CloseConversation => {
                if let Some(view) = self.view.take() {
                    tracing::info!(conversation_id = %view.conversation_id, "close_conversation");
                }
                self.emit_state();
            }
            AppAction::SendMessage { text } => self.send_message(text),
            AppAction::RetryMessage { message_id } => self.retry_message(message_id),
            AppAction::ClearError => {
                if self.state.last_error.take().is_some() {
                    self.emit_error();
                }
            }
        }
    }
}
