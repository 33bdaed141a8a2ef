//! Optimistic message sync for a chat view.
//!
//! [`ChatApp`] owns a single-threaded actor that holds the open conversation's message
//! store. Sends are inserted locally before the network is touched and swapped to their
//! server identity once the service (or its push stream) confirms them.

mod actions;
mod core;
mod error;
mod logging;
pub mod remote;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::Receiver;

pub use actions::AppAction;
pub use crate::core::config::{load_app_config, AppConfig, CONFIG_FILE_NAME};
pub use error::*;
pub use remote::{InMemoryMessageService, MessageService, SharedMessageService};
pub use state::*;
pub use updates::*;

pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

pub struct ChatApp {
    core_tx: flume::Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

impl ChatApp {
    /// Start the app with logging and config rooted at `data_dir`.
    pub fn new(data_dir: String, service: SharedMessageService) -> Arc<Self> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, "ChatApp::new() starting");
        let config = load_app_config(&data_dir);
        Self::with_config(config, service)
    }

    pub fn with_config(config: AppConfig, service: SharedMessageService) -> Arc<Self> {
        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                config,
                shared_for_core,
                service,
            );
            while let Ok(msg) = core_rx.recv() {
                let shutdown = matches!(msg, CoreMsg::Shutdown);
                core.handle_message(msg);
                if shutdown {
                    break;
                }
            }
            tracing::debug!("app actor stopped");
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        })
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    /// Ordered messages of the open conversation, as of the last committed update.
    pub fn messages(&self) -> Vec<Message> {
        self.state().messages
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error
    }

    pub fn open_conversation(&self, conversation_id: impl Into<String>) {
        self.dispatch(AppAction::OpenConversation {
            conversation_id: conversation_id.into(),
        });
    }

    pub fn close_conversation(&self) {
        self.dispatch(AppAction::CloseConversation);
    }

    pub fn send(&self, text: impl Into<String>) {
        self.dispatch(AppAction::SendMessage { text: text.into() });
    }

    pub fn retry(&self, message_id: MessageId) {
        self.dispatch(AppAction::RetryMessage { message_id });
    }

    pub fn clear_error(&self) {
        self.dispatch(AppAction::ClearError);
    }
}

impl Drop for ChatApp {
    fn drop(&mut self) {
        let _ = self.core_tx.send(CoreMsg::Shutdown);
    }
}
