use super::AppCore;
use crate::error::ServiceError;
use crate::remote::MessageRecord;
use crate::updates::InternalEvent;

impl AppCore {
    pub(super) fn start_bootstrap(&mut self) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        view.loading = true;

        let token = view.token;
        let conversation_id = view.conversation_id.clone();
        let limit = self.config.bootstrap_limit();
        let timeout = self.config.request_timeout();
        let service = self.service.clone();
        let tx = self.core_sender.clone();
        tracing::debug!(%conversation_id, limit, "bootstrap: start");

        self.runtime.spawn(async move {
            let result =
                match tokio::time::timeout(timeout, service.list_messages(&conversation_id, limit))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Timeout),
                };
            AppCore::post_internal(&tx, InternalEvent::BootstrapLoaded { token, result });
        });
    }

    pub(super) fn on_bootstrap_loaded(
        &mut self,
        token: u64,
        result: Result<Vec<MessageRecord>, ServiceError>,
    ) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        if view.token != token {
            tracing::debug!(token, "bootstrap for a previous view ignored");
            return;
        }
        view.loading = false;

        match result {
            Ok(records) => {
                let fetched = records.len();
                // Same path as creation events, so anything pushed in the meantime is not doubled.
                let mut applied = 0;
                for record in &records {
                    if record.conversation_id == view.conversation_id
                        && view.apply_server_record(record)
                    {
                        applied += 1;
                    }
                }
                tracing::info!(conversation_id = %view.conversation_id, fetched, applied, "bootstrap: loaded");
                if applied > 0 {
                    self.emit_messages();
                }
                self.emit_loading();
            }
            Err(e) => {
                tracing::warn!(conversation_id = %view.conversation_id, %e, "bootstrap failed");
                self.emit_loading();
                self.set_error(format!("Failed to load messages: {e}"));
            }
        }
    }
}
