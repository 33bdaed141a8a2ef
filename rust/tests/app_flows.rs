use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use murmur_core::remote::{PushKind, RecordStatus};
use murmur_core::{
    AppReconciler, AppUpdate, ChatApp, InMemoryMessageService, Message, MessageId, MessageStatus,
    Sender, SharedMessageService,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

const CONV: &str = "conv-1";

fn write_config(data_dir: &str, overrides: serde_json::Value) {
    let path = std::path::Path::new(data_dir).join("murmur_config.json");
    let mut v = json!({
        "request_timeout_ms": 2000,
        "resubscribe_delay_ms": 50,
    });
    if let (Some(base), Some(extra)) = (v.as_object_mut(), overrides.as_object()) {
        for (k, val) in extra {
            base.insert(k.clone(), val.clone());
        }
    }
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

struct TestReconciler {
    updates: Arc<Mutex<Vec<AppUpdate>>>,
}

impl TestReconciler {
    fn new() -> (Self, Arc<Mutex<Vec<AppUpdate>>>) {
        let updates = Arc::new(Mutex::new(vec![]));
        (
            Self {
                updates: updates.clone(),
            },
            updates,
        )
    }
}

impl AppReconciler for TestReconciler {
    fn reconcile(&self, update: AppUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

fn start(service: &InMemoryMessageService, config: serde_json::Value) -> (TempDir, Arc<ChatApp>) {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().to_string_lossy().to_string();
    write_config(&data_dir, config);
    let shared: SharedMessageService = Arc::new(service.clone());
    (dir, ChatApp::new(data_dir, shared))
}

/// Open `CONV` and wait for bootstrap to finish and both streams to be live.
fn open(app: &ChatApp, service: &InMemoryMessageService) {
    app.open_conversation(CONV);
    wait_until("conversation open", Duration::from_secs(2), || {
        let s = app.state();
        s.conversation_id.as_deref() == Some(CONV) && !s.is_loading
    });
    wait_until("subscribed", Duration::from_secs(2), || {
        service.subscriber_count(PushKind::Created, CONV) == 1
            && service.subscriber_count(PushKind::Updated, CONV) == 1
    });
}

fn only_message(app: &ChatApp) -> Message {
    let messages = app.messages();
    assert_eq!(messages.len(), 1, "expected exactly one message: {messages:?}");
    messages[0].clone()
}

fn ids(app: &ChatApp) -> Vec<String> {
    app.messages().iter().map(|m| m.id.to_string()).collect()
}

#[test]
fn send_is_visible_before_the_create_completes() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    let (reconciler, updates) = TestReconciler::new();
    app.listen_for_updates(Box::new(reconciler));
    open(&app, &service);

    service.pause_creates(true);
    app.send("  hello  ");
    wait_until("optimistic insert", Duration::from_secs(2), || {
        app.messages().len() == 1
    });

    let pending = only_message(&app);
    assert!(pending.id.is_local());
    assert_eq!(pending.text, "hello");
    assert_eq!(pending.sender, Sender::User);
    assert_eq!(pending.status, MessageStatus::Pending);
    assert!(service.records(CONV).is_empty());

    service.pause_creates(false);
    wait_until("confirmed", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });

    let confirmed = only_message(&app);
    assert_eq!(confirmed.id, MessageId::Server("srv-1".into()));
    assert_eq!(confirmed.timestamp, pending.timestamp);
    assert!(confirmed.server_timestamp.is_some());
    assert_eq!(service.records(CONV).len(), 1);
    assert_eq!(app.last_error(), None);

    let up = updates.lock().unwrap();
    // Revs must be strictly increasing by 1.
    for w in up.windows(2) {
        assert_eq!(w[0].rev() + 1, w[1].rev());
    }
}

#[test]
fn push_arriving_before_the_response_settles_once() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.pause_acks(true);
    app.send("hi");
    wait_until("settled by push", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.id == MessageId::Server("srv-1".into()))
    });
    assert_eq!(only_message(&app).status, MessageStatus::Confirmed);

    service.pause_acks(false);
    wait_until("create answered", Duration::from_secs(2), || {
        service.create_calls() == 1
    });
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ids(&app), vec!["srv-1"]);
    assert_eq!(app.last_error(), None);
}

#[test]
fn response_arriving_before_the_push_settles_once() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.mute_created_events(true);
    app.send("hi");
    wait_until("settled by response", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });

    // Late creation event for our own message, then a marker on the same stream.
    assert!(service.replay_created("srv-1"));
    service.post(CONV, "hello back", Sender::Assistant);
    wait_until("marker delivered", Duration::from_secs(2), || {
        app.messages().len() == 2
    });
    assert_eq!(ids(&app), vec!["srv-1", "srv-2"]);
    assert_eq!(app.messages()[1].sender, Sender::Assistant);
}

#[test]
fn failed_send_retries_to_confirmed() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.fail_next_creates(1);
    app.send("hello");
    wait_until("failed", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_failed())
    });

    wait_until("error surfaced", Duration::from_secs(2), || {
        app.last_error().is_some()
    });
    let failed = only_message(&app);
    assert!(failed.id.is_local());
    assert!(service.records(CONV).is_empty());

    app.retry(failed.id.clone());
    wait_until("confirmed after retry", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });

    let confirmed = only_message(&app);
    assert_eq!(confirmed.id, MessageId::Server("srv-1".into()));
    assert_eq!(confirmed.timestamp, failed.timestamp);
    assert_eq!(service.records(CONV).len(), 1);
    assert_eq!(service.create_calls(), 2);
}

#[test]
fn retry_after_lost_response_does_not_duplicate_server_side() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.mute_created_events(true);
    service.lose_next_create_acks(1);
    app.send("hello");
    wait_until("failed", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_failed())
    });
    // The service did store it.
    assert_eq!(service.records(CONV).len(), 1);

    app.retry(only_message(&app).id);
    wait_until("confirmed after retry", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });

    let records = service.records(CONV);
    assert_eq!(records.len(), 1);
    assert_eq!(only_message(&app).id, MessageId::Server(records[0].id.clone()));
    assert_eq!(service.create_calls(), 2);
}

#[test]
fn rejected_create_retries_through_status_update() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.reject_next_creates(1);
    app.send("hello");
    wait_until("failed with server id", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status.is_failed() && !m.id.is_local())
    });

    app.retry(MessageId::Server("srv-1".into()));
    wait_until("confirmed after retry", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });

    assert_eq!(service.create_calls(), 1);
    assert_eq!(service.update_calls(), 1);
    let records = service.records(CONV);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Some(RecordStatus::Sent));
}

#[test]
fn failed_status_update_can_be_retried_again() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.reject_next_creates(1);
    app.send("hello");
    wait_until("failed with server id", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status.is_failed() && !m.id.is_local())
    });

    service.fail_next_updates(1);
    let id = MessageId::Server("srv-1".into());
    app.retry(id.clone());
    wait_until("update attempted", Duration::from_secs(2), || {
        service.update_calls() == 1
    });
    wait_until("failed again", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_failed())
    });

    app.retry(id);
    wait_until("confirmed", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });
    assert_eq!(service.update_calls(), 2);
}

#[test]
fn late_status_update_success_outranks_a_newer_attempt_failing() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({ "request_timeout_ms": 300 }));
    open(&app, &service);

    service.reject_next_creates(1);
    app.send("hello");
    wait_until("failed with server id", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status.is_failed() && !m.id.is_local())
    });

    // First attempt is applied server-side but its answer is held past the timeout.
    service.mute_updated_events(true);
    service.pause_update_acks(true);
    let id = MessageId::Server("srv-1".into());
    app.retry(id.clone());
    wait_until("first update applied", Duration::from_secs(2), || {
        service.update_calls() == 1
    });
    wait_until("first update timed out", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_failed())
    });

    // Second attempt is held before the service sees it and will fail.
    service.pause_updates(true);
    service.fail_next_updates(1);
    app.retry(id);
    wait_until("second attempt pending", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Pending)
    });

    service.pause_update_acks(false);
    wait_until("confirmed by late success", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });

    service.pause_updates(false);
    wait_until("second attempt answered", Duration::from_secs(2), || {
        service.update_calls() == 2
    });
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(only_message(&app).status, MessageStatus::Confirmed);
    assert_eq!(service.records(CONV)[0].status, Some(RecordStatus::Sent));
}

#[test]
fn timed_out_create_still_reconciles_its_late_success() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({ "request_timeout_ms": 100 }));
    open(&app, &service);

    service.mute_created_events(true);
    service.pause_acks(true);
    app.send("slow");
    wait_until("timed out", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_failed())
    });
    match &only_message(&app).status {
        MessageStatus::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected failed, got {other:?}"),
    }
    wait_until("error surfaced", Duration::from_secs(2), || {
        app.last_error().is_some()
    });

    service.pause_acks(false);
    wait_until("late success reconciled", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });
    assert_eq!(ids(&app), vec!["srv-1"]);
    assert_eq!(service.records(CONV).len(), 1);
}

#[test]
fn superseded_attempt_results_do_not_unsettle_the_message() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({ "request_timeout_ms": 150 }));
    open(&app, &service);

    service.pause_creates(true);
    service.fail_next_creates(1);
    app.send("hello");
    wait_until("first attempt timed out", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_failed())
    });

    app.retry(only_message(&app).id);
    wait_until("retrying", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_pending())
    });

    // Both attempts are released together; one of them fails.
    service.pause_creates(false);
    wait_until("confirmed", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });
    wait_until("both attempts answered", Duration::from_secs(2), || {
        service.create_calls() == 2
    });
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(only_message(&app).status, MessageStatus::Confirmed);
    assert_eq!(service.records(CONV).len(), 1);
}

#[test]
fn retry_of_a_pending_message_is_ignored() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.pause_creates(true);
    app.send("hello");
    wait_until("pending", Duration::from_secs(2), || app.messages().len() == 1);
    app.retry(only_message(&app).id);
    app.retry(MessageId::Local("unknown".into()));

    service.pause_creates(false);
    wait_until("confirmed", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });
    assert_eq!(service.create_calls(), 1);
}

#[test]
fn duplicate_creation_events_are_idempotent() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.post(CONV, "first", Sender::Assistant);
    wait_until("first delivered", Duration::from_secs(2), || {
        app.messages().len() == 1
    });
    service.replay_created("srv-1");
    service.replay_created("srv-1");
    service.post(CONV, "second", Sender::Assistant);
    wait_until("second delivered", Duration::from_secs(2), || {
        app.messages().len() >= 2
    });
    assert_eq!(ids(&app), vec!["srv-1", "srv-2"]);
}

#[test]
fn update_for_unknown_message_is_discarded_and_create_still_inserts() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    let record = service.seed(CONV, "from elsewhere", Sender::from("bob"));
    service.set_status(&record.id, RecordStatus::Sent);
    service.replay_created(&record.id);
    wait_until("created event applied", Duration::from_secs(2), || {
        app.messages().len() == 1
    });
    let m = only_message(&app);
    assert_eq!(m.status, MessageStatus::Confirmed);
    assert_eq!(m.sender, Sender::Participant("bob".into()));

    service.set_status(&record.id, RecordStatus::Error);
    wait_until("later update applied", Duration::from_secs(2), || {
        app.messages().first().is_some_and(|m| m.status.is_failed())
    });
    assert_eq!(app.last_error(), None);
}

#[test]
fn foreign_message_during_a_send_stays_separate() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.mute_created_events(true);
    service.pause_acks(true);
    app.send("hello");
    wait_until("stored", Duration::from_secs(2), || {
        service.records(CONV).len() == 1
    });

    service.post(CONV, "hello", Sender::Assistant);
    wait_until("assistant message", Duration::from_secs(2), || {
        app.messages().len() == 2
    });
    let messages = app.messages();
    assert!(messages[0].id.is_local());
    assert_eq!(messages[1].id, MessageId::Server("srv-2".into()));

    service.pause_acks(false);
    wait_until("own message confirmed", Duration::from_secs(2), || {
        app.messages()[0].status == MessageStatus::Confirmed
    });
    assert_eq!(ids(&app), vec!["srv-1", "srv-2"]);
}

#[test]
fn earlier_message_with_same_text_and_sender_is_not_merged_with_a_send() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    let earlier = service.post(CONV, "hi", Sender::User);
    assert_eq!(earlier.client_id, None);
    wait_until("pushed message", Duration::from_secs(2), || {
        app.messages().len() == 1
    });
    assert_eq!(only_message(&app).id, MessageId::Server("srv-1".into()));

    app.send("hi");
    wait_until("own message confirmed", Duration::from_secs(2), || {
        let messages = app.messages();
        messages.len() == 2 && messages.iter().all(|m| m.status == MessageStatus::Confirmed)
    });
    assert_eq!(ids(&app), vec!["srv-1", "srv-2"]);
    assert!(app.messages().iter().all(|m| m.sender == Sender::User));
    assert_eq!(service.records(CONV).len(), 2);
}

#[test]
fn push_without_client_id_matches_by_fingerprint() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.mute_created_events(true);
    service.pause_acks(true);
    app.send("hello");
    wait_until("stored", Duration::from_secs(2), || {
        service.records(CONV).len() == 1
    });

    let mut payload = serde_json::to_value(&service.records(CONV)[0]).unwrap();
    payload.as_object_mut().unwrap().remove("clientId");
    service.inject(PushKind::Created, CONV, payload);
    wait_until("matched", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.id == MessageId::Server("srv-1".into()))
    });

    service.pause_acks(false);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ids(&app), vec!["srv-1"]);
}

#[test]
fn malformed_push_events_are_discarded() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.inject(PushKind::Created, CONV, json!({ "id": "srv-x" }));
    service.inject(PushKind::Created, CONV, json!("not a record"));
    service.inject(
        PushKind::Created,
        CONV,
        json!({
            "id": "",
            "conversationId": CONV,
            "text": "blank id",
            "sender": "user",
            "timestamp": "2025-11-02T12:34:56Z"
        }),
    );
    service.post(CONV, "valid", Sender::Assistant);
    wait_until("valid delivered", Duration::from_secs(2), || {
        !app.messages().is_empty()
    });
    assert_eq!(ids(&app), vec!["srv-1"]);
    assert_eq!(app.last_error(), None);
}

#[test]
fn push_for_another_conversation_is_ignored() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    let other = service.seed("conv-2", "elsewhere", Sender::Assistant);
    service.inject(
        PushKind::Created,
        CONV,
        serde_json::to_value(&other).unwrap(),
    );
    service.post(CONV, "here", Sender::Assistant);
    wait_until("delivered", Duration::from_secs(2), || {
        !app.messages().is_empty()
    });
    assert_eq!(ids(&app), vec!["srv-2"]);
}

#[test]
fn closing_the_view_releases_subscriptions_and_drops_late_results() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.mute_created_events(true);
    service.pause_acks(true);
    app.send("in flight");
    wait_until("pending", Duration::from_secs(2), || app.messages().len() == 1);

    app.close_conversation();
    wait_until("released", Duration::from_secs(2), || {
        service.subscriber_count(PushKind::Created, CONV) == 0
            && service.subscriber_count(PushKind::Updated, CONV) == 0
    });
    let s = app.state();
    assert_eq!(s.conversation_id, None);
    assert!(s.messages.is_empty());

    service.pause_acks(false);
    std::thread::sleep(Duration::from_millis(200));
    assert!(app.messages().is_empty());

    // Reopening shows the message once, from history.
    open(&app, &service);
    let m = only_message(&app);
    assert_eq!(m.id, MessageId::Server("srv-1".into()));
    assert_eq!(m.status, MessageStatus::Confirmed);
}

#[test]
fn stream_closed_by_the_service_is_resubscribed() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    service.close_streams(CONV);
    wait_until("resubscribed", Duration::from_secs(2), || {
        service.subscriber_count(PushKind::Created, CONV) == 1
            && service.subscriber_count(PushKind::Updated, CONV) == 1
    });
    service.post(CONV, "after reconnect", Sender::Assistant);
    wait_until("delivered", Duration::from_secs(2), || {
        app.messages().len() == 1
    });
    assert_eq!(app.last_error(), None);
}

#[test]
fn bootstrap_loads_recent_history_while_loading() {
    let service = InMemoryMessageService::new();
    service.seed(CONV, "one", Sender::Assistant);
    service.seed(CONV, "two", Sender::User);
    service.seed(CONV, "three", Sender::Assistant);
    service.seed("conv-2", "elsewhere", Sender::Assistant);
    let (_dir, app) = start(&service, json!({ "bootstrap_limit": 2 }));

    service.pause_lists(true);
    app.open_conversation(CONV);
    wait_until("loading", Duration::from_secs(2), || app.is_loading());
    assert!(app.messages().is_empty());

    service.pause_lists(false);
    wait_until("loaded", Duration::from_secs(2), || !app.is_loading());
    let messages = app.messages();
    let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["two", "three"]);
    assert!(messages
        .iter()
        .all(|m| m.status == MessageStatus::Confirmed && !m.id.is_local()));
}

#[test]
fn bootstrap_failure_sets_error_and_live_events_still_apply() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));

    service.fail_next_lists(1);
    open(&app, &service);
    wait_until("error surfaced", Duration::from_secs(2), || {
        app.last_error().is_some()
    });
    assert!(app.messages().is_empty());

    service.post(CONV, "live", Sender::Assistant);
    wait_until("live event applied", Duration::from_secs(2), || {
        app.messages().len() == 1
    });

    app.clear_error();
    wait_until("error cleared", Duration::from_secs(2), || {
        app.last_error().is_none()
    });
}

#[test]
fn send_without_an_open_conversation_sets_error() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));

    app.send("nowhere");
    wait_until("error", Duration::from_secs(2), || app.last_error().is_some());
    assert!(app.messages().is_empty());
    assert_eq!(service.create_calls(), 0);
}

#[test]
fn blank_text_is_not_sent() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({}));
    open(&app, &service);

    app.send("   ");
    app.send("real");
    wait_until("sent", Duration::from_secs(2), || app.messages().len() == 1);
    assert_eq!(only_message(&app).text, "real");
}

#[test]
fn configured_local_sender_is_used() {
    let service = InMemoryMessageService::new();
    let (_dir, app) = start(&service, json!({ "local_sender": "alice", "owner": "alice" }));
    open(&app, &service);

    app.send("hi");
    wait_until("confirmed", Duration::from_secs(2), || {
        app.messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Confirmed)
    });
    assert_eq!(only_message(&app).sender, Sender::Participant("alice".into()));
    let records = service.records(CONV);
    assert_eq!(records[0].owner.as_deref(), Some("alice"));
    assert!(records[0].client_id.is_some());
}
