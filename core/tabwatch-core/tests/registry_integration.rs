use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tabwatch_core::{
    from_millis, Detector, DetectorConfig, JsonFileStore, MemoryStore, MonitorError,
    Notification, NotificationDispatcher, NotificationSurface, PersistenceBridge, SessionDescriptor,
    SessionRegistry, SessionState, Settings, SignalSample, SoundPlayer, SoundRequest,
};

#[derive(Clone, Default)]
struct RecordingSurface {
    notifications: Arc<Mutex<Vec<Notification>>>,
    sounds: Arc<Mutex<Vec<SoundRequest>>>,
}

impl RecordingSurface {
    fn notification_count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }

    fn sound_count(&self) -> usize {
        self.sounds.lock().unwrap().len()
    }
}

impl NotificationSurface for RecordingSurface {
    fn present(&self, notification: &Notification) -> tabwatch_core::Result<()> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

impl SoundPlayer for RecordingSurface {
    fn play(&self, request: &SoundRequest) -> tabwatch_core::Result<()> {
        self.sounds.lock().unwrap().push(request.clone());
        Ok(())
    }
}

fn now() -> DateTime<Utc> {
    from_millis(1_700_000_000_000).unwrap()
}

fn registry_with(
    durable: MemoryStore,
    ephemeral: MemoryStore,
    surface: RecordingSurface,
) -> SessionRegistry {
    SessionRegistry::new(
        Settings::default(),
        PersistenceBridge::new(Box::new(durable), Box::new(ephemeral)),
        NotificationDispatcher::new(Box::new(surface.clone()), Box::new(surface)),
        now(),
    )
}

fn recount(registry: &SessionRegistry) -> usize {
    registry
        .snapshot()
        .iter()
        .filter(|session| session.state.is_active())
        .count()
}

#[test]
fn restored_state_survives_discovery() {
    let five_minutes_ago = now() - TimeDelta::minutes(5);
    let durable = MemoryStore::with_records([(
        "tab-1".to_string(),
        json!({ "monitored": true }),
    )]);
    let ephemeral = MemoryStore::with_records([(
        "tab-1".to_string(),
        json!({
            "state": "Generating",
            "state_changed_at": five_minutes_ago.timestamp_millis(),
        }),
    )]);
    let mut registry = registry_with(durable, ephemeral, RecordingSurface::default());

    let session = registry.discover(&SessionDescriptor::new("tab-1"), None, now());

    assert!(session.monitored);
    assert_eq!(session.state, SessionState::Generating);
    assert_eq!(session.state_changed_at, five_minutes_ago);
    assert_eq!(session.generation_started_at, None);
    assert_eq!(registry.aggregate_active_count(), 1);
}

#[test]
fn invalid_restored_fields_fall_back_individually() {
    let ephemeral = MemoryStore::with_records([(
        "tab-1".to_string(),
        json!({
            "state": "Melting",
            "state_changed_at": "yesterday",
            "last_signal_timestamp": now().timestamp_millis() - 1000,
        }),
    )]);
    let durable = MemoryStore::with_records([(
        "tab-1".to_string(),
        json!({ "monitored": "yes", "completion_history": [{ "timestamp": -4 }] }),
    )]);
    let mut registry = registry_with(durable, ephemeral, RecordingSurface::default());

    let session = registry.discover(&SessionDescriptor::new("tab-1"), None, now());

    assert_eq!(session.state, SessionState::Idle);
    assert_eq!(session.state_changed_at, now());
    assert_eq!(
        session.last_signal_timestamp,
        Some(now() - TimeDelta::milliseconds(1000))
    );
    assert!(session.monitored, "falls back to auto-enable");
    assert!(session.completion_history.is_empty());
}

#[test]
fn near_simultaneous_completions_notify_once() {
    let surface = RecordingSurface::default();
    let mut registry = registry_with(MemoryStore::new(), MemoryStore::new(), surface.clone());
    registry.discover(&SessionDescriptor::new("tab-1"), None, now());

    let first = registry.apply_completion("tab-1", "Done", Some(900), now());
    let second = registry.apply_completion(
        "tab-1",
        "Done",
        Some(900),
        now() + TimeDelta::milliseconds(1),
    );

    assert!(matches!(first, Ok(Some(_))));
    assert!(matches!(
        second,
        Err(MonitorError::DuplicateCompletion { .. })
    ));
    assert_eq!(surface.notification_count(), 1);
    assert_eq!(surface.sound_count(), 1);
    assert_eq!(
        registry.get("tab-1").unwrap().completion_history.len(),
        1
    );
}

#[test]
fn history_keeps_five_newest_first() {
    let durable = MemoryStore::new();
    let mut registry = registry_with(durable.clone(), MemoryStore::new(), RecordingSurface::default());
    registry.discover(&SessionDescriptor::new("tab-1"), None, now());

    for index in 0..7 {
        let at = now() + TimeDelta::seconds(10 * index);
        registry
            .apply_completion("tab-1", &format!("reply {}", index), None, at)
            .expect("completion");
    }

    let history = &registry.get("tab-1").unwrap().completion_history;
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].preview, "reply 6");
    assert_eq!(history[4].preview, "reply 2");

    let stored = durable.get("tab-1").expect("durable record");
    assert_eq!(stored["completion_history"].as_array().unwrap().len(), 5);
}

#[test]
fn discover_and_remove_are_idempotent() {
    let durable = MemoryStore::new();
    let ephemeral = MemoryStore::new();
    let mut registry = registry_with(durable.clone(), ephemeral.clone(), RecordingSurface::default());

    registry.discover(&SessionDescriptor::new("tab-1"), None, now());
    registry.apply_state_change("tab-1", SessionState::Writing, now());
    let renamed = SessionDescriptor {
        title: "Renamed".to_string(),
        ..SessionDescriptor::new("tab-1")
    };
    let session = registry.discover(&renamed, None, now());
    assert_eq!(session.title, "Renamed");
    assert_eq!(session.state, SessionState::Writing);
    assert_eq!(registry.len(), 1);

    assert!(registry.remove("tab-1"));
    assert!(!registry.remove("tab-1"));
    assert!(registry.is_empty());
    assert!(durable.get("tab-1").is_none());
    assert!(ephemeral.get("tab-1").is_none());
    assert_eq!(registry.aggregate_active_count(), 0);
}

#[test]
fn aggregate_count_matches_recount_after_every_mutation() {
    let mut registry = registry_with(MemoryStore::new(), MemoryStore::new(), RecordingSurface::default());
    let states = [
        SessionState::Generating,
        SessionState::Thinking,
        SessionState::Completed,
        SessionState::Writing,
        SessionState::Idle,
    ];

    for step in 0..40usize {
        let id = format!("tab-{}", step % 4);
        let at = now() + TimeDelta::milliseconds(step as i64 * 100);
        match step % 7 {
            0 => {
                registry.discover(&SessionDescriptor::new(id.clone()), None, at);
            }
            5 => {
                registry.remove(&id);
            }
            _ => {
                registry.discover(&SessionDescriptor::new(id.clone()), None, at);
                registry.apply_state_change(&id, states[step % states.len()], at);
            }
        }
        assert_eq!(registry.aggregate_active_count(), recount(&registry), "step {}", step);
    }
}

#[test]
fn reconcile_adds_and_removes() {
    let mut registry = registry_with(MemoryStore::new(), MemoryStore::new(), RecordingSurface::default());
    registry.reconcile(
        &[SessionDescriptor::new("a"), SessionDescriptor::new("b")],
        now(),
    );

    let outcome = registry.reconcile(
        &[SessionDescriptor::new("b"), SessionDescriptor::new("c")],
        now(),
    );

    assert_eq!(outcome.added, vec!["c".to_string()]);
    assert_eq!(outcome.removed, vec!["a".to_string()]);
    let ids: Vec<String> = registry.snapshot().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
}

#[test]
fn detector_events_drive_a_notification_end_to_end() {
    let surface = RecordingSurface::default();
    let mut registry = registry_with(MemoryStore::new(), MemoryStore::new(), surface.clone());
    let descriptor = SessionDescriptor {
        window_group: "window-2".to_string(),
        title: "Research".to_string(),
        ..SessionDescriptor::new("tab-1")
    };
    registry.discover(&descriptor, None, now());

    let mut detector = Detector::new("tab-1", DetectorConfig::default());
    let at = |ms: i64| now() + TimeDelta::milliseconds(ms);
    let mut events = Vec::new();
    events.extend(detector.tick(at(0), &SignalSample::new(true, "The answer")));
    events.extend(detector.tick(at(500), &SignalSample::new(true, "The answer is 42.")));
    events.extend(detector.tick(at(1000), &SignalSample::new(false, "The answer is 42.")));
    events.extend(detector.advance(at(2500)));

    for event in events {
        registry.apply(event).expect("apply");
    }

    let session = registry.get("tab-1").unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.generation_started_at, None);
    assert_eq!(session.completion_history[0].duration_ms, Some(1000));

    let notifications = surface.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].window_group, "window-2");
    assert!(notifications[0].body.starts_with("Finished in 1s"));
    let target = registry
        .resolve_activation(&notifications[0].id)
        .expect("activation target");
    assert_eq!(target.window_group, "window-2");
}

#[test]
fn file_backed_state_survives_registry_restart() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let durable_path = temp_dir.path().join("durable.json");
    let ephemeral_path = temp_dir.path().join("ephemeral.json");
    let open = || {
        SessionRegistry::new(
            Settings::default(),
            PersistenceBridge::new(
                Box::new(JsonFileStore::open(&durable_path)),
                Box::new(JsonFileStore::open(&ephemeral_path)),
            ),
            NotificationDispatcher::logging(),
            now(),
        )
    };

    {
        let mut registry = open();
        registry.discover(&SessionDescriptor::new("tab-1"), None, now());
        registry.set_monitored("tab-1", false);
        registry.apply_state_change("tab-1", SessionState::Thinking, now());
    }

    let mut registry = open();
    let session = registry.discover(&SessionDescriptor::new("tab-1"), None, now());
    assert!(!session.monitored);
    assert_eq!(session.state, SessionState::Thinking);
    assert_eq!(session.generation_started_at, Some(now()));
}

#[test]
fn back_to_back_generations_each_notify_with_short_window() {
    let surface = RecordingSurface::default();
    let settings = Settings {
        poll_interval_ms: 100,
        stability_window_ms: 300,
        completion_grace_ms: 300,
        ..Settings::default()
    };
    let mut registry = SessionRegistry::new(
        settings.clone(),
        PersistenceBridge::in_memory(),
        NotificationDispatcher::new(Box::new(surface.clone()), Box::new(surface.clone())),
        now(),
    );
    registry.discover(&SessionDescriptor::new("tab-1"), None, now());

    let mut detector = Detector::new("tab-1", settings.detector_config());
    let mut completions = 0;
    for step in 0..=30i64 {
        let ms = step * 100;
        let sample = match ms {
            0..=400 => SignalSample::new(true, "first reply"),
            500..=900 => SignalSample::new(false, "first reply"),
            1000..=1400 => SignalSample::new(true, "second reply"),
            _ => SignalSample::new(false, "second reply"),
        };
        for event in detector.tick(now() + TimeDelta::milliseconds(ms), &sample) {
            if matches!(event, tabwatch_core::DetectorEvent::Completion(_)) {
                completions += 1;
            }
            registry.apply(event).expect("no completion is a duplicate");
        }
    }

    assert_eq!(completions, 2);
    assert_eq!(surface.notification_count(), 2);
    let history = &registry.get("tab-1").unwrap().completion_history;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].preview, "second reply");
    assert_eq!(history[1].preview, "first reply");
}

#[test]
fn restored_records_for_vanished_sessions_are_purged_after_grace() {
    let durable = MemoryStore::with_records([
        ("closed-while-down".to_string(), json!({ "monitored": true })),
        ("live-tab".to_string(), json!({ "monitored": false })),
    ]);
    let ephemeral = MemoryStore::with_records([(
        "closed-while-down".to_string(),
        json!({ "state": "Writing", "state_changed_at": now().timestamp_millis() }),
    )]);
    let mut registry = registry_with(durable.clone(), ephemeral.clone(), RecordingSurface::default());
    let grace = TimeDelta::milliseconds(Settings::default().restore_grace_ms as i64);
    let live = [SessionDescriptor::new("live-tab")];

    let early = registry.reconcile(&live, now() + TimeDelta::seconds(1));
    assert!(early.purged.is_empty());
    assert!(!registry.get("live-tab").unwrap().monitored);
    assert!(durable.get("closed-while-down").is_some());
    assert_eq!(registry.pending_restore_ids(), vec!["closed-while-down".to_string()]);

    let late = registry.reconcile(&live, now() + grace);
    assert_eq!(late.purged, vec!["closed-while-down".to_string()]);
    assert!(durable.get("closed-while-down").is_none());
    assert!(ephemeral.get("closed-while-down").is_none());
    assert!(registry.pending_restore_ids().is_empty());
    assert!(durable.get("live-tab").is_some());

    let again = registry.reconcile(&live, now() + grace + grace);
    assert!(again.is_empty());
}

#[test]
fn authoritative_timestamp_survives_restart() {
    let durable = MemoryStore::new();
    let ephemeral = MemoryStore::new();
    let page_time = now() - TimeDelta::seconds(40);

    {
        let mut registry =
            registry_with(durable.clone(), ephemeral.clone(), RecordingSurface::default());
        registry.discover(&SessionDescriptor::new("tab-1"), None, now());
        assert!(registry.apply_signal_timestamp("tab-1", page_time));
    }

    let later = now() + TimeDelta::seconds(5);
    let mut registry = registry_with(durable, ephemeral.clone(), RecordingSurface::default());
    registry.discover(&SessionDescriptor::new("tab-1"), None, later);
    assert!(registry.apply_state_change("tab-1", SessionState::Generating, later));

    let session = registry.get("tab-1").expect("session");
    assert_eq!(session.last_signal_timestamp, Some(page_time));
    assert_eq!(session.state_changed_at, later);
    assert_eq!(
        ephemeral.get("tab-1").expect("record")["authoritative_signal"],
        json!(true)
    );
}
