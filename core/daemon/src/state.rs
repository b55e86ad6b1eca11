//! Registry actor owned by the daemon.
//!
//! The [`SessionRegistry`] is single-writer: one task owns it and applies
//! [`Command`]s from an unbounded FIFO channel, so every mutation is
//! serialized and snapshot reads are consistent. Detector tasks and IPC
//! handlers only ever talk to it through that channel.
//!
//! The actor also supervises detector tasks: one per registered session,
//! spawned on discovery and cancelled on removal. Each task is tagged with an
//! epoch; events from a task that has since been replaced are dropped.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tabwatch_core::{
    save_settings, ActivationTarget, Detector, DetectorEvent, MonitorError, MonitorEvent,
    Notification, NotificationSurface, Session, SessionDescriptor, SessionRegistry, Settings,
    SoundPlayer, SoundRequest,
};

use crate::board::SignalBoard;
use crate::poller::DetectorTask;

pub const EVENT_BUFFER: usize = 256;

pub enum Command {
    Detector {
        epoch: u64,
        event: DetectorEvent,
    },
    Reconcile {
        descriptors: Vec<SessionDescriptor>,
    },
    Open {
        descriptor: SessionDescriptor,
        reply: oneshot::Sender<Session>,
    },
    Close {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
    SetMonitored {
        session_id: String,
        monitored: bool,
        reply: oneshot::Sender<Option<bool>>,
    },
    Activate {
        notification_id: String,
        reply: oneshot::Sender<Option<ActivationTarget>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionsSnapshot>,
    },
    GetSettings {
        reply: oneshot::Sender<Settings>,
    },
    UpdateSettings {
        patch: Value,
        reply: oneshot::Sender<SettingsUpdate>,
    },
    Health {
        reply: oneshot::Sender<HealthSnapshot>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsSnapshot {
    pub sessions: Vec<Session>,
    pub active_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsUpdate {
    pub settings: Settings,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    pub sessions: usize,
    pub active_count: usize,
    pub detectors: usize,
    pub watchers: usize,
    pub stale_events_dropped: u64,
    pub duplicate_completions: u64,
}

/// Publishes notifications and sound requests to watchers. Nobody watching
/// is not a delivery failure.
#[derive(Debug, Clone)]
pub struct BroadcastSurface {
    events: broadcast::Sender<MonitorEvent>,
}

impl BroadcastSurface {
    pub fn new(events: broadcast::Sender<MonitorEvent>) -> Self {
        Self { events }
    }

    fn publish(&self, event: MonitorEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("No watchers connected; event dropped");
        }
    }
}

impl NotificationSurface for BroadcastSurface {
    fn present(&self, notification: &Notification) -> tabwatch_core::Result<()> {
        self.publish(MonitorEvent::Notification(notification.clone()));
        Ok(())
    }
}

impl SoundPlayer for BroadcastSurface {
    fn play(&self, request: &SoundRequest) -> tabwatch_core::Result<()> {
        self.publish(MonitorEvent::Sound(request.clone()));
        Ok(())
    }
}

/// Cheap, cloneable client of the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MonitorEvent>,
}

impl RegistryHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn reconcile(&self, descriptors: Vec<SessionDescriptor>) -> Result<(), String> {
        self.send(Command::Reconcile { descriptors })
    }

    pub async fn open(&self, descriptor: SessionDescriptor) -> Result<Session, String> {
        self.request(|reply| Command::Open { descriptor, reply })
            .await
    }

    pub async fn close(&self, session_id: &str) -> Result<bool, String> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Close { session_id, reply })
            .await
    }

    pub async fn set_monitored(
        &self,
        session_id: &str,
        monitored: bool,
    ) -> Result<Option<bool>, String> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::SetMonitored {
            session_id,
            monitored,
            reply,
        })
        .await
    }

    pub async fn activate(&self, notification_id: &str) -> Result<Option<ActivationTarget>, String> {
        let notification_id = notification_id.to_string();
        self.request(|reply| Command::Activate {
            notification_id,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<SessionsSnapshot, String> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn settings(&self) -> Result<Settings, String> {
        self.request(|reply| Command::GetSettings { reply }).await
    }

    pub async fn update_settings(&self, patch: Value) -> Result<SettingsUpdate, String> {
        self.request(|reply| Command::UpdateSettings { patch, reply })
            .await
    }

    pub async fn health(&self) -> Result<HealthSnapshot, String> {
        self.request(|reply| Command::Health { reply }).await
    }

    fn send(&self, command: Command) -> Result<(), String> {
        self.commands
            .send(command)
            .map_err(|_| "Registry actor has stopped".to_string())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, String> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response
            .await
            .map_err(|_| "Registry actor dropped the request".to_string())
    }
}

pub struct RegistryActor {
    registry: SessionRegistry,
    board: SignalBoard,
    detectors: HashMap<String, DetectorTask>,
    next_epoch: u64,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MonitorEvent>,
    settings_path: Option<PathBuf>,
    stale_events_dropped: u64,
    duplicate_completions: u64,
}

impl RegistryActor {
    /// Starts the actor. `events` must be the channel the registry's
    /// dispatcher publishes to, so watchers see notifications and session
    /// updates in one stream. The join handle yields the registry back once
    /// the actor stops so the caller can flush its persistence.
    pub fn spawn(
        registry: SessionRegistry,
        board: SignalBoard,
        events: broadcast::Sender<MonitorEvent>,
        settings_path: Option<PathBuf>,
        shutdown: CancellationToken,
    ) -> (RegistryHandle, JoinHandle<SessionRegistry>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = RegistryHandle {
            commands: commands.clone(),
            events: events.clone(),
        };
        let actor = Self {
            registry,
            board,
            detectors: HashMap::new(),
            next_epoch: 0,
            commands,
            events,
            settings_path,
            stale_events_dropped: 0,
            duplicate_completions: 0,
        };
        let join = tokio::spawn(actor.run(receiver, shutdown));
        (handle, join)
    }

    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> SessionRegistry {
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = receiver.recv() => command,
            };
            let Some(command) = command else {
                break;
            };
            self.handle(command);
        }

        for (_, task) in self.detectors.drain() {
            task.stop();
        }
        tracing::info!("Registry actor stopped");
        self.registry
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Detector { epoch, event } => self.apply_detector_event(epoch, event),
            Command::Reconcile { descriptors } => {
                let outcome = self.registry.reconcile(&descriptors, Utc::now());
                for session_id in &outcome.removed {
                    self.stop_detector(session_id);
                }
                for descriptor in &descriptors {
                    self.ensure_detector(&descriptor.id);
                }
                if !outcome.is_empty() {
                    tracing::info!(
                        added = outcome.added.len(),
                        removed = outcome.removed.len(),
                        purged = outcome.purged.len(),
                        "Discovery reconciled"
                    );
                    self.publish_sessions();
                }
            }
            Command::Open { descriptor, reply } => {
                let session = self
                    .registry
                    .discover(&descriptor, None, Utc::now())
                    .clone();
                self.ensure_detector(&descriptor.id);
                self.publish_sessions();
                let _ = reply.send(session);
            }
            Command::Close { session_id, reply } => {
                self.stop_detector(&session_id);
                let removed = self.registry.remove(&session_id);
                if removed {
                    self.publish_sessions();
                }
                let _ = reply.send(removed);
            }
            Command::SetMonitored {
                session_id,
                monitored,
                reply,
            } => {
                let result = self.registry.set_monitored(&session_id, monitored);
                if result.is_some() {
                    self.publish_sessions();
                }
                let _ = reply.send(result);
            }
            Command::Activate {
                notification_id,
                reply,
            } => {
                let target = self.registry.resolve_activation(&notification_id);
                match &target {
                    Some(target) => {
                        tracing::info!(
                            session_id = %target.session_id,
                            window_group = %target.window_group,
                            "Notification activated"
                        );
                        let _ = self.events.send(MonitorEvent::Focus(target.clone()));
                    }
                    None => {
                        tracing::debug!(notification_id = %notification_id, "Unresolved notification ignored");
                    }
                }
                let _ = reply.send(target);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.sessions_snapshot());
            }
            Command::GetSettings { reply } => {
                let _ = reply.send(self.registry.settings().clone());
            }
            Command::UpdateSettings { patch, reply } => {
                let (settings, rejected) = self.registry.settings().merged_with(&patch);
                if !rejected.is_empty() {
                    tracing::warn!(fields = ?rejected, "Ignoring invalid settings fields");
                }
                if let Some(path) = &self.settings_path {
                    if let Err(err) = save_settings(path, &settings) {
                        tracing::warn!(error = %err, "Failed to save settings");
                    }
                }
                self.registry.update_settings(settings.clone());
                let _ = reply.send(SettingsUpdate { settings, rejected });
            }
            Command::Health { reply } => {
                let _ = reply.send(HealthSnapshot {
                    sessions: self.registry.len(),
                    active_count: self.registry.aggregate_active_count(),
                    detectors: self.detectors.len(),
                    watchers: self.events.receiver_count(),
                    stale_events_dropped: self.stale_events_dropped,
                    duplicate_completions: self.duplicate_completions,
                });
            }
        }
    }

    fn apply_detector_event(&mut self, epoch: u64, event: DetectorEvent) {
        let live_epoch = self
            .detectors
            .get(event.session_id())
            .map(|task| task.epoch);
        if live_epoch != Some(epoch) {
            self.stale_events_dropped += 1;
            tracing::debug!(
                session_id = %event.session_id(),
                epoch,
                live_epoch = ?live_epoch,
                "Dropping event from a stopped detector"
            );
            return;
        }

        let publishes = !matches!(event, DetectorEvent::SignalTimestamp(_));
        match self.registry.apply(event) {
            Ok(_) => {}
            Err(MonitorError::DuplicateCompletion { session_id }) => {
                self.duplicate_completions += 1;
                tracing::debug!(session_id = %session_id, "Duplicate completion dropped");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to apply detector event");
            }
        }
        if publishes {
            self.publish_sessions();
        }
    }

    fn ensure_detector(&mut self, session_id: &str) {
        if self
            .detectors
            .get(session_id)
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let Some(session) = self.registry.get(session_id) else {
            return;
        };

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let detector = Detector::resume(
            session_id,
            self.registry.settings().detector_config(),
            session.state,
            session.generation_started_at,
        );
        let source = Arc::new(self.board.source(session_id));
        let task = DetectorTask::spawn(detector, source, epoch, self.commands.clone());
        tracing::debug!(session_id = %session_id, epoch, "Detector spawned");
        self.detectors.insert(session_id.to_string(), task);
    }

    fn stop_detector(&mut self, session_id: &str) {
        if let Some(task) = self.detectors.remove(session_id) {
            task.stop();
            tracing::debug!(session_id = %session_id, epoch = task.epoch, "Detector stopped");
        }
    }

    fn sessions_snapshot(&self) -> SessionsSnapshot {
        SessionsSnapshot {
            sessions: self.registry.snapshot(),
            active_count: self.registry.aggregate_active_count(),
        }
    }

    fn publish_sessions(&self) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let snapshot = self.sessions_snapshot();
        let _ = self.events.send(MonitorEvent::Sessions {
            sessions: snapshot.sessions,
            active_count: snapshot.active_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabwatch_core::{
        from_millis, CompletionEvent, NotificationDispatcher, PersistenceBridge, SessionState,
        StateChangedEvent,
    };

    fn start() -> (RegistryHandle, broadcast::Receiver<MonitorEvent>, CancellationToken) {
        start_with(SignalBoard::new(std::time::Duration::from_secs(30)))
    }

    fn start_with(
        board: SignalBoard,
    ) -> (RegistryHandle, broadcast::Receiver<MonitorEvent>, CancellationToken) {
        let (events, receiver) = broadcast::channel(EVENT_BUFFER);
        let surface = BroadcastSurface::new(events.clone());
        let registry = SessionRegistry::new(
            Settings::default(),
            PersistenceBridge::in_memory(),
            NotificationDispatcher::new(Box::new(surface.clone()), Box::new(surface)),
            Utc::now(),
        );
        let shutdown = CancellationToken::new();
        let (handle, _join) = RegistryActor::spawn(
            registry,
            board,
            events,
            None,
            shutdown.clone(),
        );
        (handle, receiver, shutdown)
    }

    #[tokio::test]
    async fn open_close_round_trip() {
        let (handle, _events, shutdown) = start();

        let session = handle
            .open(SessionDescriptor::new("tab-1"))
            .await
            .expect("open");
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(handle.snapshot().await.expect("snapshot").sessions.len(), 1);
        assert_eq!(handle.health().await.expect("health").detectors, 1);

        assert!(handle.close("tab-1").await.expect("close"));
        assert!(!handle.close("tab-1").await.expect("close twice"));
        assert!(handle.snapshot().await.expect("snapshot").sessions.is_empty());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_is_removed_by_discovery() {
        use tabwatch_core::SessionCatalog;

        let board = SignalBoard::new(std::time::Duration::from_secs(30));
        let (handle, _events, shutdown) = start_with(board.clone());
        board.open(SessionDescriptor::new("tab-1"));
        handle
            .open(SessionDescriptor::new("tab-1"))
            .await
            .expect("open");

        handle.reconcile(board.live_sessions()).expect("reconcile");
        assert_eq!(handle.health().await.expect("health").sessions, 1);

        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        handle.reconcile(board.live_sessions()).expect("reconcile");

        let health = handle.health().await.expect("health");
        assert_eq!(health.sessions, 0);
        assert_eq!(health.detectors, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn stale_epoch_events_are_dropped() {
        let (handle, _events, shutdown) = start();
        handle
            .open(SessionDescriptor::new("tab-1"))
            .await
            .expect("open");

        handle
            .send(Command::Detector {
                epoch: 99,
                event: DetectorEvent::StateChanged(StateChangedEvent {
                    session_id: "tab-1".to_string(),
                    state: SessionState::Writing,
                    observed_at: Utc::now(),
                }),
            })
            .expect("send");

        let health = handle.health().await.expect("health");
        assert_eq!(health.stale_events_dropped, 1);
        assert_eq!(health.active_count, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn completion_reaches_watchers_and_activation_focuses() {
        let (handle, mut events, shutdown) = start();
        let descriptor = SessionDescriptor {
            window_group: "window-9".to_string(),
            ..SessionDescriptor::new("tab-1")
        };
        handle.open(descriptor).await.expect("open");

        // Epoch 0 belongs to the detector spawned by `open`.
        let observed_at = from_millis(1_700_000_000_000).unwrap();
        handle
            .send(Command::Detector {
                epoch: 0,
                event: DetectorEvent::Completion(CompletionEvent {
                    session_id: "tab-1".to_string(),
                    preview: "All done".to_string(),
                    duration_ms: Some(65_000),
                    observed_at,
                }),
            })
            .expect("send");
        handle.health().await.expect("barrier");

        let mut notification = None;
        while let Ok(event) = events.try_recv() {
            if let MonitorEvent::Notification(sent) = event {
                notification = Some(sent);
            }
        }
        let notification = notification.expect("notification broadcast");
        assert_eq!(notification.body, "Finished in 1m 05s\nAll done");

        let target = handle
            .activate(&notification.id)
            .await
            .expect("activate")
            .expect("target");
        assert_eq!(target.window_group, "window-9");
        let mut focused = false;
        while let Ok(event) = events.try_recv() {
            focused |= matches!(event, MonitorEvent::Focus(_));
        }
        assert!(focused);
        assert!(handle.activate("nope").await.expect("activate").is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn settings_updates_report_rejected_fields() {
        let (handle, _events, shutdown) = start();
        let update = handle
            .update_settings(serde_json::json!({ "sound_volume": 0.2, "preview_length": -3 }))
            .await
            .expect("update");
        assert_eq!(update.settings.sound_volume, 0.2);
        assert_eq!(update.rejected, vec!["preview_length".to_string()]);
        assert_eq!(handle.settings().await.expect("settings").sound_volume, 0.2);
        shutdown.cancel();
    }
}
