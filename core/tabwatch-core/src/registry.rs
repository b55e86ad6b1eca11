//! The session registry: single owner of every tracked session.
//!
//! The registry consumes detector events, keeps the aggregate active count
//! current, persists the durable and ephemeral subsets through the
//! [`PersistenceBridge`] and hands completions to the
//! [`NotificationDispatcher`]. It is a plain synchronous value; the daemon
//! serializes access to it behind a single actor task.
//!
//! ```text
//! discover ──► Session ◄── apply_state_change / apply_completion
//!                 │
//!                 ├──► PersistenceBridge (durable + ephemeral)
//!                 └──► NotificationDispatcher (monitored sessions only)
//! ```

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::Settings;
use crate::dispatcher::NotificationDispatcher;
use crate::error::{MonitorError, Result};
use crate::persistence::{PersistenceBridge, RestoredSession};
use crate::types::{
    parse_notification_id, ActivationTarget, CompletionRecord, DetectorEvent, Notification,
    Session, SessionDescriptor, SessionState,
};

/// Ids added and removed by one [`SessionRegistry::reconcile`] pass.
/// `purged` lists restored records dropped because their session never came
/// back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub purged: Vec<String>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.purged.is_empty()
    }
}

pub struct SessionRegistry {
    sessions: BTreeMap<String, Session>,
    settings: Settings,
    persistence: PersistenceBridge,
    dispatcher: NotificationDispatcher,
    /// Restored records for ids discovery has not reported yet.
    pending_restore: BTreeMap<String, RestoredSession>,
    restored_at: DateTime<Utc>,
    last_completion_at: HashMap<String, DateTime<Utc>>,
    active_count: usize,
}

impl SessionRegistry {
    /// Builds a registry and loads whatever both persistence tiers hold.
    /// Restored records are applied lazily, when their session is discovered.
    pub fn new(
        settings: Settings,
        persistence: PersistenceBridge,
        dispatcher: NotificationDispatcher,
        now: DateTime<Utc>,
    ) -> Self {
        let pending_restore = persistence.restore(now);
        Self {
            sessions: BTreeMap::new(),
            settings,
            persistence,
            dispatcher,
            pending_restore,
            restored_at: now,
            last_completion_at: HashMap::new(),
            active_count: 0,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replaces settings. Only affects work started afterwards: existing
    /// sessions keep their `monitored` flag and running detectors keep the
    /// timing they were spawned with.
    pub fn update_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Point-in-time copy of every session, ordered by id.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }

    pub fn aggregate_active_count(&self) -> usize {
        self.active_count
    }

    /// Registers a session, seeding it from `restored` (or from the records
    /// loaded at startup). A second call for a known id only refreshes the
    /// display metadata.
    pub fn discover(
        &mut self,
        descriptor: &SessionDescriptor,
        restored: Option<RestoredSession>,
        now: DateTime<Utc>,
    ) -> &Session {
        let entry = match self.sessions.entry(descriptor.id.clone()) {
            Entry::Occupied(entry) => {
                let session = entry.into_mut();
                session.apply_descriptor(descriptor);
                return session;
            }
            Entry::Vacant(entry) => entry,
        };

        let pending = self.pending_restore.remove(&descriptor.id);
        let restored = restored.or(pending).unwrap_or_default();

        let has_durable_record = restored.durable.monitored.is_some();
        let monitored = restored
            .durable
            .monitored
            .unwrap_or(self.settings.auto_enable_enabled);
        let mut session = Session::new(descriptor, monitored, now);
        if let Some(history) = restored.durable.completion_history {
            session.completion_history = history;
        }
        let ephemeral = restored.ephemeral;
        if let Some(state) = ephemeral.state {
            session.state = state;
        }
        if let Some(changed_at) = ephemeral.state_changed_at {
            session.state_changed_at = changed_at;
        }
        session.last_signal_timestamp = ephemeral.last_signal_timestamp;
        session.authoritative_signal = ephemeral.authoritative_signal.unwrap_or(false)
            && session.last_signal_timestamp.is_some();
        session.generation_started_at = ephemeral
            .generation_started_at
            .filter(|_| session.state.is_active());

        info!(
            session_id = %session.id,
            state = session.state.as_str(),
            monitored = session.monitored,
            "Session discovered"
        );

        if !has_durable_record {
            self.persistence.save_durable(&session);
        }
        if session.state.is_active() {
            self.active_count += 1;
        }
        entry.insert(session)
    }

    /// Applies a reported state. No-op for unknown sessions and for a state
    /// the session already holds.
    pub fn apply_state_change(
        &mut self,
        session_id: &str,
        state: SessionState,
        observed_at: DateTime<Utc>,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            debug!(session_id = %session_id, "State change for unknown session ignored");
            return false;
        };
        if session.state == state {
            return false;
        }

        let was_active = session.state.is_active();
        session.state = state;
        session.state_changed_at = observed_at;
        if state.is_active() {
            if !was_active && session.generation_started_at.is_none() {
                session.generation_started_at = Some(observed_at);
            }
        } else {
            session.generation_started_at = None;
        }
        if !session.authoritative_signal {
            session.last_signal_timestamp = Some(observed_at);
        }

        debug!(
            session_id = %session_id,
            state = state.as_str(),
            "Session state changed"
        );
        self.persistence.save_ephemeral(session);
        self.recount();
        true
    }

    /// Records a finished generation and, for monitored sessions, notifies.
    ///
    /// A second completion for the same session inside the dedupe window is
    /// rejected as [`MonitorError::DuplicateCompletion`] and has no effect.
    /// See [`SessionRegistry::dedupe_window_ms`].
    pub fn apply_completion(
        &mut self,
        session_id: &str,
        preview: &str,
        duration_ms: Option<u64>,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let dedupe_window_ms = self.dedupe_window_ms() as i64;
        let Some(session) = self.sessions.get_mut(session_id) else {
            debug!(session_id = %session_id, "Completion for unknown session ignored");
            return Ok(None);
        };

        if let Some(previous) = self.last_completion_at.get(session_id) {
            let delta = (observed_at - *previous).num_milliseconds().abs();
            if delta == 0 || delta < dedupe_window_ms {
                return Err(MonitorError::DuplicateCompletion {
                    session_id: session_id.to_string(),
                });
            }
        }
        self.last_completion_at
            .insert(session_id.to_string(), observed_at);

        session.push_completion(CompletionRecord {
            timestamp: observed_at,
            duration_ms,
            preview: preview.to_string(),
        });
        self.persistence.save_durable(session);

        info!(
            session_id = %session_id,
            duration_ms = ?duration_ms,
            monitored = session.monitored,
            "Generation completed"
        );

        if !session.monitored {
            return Ok(None);
        }
        Ok(self
            .dispatcher
            .dispatch(session, preview, duration_ms, observed_at, &self.settings))
    }

    /// Effective dedupe window. Two genuine completions are always at least
    /// one stability window apart (an inactive edge must settle for the whole
    /// window each time), so the window is capped there and only catches
    /// re-delivery of the same completion.
    pub fn dedupe_window_ms(&self) -> u64 {
        self.settings
            .dedupe_window_ms
            .min(self.settings.stability_window_ms)
    }

    /// Records a timestamp supplied by the signal source itself. From then on
    /// local observation times no longer overwrite it.
    pub fn apply_signal_timestamp(&mut self, session_id: &str, at: DateTime<Utc>) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session.authoritative_signal = true;
        if session.last_signal_timestamp == Some(at) {
            return false;
        }
        session.last_signal_timestamp = Some(at);
        self.persistence.save_ephemeral(session);
        true
    }

    /// Routes one detector event to the matching operation.
    pub fn apply(&mut self, event: DetectorEvent) -> Result<Option<Notification>> {
        match event {
            DetectorEvent::StateChanged(event) => {
                self.apply_state_change(&event.session_id, event.state, event.observed_at);
                Ok(None)
            }
            DetectorEvent::Completion(event) => self.apply_completion(
                &event.session_id,
                &event.preview,
                event.duration_ms,
                event.observed_at,
            ),
            DetectorEvent::SignalTimestamp(event) => {
                self.apply_signal_timestamp(&event.session_id, event.at);
                Ok(None)
            }
        }
    }

    /// Returns the new flag, or `None` for an unknown session.
    pub fn set_monitored(&mut self, session_id: &str, monitored: bool) -> Option<bool> {
        let session = self.sessions.get_mut(session_id)?;
        if session.monitored != monitored {
            session.monitored = monitored;
            self.persistence.save_durable(session);
            info!(session_id = %session_id, monitored, "Monitoring toggled");
        }
        Some(session.monitored)
    }

    /// Forgets a session and purges its persisted state. Removing an unknown
    /// id does nothing.
    pub fn remove(&mut self, session_id: &str) -> bool {
        let known = self.sessions.remove(session_id).is_some();
        let pending = self.pending_restore.remove(session_id).is_some();
        if !known && !pending {
            return false;
        }
        self.last_completion_at.remove(session_id);
        self.persistence.purge(session_id);
        self.recount();
        info!(session_id = %session_id, "Session removed");
        known
    }

    /// Applies one discovery enumeration: unknown ids are discovered, known
    /// ids missing from `descriptors` are removed. Once `restore_grace_ms`
    /// has passed since startup, restored records whose id is still missing
    /// are purged from both tiers.
    pub fn reconcile(
        &mut self,
        descriptors: &[SessionDescriptor],
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let live: BTreeSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
        let mut outcome = ReconcileOutcome::default();

        let gone: Vec<String> = self
            .sessions
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for session_id in gone {
            if self.remove(&session_id) {
                outcome.removed.push(session_id);
            }
        }

        for descriptor in descriptors {
            let known = self.sessions.contains_key(&descriptor.id);
            self.discover(descriptor, None, now);
            if !known {
                outcome.added.push(descriptor.id.clone());
            }
        }

        let grace = chrono::Duration::milliseconds(self.settings.restore_grace_ms as i64);
        if !self.pending_restore.is_empty() && now - self.restored_at >= grace {
            let orphaned: Vec<String> = self
                .pending_restore
                .keys()
                .filter(|id| !live.contains(id.as_str()))
                .cloned()
                .collect();
            for session_id in orphaned {
                self.pending_restore.remove(&session_id);
                self.persistence.purge(&session_id);
                info!(session_id = %session_id, "Purged restored record for vanished session");
                outcome.purged.push(session_id);
            }
        }
        outcome
    }

    /// Ids holding restored records that discovery has not reported yet.
    pub fn pending_restore_ids(&self) -> Vec<String> {
        self.pending_restore.keys().cloned().collect()
    }

    /// Maps a notification id back to the window that should be focused.
    pub fn resolve_activation(&self, notification_id: &str) -> Option<ActivationTarget> {
        let (session_id, _) = parse_notification_id(notification_id)?;
        let session = self.sessions.get(&session_id)?;
        Some(ActivationTarget {
            session_id,
            window_group: session.window_group.clone(),
        })
    }

    /// Pushes every pending persistence write to storage.
    pub fn flush(&mut self) {
        self.persistence.flush();
        debug!(sessions = self.sessions.len(), "Persistence flushed");
    }

    fn recount(&mut self) {
        self.active_count = self
            .sessions
            .values()
            .filter(|session| session.state.is_active())
            .count();
    }
}
