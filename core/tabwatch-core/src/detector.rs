//! Per-session completion detection.
//!
//! A [`Detector`] is a pure state machine: the caller feeds it one
//! [`SignalSample`] per poll via [`Detector::tick`] and wakes it at
//! [`Detector::next_deadline`] via [`Detector::advance`]. It owns its timers
//! as plain deadlines, so cancelling one is just clearing an `Option` and is
//! visible before the next timer is armed. The daemon drives detectors from
//! tokio tasks; tests drive them with synthetic clocks.
//!
//! # Phases
//!
//! ```text
//!            active edge                 inactive edge (start seen)
//!   Idle ───────────────▶ Generating ───────────────────────────▶ settling
//!    ▲                   Thinking/Writing      ▲   content change  │
//!    │                                         └───── restarts ────┤
//!    │  grace elapsed                                               │ window elapsed
//!    └──────────────── Completed ◀──────── CompletionEvent ◀────────┘
//! ```
//!
//! While settling the session still reports its active state; the output may
//! still be streaming after the indicator disappears, and the start timestamp
//! stays set until the completion fires.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::signal::SignalSample;
use crate::types::{
    CompletionEvent, DetectorEvent, SessionState, SignalTimestampEvent, StateChangedEvent,
};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_STABILITY_WINDOW_MS: u64 = 1500;
pub const DEFAULT_COMPLETION_GRACE_MS: u64 = 3000;
pub const DEFAULT_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    pub poll_interval_ms: u64,
    pub stability_window_ms: u64,
    pub completion_grace_ms: u64,
    pub preview_chars: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stability_window_ms: DEFAULT_STABILITY_WINDOW_MS,
            completion_grace_ms: DEFAULT_COMPLETION_GRACE_MS,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

impl DetectorConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn stability_window(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.stability_window_ms as i64)
    }

    fn completion_grace(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.completion_grace_ms as i64)
    }
}

#[derive(Debug, Clone)]
pub struct Detector {
    session_id: String,
    config: DetectorConfig,
    reported: SessionState,
    last_active: bool,
    last_content: String,
    generation_started_at: Option<DateTime<Utc>>,
    generation_stopped_at: Option<DateTime<Utc>>,
    stability_deadline: Option<DateTime<Utc>>,
    grace_deadline: Option<DateTime<Utc>>,
    last_authoritative: Option<DateTime<Utc>>,
}

impl Detector {
    pub fn new(session_id: impl Into<String>, config: DetectorConfig) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            reported: SessionState::Idle,
            last_active: false,
            last_content: String::new(),
            generation_started_at: None,
            generation_stopped_at: None,
            stability_deadline: None,
            grace_deadline: None,
            last_authoritative: None,
        }
    }

    /// Rebuilds a detector for a session whose state survived a restart.
    ///
    /// The restored state is taken as already reported. A generation is only
    /// resumed when its start is known; the first inactive sample then ends
    /// it. An active state without a start settles to `Idle` on the first
    /// inactive sample, so a restart can never manufacture a completion.
    pub fn resume(
        session_id: impl Into<String>,
        config: DetectorConfig,
        state: SessionState,
        generation_started_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut detector = Self::new(session_id, config);
        detector.reported = state;
        detector.last_active = state.is_active();
        if state.is_active() {
            detector.generation_started_at = generation_started_at;
        }
        detector
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.reported
    }

    pub fn generation_started_at(&self) -> Option<DateTime<Utc>> {
        self.generation_started_at
    }

    pub fn is_settling(&self) -> bool {
        self.stability_deadline.is_some()
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.stability_deadline, self.grace_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Processes one poll. Timers due at `now` fire after the sample is
    /// applied, so output that changes exactly at the deadline still restarts
    /// the window.
    pub fn tick(&mut self, now: DateTime<Utc>, sample: &SignalSample) -> Vec<DetectorEvent> {
        let mut events = Vec::new();

        if sample.authoritative_timestamp != self.last_authoritative {
            self.last_authoritative = sample.authoritative_timestamp;
            if let Some(at) = sample.authoritative_timestamp {
                events.push(DetectorEvent::SignalTimestamp(SignalTimestampEvent {
                    session_id: self.session_id.clone(),
                    at,
                }));
            }
        }

        let content_changed = sample.content != self.last_content;
        self.apply_edges(now, sample.active, content_changed);

        let detailed = self.classify(sample, content_changed);
        self.report(detailed, now, &mut events);

        self.last_active = sample.active;
        if content_changed {
            self.last_content.clone_from(&sample.content);
        }

        events.extend(self.advance(now));
        events
    }

    /// Fires every timer due at or before `now`.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<DetectorEvent> {
        let mut events = Vec::new();

        if self.stability_deadline.is_some_and(|deadline| now >= deadline) {
            self.stability_deadline = None;
            let duration_ms = match (self.generation_started_at, self.generation_stopped_at) {
                (Some(start), Some(stop)) => Some((stop - start).num_milliseconds().max(0) as u64),
                _ => None,
            };
            events.push(DetectorEvent::Completion(CompletionEvent {
                session_id: self.session_id.clone(),
                preview: truncate_preview(&self.last_content, self.config.preview_chars),
                duration_ms,
                observed_at: now,
            }));
            self.generation_started_at = None;
            self.generation_stopped_at = None;
            self.grace_deadline = Some(now + self.config.completion_grace());
            self.report(SessionState::Completed, now, &mut events);
        }

        if self.grace_deadline.is_some_and(|deadline| now >= deadline) {
            self.grace_deadline = None;
            self.report(SessionState::Idle, now, &mut events);
        }

        events
    }

    fn apply_edges(&mut self, now: DateTime<Utc>, active: bool, content_changed: bool) {
        match (self.last_active, active) {
            (false, true) => {
                self.stability_deadline = None;
                self.grace_deadline = None;
                self.generation_stopped_at = None;
                if self.generation_started_at.is_none() {
                    self.generation_started_at = Some(now);
                }
            }
            (true, false) => {
                if self.generation_started_at.is_some() {
                    self.generation_stopped_at = Some(now);
                    self.stability_deadline = Some(now + self.config.stability_window());
                } else {
                    debug!(
                        session_id = %self.session_id,
                        "Ignoring inactive edge without an observed start"
                    );
                }
            }
            (false, false) if content_changed && self.stability_deadline.is_some() => {
                self.stability_deadline = Some(now + self.config.stability_window());
            }
            _ => {}
        }
    }

    fn classify(&self, sample: &SignalSample, content_changed: bool) -> SessionState {
        let writing = content_changed && !sample.content.is_empty();

        if !sample.active {
            if self.grace_deadline.is_some() {
                SessionState::Completed
            } else if self.stability_deadline.is_some() {
                if writing {
                    SessionState::Writing
                } else if self.reported.is_active() {
                    self.reported
                } else {
                    SessionState::Generating
                }
            } else {
                SessionState::Idle
            }
        } else if sample.intermediate {
            SessionState::Thinking
        } else if writing {
            SessionState::Writing
        } else {
            SessionState::Generating
        }
    }

    fn report(&mut self, state: SessionState, now: DateTime<Utc>, events: &mut Vec<DetectorEvent>) {
        if state == self.reported {
            return;
        }
        debug!(
            session_id = %self.session_id,
            from = self.reported.as_str(),
            to = state.as_str(),
            "Detector state change"
        );
        self.reported = state;
        events.push(DetectorEvent::StateChanged(StateChangedEvent {
            session_id: self.session_id.clone(),
            state,
            observed_at: now,
        }));
    }
}

/// First `limit` characters of `text` (trimmed), with an ellipsis when cut.
pub fn truncate_preview(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if limit == 0 {
        return String::new();
    }
    let mut chars = trimmed.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{}…", head.trim_end())
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::from_millis;

    fn at(ms: i64) -> DateTime<Utc> {
        from_millis(1_700_000_000_000 + ms).expect("valid timestamp")
    }

    fn detector() -> Detector {
        Detector::new("tab-1", DetectorConfig::default())
    }

    /// Ticks every 500ms from `start` to `end` inclusive, sampling `signal(t)`.
    fn run<F>(detector: &mut Detector, start: i64, end: i64, mut signal: F) -> Vec<(i64, DetectorEvent)>
    where
        F: FnMut(i64) -> SignalSample,
    {
        let mut out = Vec::new();
        let mut t = start;
        while t <= end {
            for event in detector.tick(at(t), &signal(t)) {
                out.push((t, event));
            }
            t += 500;
        }
        out
    }

    fn completions(events: &[(i64, DetectorEvent)]) -> Vec<(i64, CompletionEvent)> {
        events
            .iter()
            .filter_map(|(t, event)| match event {
                DetectorEvent::Completion(completion) => Some((*t, completion.clone())),
                _ => None,
            })
            .collect()
    }

    fn states(events: &[(i64, DetectorEvent)]) -> Vec<(i64, SessionState)> {
        events
            .iter()
            .filter_map(|(t, event)| match event {
                DetectorEvent::StateChanged(change) => Some((*t, change.state)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn stays_idle_without_activity() {
        let mut detector = detector();
        let events = run(&mut detector, 0, 1000, |_| SignalSample::new(false, ""));

        assert!(events.is_empty());
        assert_eq!(detector.state(), SessionState::Idle);
        assert_eq!(detector.next_deadline(), None);
    }

    #[test]
    fn completes_after_stability_window() {
        let mut detector = detector();
        let events = run(&mut detector, 0, 2500, |t| SignalSample::new(t < 1000, ""));

        assert_eq!(
            states(&events),
            vec![(0, SessionState::Generating), (2500, SessionState::Completed)]
        );
        let fired = completions(&events);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 2500);
        assert_eq!(fired[0].1.duration_ms, Some(1000));
        assert_eq!(detector.generation_started_at(), None);
    }

    #[test]
    fn records_start_on_active_edge() {
        let mut detector = detector();
        detector.tick(at(0), &SignalSample::new(true, ""));
        assert_eq!(detector.generation_started_at(), Some(at(0)));

        detector.tick(at(500), &SignalSample::new(true, "").thinking());
        detector.tick(at(1000), &SignalSample::new(true, "hello"));
        assert_eq!(detector.generation_started_at(), Some(at(0)));
    }

    #[test]
    fn content_change_restarts_window() {
        let mut detector = detector();
        let events = run(&mut detector, 0, 4000, |t| {
            let content = if t >= 2000 { "final answer" } else { "" };
            SignalSample::new(t < 1000, content)
        });

        let fired = completions(&events);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 3500);
        assert_eq!(fired[0].1.preview, "final answer");
    }

    #[test]
    fn continuous_streaming_postpones_completion() {
        let mut detector = detector();
        // Output keeps changing every tick until 4000, then goes quiet.
        let events = run(&mut detector, 0, 6000, |t| {
            let content = format!("token {}", t.min(4000));
            SignalSample::new(t < 1000, &content)
        });

        let fired = completions(&events);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 5500);
    }

    #[test]
    fn no_completion_from_cold_start_artifact() {
        let mut detector = detector();
        // Stop-like artifact on load: inactive with leftover content.
        let events = run(&mut detector, 0, 5000, |t| {
            let content = if t >= 1000 { "old reply" } else { "" };
            SignalSample::new(false, content)
        });

        assert!(completions(&events).is_empty());
        assert_eq!(detector.state(), SessionState::Idle);
    }

    #[test]
    fn reactivation_during_window_cancels_timer_and_keeps_start() {
        let mut detector = detector();
        let events = run(&mut detector, 0, 5000, |t| {
            SignalSample::new(t < 1000 || (1500..2500).contains(&t), "")
        });

        let fired = completions(&events);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 4000);
        assert_eq!(fired[0].1.duration_ms, Some(2500));
    }

    #[test]
    fn completed_yields_to_idle_after_grace() {
        let mut detector = detector();
        let events = run(&mut detector, 0, 6000, |t| SignalSample::new(t < 1000, ""));

        assert_eq!(
            states(&events),
            vec![
                (0, SessionState::Generating),
                (2500, SessionState::Completed),
                (5500, SessionState::Idle),
            ]
        );
    }

    #[test]
    fn new_activity_during_grace_skips_idle() {
        let mut detector = detector();
        let events = run(&mut detector, 0, 4000, |t| {
            SignalSample::new(t < 1000 || t >= 3000, "")
        });

        assert_eq!(
            states(&events),
            vec![
                (0, SessionState::Generating),
                (2500, SessionState::Completed),
                (3000, SessionState::Generating),
            ]
        );
        assert_eq!(detector.generation_started_at(), Some(at(3000)));
    }

    #[test]
    fn classifies_thinking_and_writing() {
        let mut detector = detector();
        let events = run(&mut detector, 0, 1500, |t| match t {
            0 => SignalSample::new(true, "").thinking(),
            500 => SignalSample::new(true, "Hel"),
            1000 => SignalSample::new(true, "Hello"),
            _ => SignalSample::new(true, "Hello"),
        });

        assert_eq!(
            states(&events),
            vec![
                (0, SessionState::Thinking),
                (500, SessionState::Writing),
                (1500, SessionState::Generating),
            ]
        );
    }

    #[test]
    fn advance_fires_timer_between_ticks() {
        let mut detector = detector();
        detector.tick(at(0), &SignalSample::new(true, "done"));
        detector.tick(at(1000), &SignalSample::new(false, "done"));

        assert_eq!(detector.next_deadline(), Some(at(2500)));
        assert!(detector.advance(at(2400)).is_empty());
        let events = detector.advance(at(2500));
        assert!(matches!(events[0], DetectorEvent::Completion(_)));
        assert_eq!(detector.state(), SessionState::Completed);
        assert_eq!(detector.next_deadline(), Some(at(5500)));
    }

    #[test]
    fn forwards_authoritative_timestamp_once() {
        let mut detector = detector();
        let mut sample = SignalSample::new(false, "");
        sample.authoritative_timestamp = Some(at(-60_000));

        let first = detector.tick(at(0), &sample);
        let second = detector.tick(at(500), &sample);

        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], DetectorEvent::SignalTimestamp(_)));
        assert!(second.is_empty());
        assert_eq!(detector.state(), SessionState::Idle);
    }

    #[test]
    fn resumed_generation_completes_on_first_inactive_sample() {
        let mut detector = Detector::resume(
            "tab-1",
            DetectorConfig::default(),
            SessionState::Generating,
            Some(at(-300_000)),
        );
        let events = run(&mut detector, 0, 1500, |_| SignalSample::new(false, "answer"));

        let fired = completions(&events);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 1500);
        assert_eq!(fired[0].1.duration_ms, Some(300_000));
    }

    #[test]
    fn resume_without_start_settles_without_completion() {
        let mut detector =
            Detector::resume("tab-1", DetectorConfig::default(), SessionState::Writing, None);
        assert_eq!(detector.state(), SessionState::Writing);

        let events = run(&mut detector, 0, 5000, |_| SignalSample::new(false, ""));

        assert!(completions(&events).is_empty());
        assert_eq!(detector.state(), SessionState::Idle);
        assert_eq!(detector.generation_started_at(), None);
    }

    #[test]
    fn start_is_set_only_while_active() {
        // Deterministic pseudo-random activity and content pattern.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut detector = detector();
        let mut seen_start = false;
        for step in 0..2_000i64 {
            let roll = next();
            let active = roll % 3 == 0;
            let content = format!("chunk {}", (roll >> 8) % 4);
            let sample = SignalSample {
                active,
                intermediate: roll % 7 == 0,
                content,
                authoritative_timestamp: None,
            };
            detector.tick(at(step * 500), &sample);
            seen_start |= active;

            let state = detector.state();
            assert_eq!(
                detector.generation_started_at().is_some(),
                state.is_active(),
                "step {} state {:?}",
                step,
                state
            );
            if !seen_start {
                assert_eq!(state, SessionState::Idle);
            }
        }
    }

    #[test]
    fn truncate_preview_adds_ellipsis() {
        assert_eq!(truncate_preview("  short  ", 100), "short");
        assert_eq!(truncate_preview("abcdef", 3), "abc…");
        assert_eq!(truncate_preview("héllo wörld", 5), "héllo…");
        assert_eq!(truncate_preview("anything", 0), "");
    }
}
