//! Per-session detector tasks.
//!
//! Each monitored session gets one tokio task that samples its
//! [`SignalSource`] every poll interval, feeds the readings to a
//! [`Detector`] and forwards the resulting events to the registry actor.
//! Between polls the task also sleeps until the detector's next deadline so
//! the stability window and grace period fire on time rather than on the next
//! poll.
//!
//! Stopping a task cancels its token; the loop exits at its next suspension
//! point. Every event carries the task's epoch so the actor can drop events
//! from a task that was already replaced.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tabwatch_core::{Detector, DetectorEvent, SignalSample, SignalSource};

use crate::state::Command;

/// Maps tokio's clock onto wall-clock timestamps. Detectors speak
/// `DateTime<Utc>`; anchoring to `tokio::time::Instant` keeps them on the
/// runtime's clock, which tests can pause and advance.
#[derive(Debug, Clone, Copy)]
struct TaskClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
}

impl TaskClock {
    fn start() -> Self {
        Self {
            origin: Instant::now(),
            origin_utc: Utc::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        match chrono::Duration::from_std(elapsed) {
            Ok(elapsed) => self.origin_utc + elapsed,
            Err(_) => Utc::now(),
        }
    }

    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        match (at - self.origin_utc).to_std() {
            Ok(offset) => self.origin + offset,
            // Deadline before the origin: already due.
            Err(_) => self.origin,
        }
    }
}

pub struct DetectorTask {
    pub epoch: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl DetectorTask {
    pub fn spawn(
        detector: Detector,
        source: Arc<dyn SignalSource>,
        epoch: u64,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_detector(
            detector,
            source,
            epoch,
            commands,
            cancel.clone(),
        ));
        Self {
            epoch,
            cancel,
            join,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for DetectorTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_detector(
    mut detector: Detector,
    source: Arc<dyn SignalSource>,
    epoch: u64,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) {
    let clock = TaskClock::start();
    let mut ticker = tokio::time::interval(detector.config().poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        session_id = %detector.session_id(),
        epoch,
        "Detector task started"
    );

    loop {
        let deadline = detector.next_deadline().map(|at| clock.instant_at(at));
        let events = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let sample = SignalSample::read(detector.session_id(), source.as_ref());
                detector.tick(clock.now(), &sample)
            }
            _ = sleep_until(deadline), if deadline.is_some() => detector.advance(clock.now()),
        };

        if !forward(&commands, epoch, events) {
            break;
        }
    }

    tracing::debug!(
        session_id = %detector.session_id(),
        epoch,
        "Detector task stopped"
    );
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Returns false once the actor is gone.
fn forward(
    commands: &mpsc::UnboundedSender<Command>,
    epoch: u64,
    events: Vec<DetectorEvent>,
) -> bool {
    for event in events {
        if commands.send(Command::Detector { epoch, event }).is_err() {
            return false;
        }
    }
    true
}
