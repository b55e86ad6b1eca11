//! Turns completions into user-facing notifications and sound requests.
//!
//! Presentation is delegated: the dispatcher only composes the message and
//! hands it to a [`NotificationSurface`] and a [`SoundPlayer`]. Delivery
//! failures are logged and swallowed; a missed notification must never
//! disturb the registry.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::detector::truncate_preview;
use crate::error::Result;
use crate::types::{notification_id, Notification, Session, SoundRequest};

const DEFAULT_TITLE: &str = "Response ready";

/// Shows a notification to the user (system banner, broadcast channel, ...).
pub trait NotificationSurface: Send {
    fn present(&self, notification: &Notification) -> Result<()>;
}

pub trait SoundPlayer: Send {
    fn play(&self, request: &SoundRequest) -> Result<()>;
}

/// Surface that only logs. Used when nothing is listening.
#[derive(Debug, Default)]
pub struct LogSurface;

impl NotificationSurface for LogSurface {
    fn present(&self, notification: &Notification) -> Result<()> {
        debug!(id = %notification.id, title = %notification.title, "Notification");
        Ok(())
    }
}

impl SoundPlayer for LogSurface {
    fn play(&self, request: &SoundRequest) -> Result<()> {
        debug!(session_id = %request.session_id, sound = %request.sound_id, "Sound");
        Ok(())
    }
}

pub struct NotificationDispatcher {
    surface: Box<dyn NotificationSurface>,
    sound: Box<dyn SoundPlayer>,
}

impl NotificationDispatcher {
    pub fn new(surface: Box<dyn NotificationSurface>, sound: Box<dyn SoundPlayer>) -> Self {
        Self { surface, sound }
    }

    pub fn logging() -> Self {
        Self::new(Box::new(LogSurface), Box::new(LogSurface))
    }

    /// Delivers one completion. Returns the notification that was handed to
    /// the surface, if notifications are enabled.
    pub fn dispatch(
        &self,
        session: &Session,
        preview: &str,
        duration_ms: Option<u64>,
        at: DateTime<Utc>,
        settings: &Settings,
    ) -> Option<Notification> {
        let notification = settings.notifications_enabled.then(|| Notification {
            id: notification_id(&session.id, at),
            session_id: session.id.clone(),
            window_group: session.window_group.clone(),
            title: notification_title(session),
            body: compose_body(preview, duration_ms, settings.preview_length),
            created_at: at,
        });

        if let Some(notification) = &notification {
            if let Err(err) = self.surface.present(notification) {
                warn!(session_id = %session.id, error = %err, "Notification delivery failed");
            }
        }

        if settings.sound_enabled {
            let request = SoundRequest {
                session_id: session.id.clone(),
                sound_id: settings.selected_sound.clone(),
                volume: settings.sound_volume,
            };
            if let Err(err) = self.sound.play(&request) {
                warn!(session_id = %session.id, error = %err, "Sound delivery failed");
            }
        }

        notification
    }
}

fn notification_title(session: &Session) -> String {
    let title = session.title.trim();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title.to_string()
    }
}

/// Notification body: an optional "Finished in ..." line followed by the
/// preview cut to `preview_length` characters (0 hides it).
pub fn compose_body(preview: &str, duration_ms: Option<u64>, preview_length: usize) -> String {
    let mut lines = Vec::new();
    if let Some(ms) = duration_ms {
        lines.push(format!("Finished in {}", format_duration(ms)));
    }
    if preview_length > 0 {
        let text = truncate_preview(preview, preview_length);
        if !text.is_empty() {
            lines.push(text);
        }
    }
    if lines.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    lines.join("\n")
}

/// Compact human duration: `"<1s"`, `"42s"`, `"1m 05s"`, `"2h 03m"`.
pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    if total_secs == 0 {
        return "<1s".to_string();
    }
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::types::{from_millis, SessionDescriptor};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        notifications: Arc<Mutex<Vec<Notification>>>,
        sounds: Arc<Mutex<Vec<SoundRequest>>>,
    }

    impl NotificationSurface for Recorder {
        fn present(&self, notification: &Notification) -> Result<()> {
            self.notifications.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    impl SoundPlayer for Recorder {
        fn play(&self, request: &SoundRequest) -> Result<()> {
            self.sounds.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct Failing;

    impl NotificationSurface for Failing {
        fn present(&self, _: &Notification) -> Result<()> {
            Err(MonitorError::delivery("banner", "denied"))
        }
    }

    impl SoundPlayer for Failing {
        fn play(&self, _: &SoundRequest) -> Result<()> {
            Err(MonitorError::delivery("sound", "no device"))
        }
    }

    fn session() -> Session {
        let descriptor = SessionDescriptor {
            id: "tab-3".to_string(),
            window_group: "window-1".to_string(),
            title: "Chat".to_string(),
            locator: String::new(),
        };
        Session::new(&descriptor, true, from_millis(0).unwrap())
    }

    #[test]
    fn durations_format_compactly() {
        assert_eq!(format_duration(400), "<1s");
        assert_eq!(format_duration(42_000), "42s");
        assert_eq!(format_duration(65_000), "1m 05s");
        assert_eq!(format_duration(7_380_000), "2h 03m");
    }

    #[test]
    fn body_prefixes_duration_and_truncates_preview() {
        let body = compose_body("abcdefghij", Some(65_000), 4);
        assert_eq!(body, "Finished in 1m 05s\nabcd…");
    }

    #[test]
    fn zero_preview_length_hides_text() {
        assert_eq!(compose_body("secret", Some(2_000), 0), "Finished in 2s");
        assert_eq!(compose_body("secret", None, 0), DEFAULT_TITLE);
    }

    #[test]
    fn dispatch_sends_notification_and_sound() {
        let recorder = Recorder::default();
        let dispatcher =
            NotificationDispatcher::new(Box::new(recorder.clone()), Box::new(recorder.clone()));
        let at = from_millis(1_700_000_000_000).unwrap();

        let sent = dispatcher
            .dispatch(&session(), "Done.", Some(1000), at, &Settings::default())
            .expect("notification");

        assert_eq!(sent.id, "tab-3::1700000000000");
        assert_eq!(sent.window_group, "window-1");
        assert_eq!(sent.title, "Chat");
        assert_eq!(recorder.notifications.lock().unwrap().len(), 1);
        let sounds = recorder.sounds.lock().unwrap();
        assert_eq!(sounds.len(), 1);
        assert_eq!(sounds[0].sound_id, "chime");
    }

    #[test]
    fn disabled_channels_stay_quiet() {
        let recorder = Recorder::default();
        let dispatcher =
            NotificationDispatcher::new(Box::new(recorder.clone()), Box::new(recorder.clone()));
        let settings = Settings {
            notifications_enabled: false,
            sound_enabled: false,
            ..Settings::default()
        };

        let sent = dispatcher.dispatch(&session(), "x", None, from_millis(5).unwrap(), &settings);

        assert!(sent.is_none());
        assert!(recorder.notifications.lock().unwrap().is_empty());
        assert!(recorder.sounds.lock().unwrap().is_empty());
    }

    #[test]
    fn delivery_failures_are_swallowed() {
        let dispatcher = NotificationDispatcher::new(Box::new(Failing), Box::new(Failing));
        let sent = dispatcher.dispatch(
            &session(),
            "x",
            None,
            from_millis(5).unwrap(),
            &Settings::default(),
        );
        assert!(sent.is_some());
    }
}
