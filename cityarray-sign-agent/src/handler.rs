//! Kernel command handling
//!
//! Renders delivered content and acks every live message on receipt, even
//! when arbitration keeps it off screen.
//! Emergency triggers (from the kernel or the offline console) go through the
//! same presenter so arbitration stays in one place.

use crate::audio::AudioSink;
use crate::cache::LocalCache;
use crate::display::{DisplaySink, Screen, Shown};
use crate::state::Shared;
use cityarray_contracts::{AckSignal, DeviceCommand, DeviceSignal, EmergencyKind, EmergencyTemplate, Message};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct Presenter {
    screen: Screen,
    display: DisplaySink,
    audio: AudioSink,
}

impl Presenter {
    pub fn new(display: DisplaySink, audio: AudioSink) -> Self {
        Self {
            screen: Screen::default(),
            display,
            audio,
        }
    }

    pub fn current_message_id(&self) -> Option<String> {
        self.screen.current_message_id()
    }

    #[cfg(test)]
    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    /// Returns false when the message is stale or loses arbitration.
    pub async fn show_message(&mut self, message: &Message) -> bool {
        if !message.is_live() || message.is_expired_at(OffsetDateTime::now_utc()) {
            debug!("Dropping stale message {}", message.id);
            return false;
        }
        let shown = Shown::from_message(message);
        if !self.screen.offer(shown.clone()) {
            info!(
                "Message {} (priority {}) held back by current content",
                message.id,
                message.priority.value()
            );
            return false;
        }
        self.display.render(&shown).await;
        if message.audio_enabled {
            self.audio.announce(&message.content);
        }
        true
    }

    pub async fn show_template(&mut self, template: &EmergencyTemplate) {
        let shown = Shown::from_template(template);
        self.screen.offer(shown.clone());
        self.display.render(&shown).await;
        if template.audio {
            self.audio.announce(&template.content);
        }
    }

    pub async fn clear(&mut self, message_id: Option<&str>) -> bool {
        let cleared = self.screen.clear(message_id);
        if cleared {
            self.display.clear().await;
        }
        cleared
    }
}

pub fn emergency_template(cache: &Shared<LocalCache>, kind: EmergencyKind) -> EmergencyTemplate {
    cache.lock().template(kind).cloned().unwrap_or_else(|| kind.template())
}

/// Applies one kernel command; returns the signal to send back, if any.
pub async fn handle_command(
    presenter: &Mutex<Presenter>,
    cache: &Shared<LocalCache>,
    command: DeviceCommand,
) -> Option<DeviceSignal> {
    match command {
        DeviceCommand::Connected { device_id } => {
            info!("Kernel confirmed session for {}", device_id);
            None
        }
        DeviceCommand::NewMessage(message) | DeviceCommand::Override(message) => {
            if !message.is_live() || message.is_expired_at(OffsetDateTime::now_utc()) {
                debug!("Stale message {} not acknowledged", message.id);
                return None;
            }
            presenter.lock().await.show_message(&message).await;
            Some(DeviceSignal::Ack(AckSignal { message_id: message.id }))
        }
        DeviceCommand::OverrideCancelled { message_id } => {
            presenter.lock().await.clear(Some(&message_id)).await;
            None
        }
        DeviceCommand::ClearMessage { message_id } => {
            presenter.lock().await.clear(message_id.as_deref()).await;
            None
        }
        DeviceCommand::Emergency { template } => {
            let template = emergency_template(cache, template);
            presenter.lock().await.show_template(&template).await;
            None
        }
        DeviceCommand::Ping => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::new_state;
    use cityarray_contracts::{DisplayMode, MessageKind, Priority, Targets};
    use tempfile::{tempdir, TempDir};

    pub(crate) fn presenter() -> Mutex<Presenter> {
        Mutex::new(Presenter::new(DisplaySink::new(None), AudioSink::new(false, None)))
    }

    pub(crate) fn cache() -> (TempDir, Shared<LocalCache>) {
        let dir = tempdir().unwrap();
        let cache = new_state(LocalCache::open(dir.path().join("cache.json")).unwrap());
        (dir, cache)
    }

    fn message(kind: MessageKind, priority: u8, mode: DisplayMode) -> Message {
        let mut m = Message::new(kind, "Gate B closed", Targets::All, OffsetDateTime::now_utc());
        m.priority = Priority::new(priority as i64);
        m.mode = mode;
        m
    }

    #[tokio::test]
    async fn test_new_message_is_acked() {
        let presenter = presenter();
        let (_dir, cache) = cache();
        let msg = message(MessageKind::Standard, 50, DisplayMode::Insert);

        let reply = handle_command(&presenter, &cache, DeviceCommand::NewMessage(msg.clone())).await;
        assert_eq!(reply, Some(DeviceSignal::Ack(AckSignal { message_id: msg.id.clone() })));
        assert_eq!(presenter.lock().await.current_message_id(), Some(msg.id));
    }

    #[tokio::test]
    async fn test_lower_priority_held_back_but_acked() {
        let presenter = presenter();
        let (_dir, cache) = cache();
        let hold = message(MessageKind::Override, 90, DisplayMode::Replace);
        handle_command(&presenter, &cache, DeviceCommand::Override(hold.clone())).await;

        let low = message(MessageKind::Standard, 10, DisplayMode::Insert);
        let reply = handle_command(&presenter, &cache, DeviceCommand::NewMessage(low.clone())).await;
        assert_eq!(reply, Some(DeviceSignal::Ack(AckSignal { message_id: low.id })));
        assert_eq!(presenter.lock().await.current_message_id(), Some(hold.id.clone()));

        handle_command(&presenter, &cache, DeviceCommand::OverrideCancelled { message_id: hold.id }).await;
        assert!(presenter.lock().await.screen().current().is_none());
    }

    #[tokio::test]
    async fn test_expired_message_ignored() {
        let presenter = presenter();
        let (_dir, cache) = cache();
        let mut msg = message(MessageKind::Standard, 50, DisplayMode::Insert);
        msg.expires_at = Some(OffsetDateTime::now_utc() - time::Duration::seconds(1));
        assert_eq!(handle_command(&presenter, &cache, DeviceCommand::NewMessage(msg)).await, None);
    }

    #[tokio::test]
    async fn test_emergency_uses_cached_template() {
        let presenter = presenter();
        let (_dir, cache) = cache();
        let hold = message(MessageKind::Override, 100, DisplayMode::Replace);
        handle_command(&presenter, &cache, DeviceCommand::Override(hold)).await;

        let reply = handle_command(
            &presenter,
            &cache,
            DeviceCommand::Emergency { template: EmergencyKind::Shelter },
        )
        .await;
        assert_eq!(reply, None);
        let guard = presenter.lock().await;
        let current = guard.screen().current().unwrap();
        assert_eq!(current.content, EmergencyKind::Shelter.template().content);
        assert_eq!(current.mode, DisplayMode::Emergency);
    }
}
