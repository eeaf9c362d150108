//! What the sign shows, and the sink that physically renders it
//!
//! `Screen` arbitrates between competing content: emergency always wins and
//! holds the screen against any insert or replace content, a
//! `replace` message holds the screen against anything of lower priority,
//! `insert` content yields to whatever arrives next.

use cityarray_contracts::{DisplayColor, DisplayMode, EmergencyTemplate, Message, Priority};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Shown {
    pub message_id: Option<String>,
    pub content: String,
    pub priority: Priority,
    pub mode: DisplayMode,
    pub color: DisplayColor,
}

impl Shown {
    pub fn from_message(message: &Message) -> Self {
        let priority = message.effective_priority();
        Self {
            message_id: Some(message.id.clone()),
            content: message.content.clone(),
            priority,
            mode: message.mode,
            color: DisplayColor::from_priority(priority),
        }
    }

    pub fn from_template(template: &EmergencyTemplate) -> Self {
        Self {
            message_id: None,
            content: template.content.clone(),
            priority: template.priority,
            mode: DisplayMode::Emergency,
            color: template.color,
        }
    }
}

#[derive(Debug, Default)]
pub struct Screen {
    current: Option<Shown>,
}

impl Screen {
    pub fn current(&self) -> Option<&Shown> {
        self.current.as_ref()
    }

    pub fn current_message_id(&self) -> Option<String> {
        self.current().and_then(|s| s.message_id.clone())
    }

    /// Takes the screen if arbitration allows it. Returns whether it did.
    pub fn offer(&mut self, candidate: Shown) -> bool {
        let accepted = match &self.current {
            None => true,
            Some(_) if candidate.mode == DisplayMode::Emergency => true,
            // only another emergency, or an explicit clear, ends an emergency
            Some(current) if current.mode == DisplayMode::Emergency => false,
            Some(current) if current.mode == DisplayMode::Insert => true,
            Some(current) => candidate.priority >= current.priority,
        };
        if accepted {
            self.current = Some(candidate);
        }
        accepted
    }

    /// Clears the screen. With an id, only if that message is the one showing.
    pub fn clear(&mut self, message_id: Option<&str>) -> bool {
        let matches = match (message_id, &self.current) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(id), Some(current)) => current.message_id.as_deref() == Some(id),
        };
        if matches {
            self.current = None;
        }
        matches
    }
}

/// HTTP client for the LED matrix portal; logs only when no portal is configured.
#[derive(Clone)]
pub struct DisplaySink {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl DisplaySink {
    pub fn new(base_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub async fn render(&self, shown: &Shown) {
        let Some(base) = &self.base_url else {
            info!("[DISPLAY:{:?}] {}", shown.color, shown.content.replace('\n', " | "));
            return;
        };
        let body = json!({ "text": shown.content, "color": shown.color });
        if let Err(e) = self.client.post(format!("{base}/display")).json(&body).send().await {
            warn!("Display sink unreachable: {}", e);
        }
    }

    pub async fn clear(&self) {
        let Some(base) = &self.base_url else {
            info!("[DISPLAY] cleared");
            return;
        };
        if let Err(e) = self.client.post(format!("{base}/clear")).send().await {
            warn!("Display sink unreachable: {}", e);
        }
    }
}
