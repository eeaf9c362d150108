//! Message model: priority, display mode, lifecycle and target specification.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::ContractError;

/// Ordinal priority, bounded to `1..=100`. Higher preempts lower.
///
/// Decodes from an integer or from the legacy level names
/// (`low`, `normal`, `high`, `critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 100;

    pub const LOW: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(80);
    pub const CRITICAL: Priority = Priority(100);

    /// Clamps any integer into the valid range.
    pub fn new(value: i64) -> Self {
        Priority(value.clamp(Self::MIN as i64, Self::MAX as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn from_level(level: &str) -> Option<Self> {
        match level.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::LOW),
            "normal" | "medium" => Some(Self::NORMAL),
            "high" => Some(Self::HIGH),
            "critical" | "emergency" => Some(Self::CRITICAL),
            other => other.parse::<i64>().ok().map(Self::new),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::LOW
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Level(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Priority::new(n)),
            Raw::Level(level) => Priority::from_level(&level).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown priority level `{level}`"))
            }),
        }
    }
}

/// How a message shares the display with scheduled content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Coexists with scheduled content
    #[default]
    Insert,
    /// Takes the display exclusively until cleared or expired
    Replace,
    /// Exclusive, and forces local audio/flash rendering
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Standard,
    Override,
}

/// `pending → active → displayed | cancelled | expired`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Active,
    Displayed,
    Cancelled,
    Expired,
}

impl MessageStatus {
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Active, Displayed)
                | (Active, Cancelled)
                | (Active, Expired)
                | (Displayed, Cancelled)
                | (Displayed, Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Cancelled | MessageStatus::Expired)
    }
}

/// Declared targets of a message.
///
/// The `"all"` sentinel wins over any explicit id or zone listed next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Targets {
    All,
    Explicit {
        #[serde(default)]
        devices: BTreeSet<String>,
        #[serde(default)]
        zones: BTreeSet<String>,
    },
}

impl Targets {
    pub const ALL_SENTINEL: &'static str = "all";

    /// Builds targets from the raw request lists. Empty lists mean "all".
    pub fn from_lists(devices: Option<Vec<String>>, zones: Option<Vec<String>>) -> Self {
        let devices = clean(devices);
        let zones = clean(zones);

        if devices.contains(Self::ALL_SENTINEL) || zones.contains(Self::ALL_SENTINEL) {
            return Targets::All;
        }
        if devices.is_empty() && zones.is_empty() {
            return Targets::All;
        }
        Targets::Explicit { devices, zones }
    }

    pub fn devices<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Targets::from_lists(Some(ids.into_iter().map(Into::into).collect()), None)
    }

    pub fn zones<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Targets::from_lists(None, Some(ids.into_iter().map(Into::into).collect()))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Targets::All)
    }

    /// True when an explicit device id is listed (zone membership not considered).
    pub fn names_device(&self, device_id: &str) -> bool {
        match self {
            Targets::All => true,
            Targets::Explicit { devices, .. } => devices.contains(device_id),
        }
    }
}

fn clean(list: Option<Vec<String>>) -> BTreeSet<String> {
    list.unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A unit of content dispatched to signs. Content is immutable once created;
/// only `status` moves, through [`Message::transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    pub content: String,
    pub targets: Targets,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub mode: DisplayMode,
    #[serde(default)]
    pub audio_enabled: bool,
    #[serde(default)]
    pub audio_languages: Vec<String>,
    pub status: MessageStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration_seconds: Option<u32>,
}

impl Message {
    /// Standard messages start `pending`; overrides skip straight to `active`.
    pub fn new(kind: MessageKind, content: impl Into<String>, targets: Targets, now: OffsetDateTime) -> Self {
        let status = match kind {
            MessageKind::Standard => MessageStatus::Pending,
            MessageKind::Override => MessageStatus::Active,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: None,
            template_id: None,
            content: content.into(),
            targets,
            priority: Priority::default(),
            kind,
            mode: DisplayMode::default(),
            audio_enabled: false,
            audio_languages: Vec::new(),
            status,
            created_at: now,
            created_by: None,
            expires_at: None,
            duration_seconds: None,
        }
    }

    pub fn transition(&mut self, next: MessageStatus) -> Result<(), ContractError> {
        if !self.status.can_transition_to(next) {
            return Err(ContractError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_override(&self) -> bool {
        self.kind == MessageKind::Override
    }

    /// Still eligible for display (not cancelled or expired).
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Emergency mode dominates any insert/replace content whatever its declared priority.
    pub fn effective_priority(&self) -> Priority {
        match self.mode {
            DisplayMode::Emergency => Priority::CRITICAL,
            _ => self.priority,
        }
    }
}
