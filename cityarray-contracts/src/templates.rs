//! Built-in emergency templates. Cached on every sign so they render with
//! zero network dependency.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::message::Priority;
use crate::ContractError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    Evacuate,
    Shelter,
    Medical,
    Weather,
    LostChild,
    AllClear,
}

impl EmergencyKind {
    pub const ALL: [EmergencyKind; 6] = [
        EmergencyKind::Evacuate,
        EmergencyKind::Shelter,
        EmergencyKind::Medical,
        EmergencyKind::Weather,
        EmergencyKind::LostChild,
        EmergencyKind::AllClear,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyKind::Evacuate => "evacuate",
            EmergencyKind::Shelter => "shelter",
            EmergencyKind::Medical => "medical",
            EmergencyKind::Weather => "weather",
            EmergencyKind::LostChild => "lost_child",
            EmergencyKind::AllClear => "all_clear",
        }
    }

    pub fn template(self) -> EmergencyTemplate {
        let (content, priority, color) = match self {
            EmergencyKind::Evacuate => ("EVACUATE NOW\nFollow exit signs\nStay calm", 100, DisplayColor::Red),
            EmergencyKind::Shelter => ("SHELTER IN PLACE\nStay indoors\nAwait instructions", 95, DisplayColor::Red),
            EmergencyKind::Medical => ("MEDICAL EMERGENCY\nClear the area\nHelp is coming", 90, DisplayColor::Red),
            EmergencyKind::Weather => ("SEVERE WEATHER\nSeek shelter immediately", 85, DisplayColor::Amber),
            EmergencyKind::LostChild => ("LOST CHILD ALERT\nCheck information booth", 80, DisplayColor::Amber),
            EmergencyKind::AllClear => ("ALL CLEAR\nResume normal activities", 50, DisplayColor::Green),
        };
        EmergencyTemplate {
            kind: self,
            content: content.to_string(),
            priority: Priority::new(priority),
            audio: true,
            color,
        }
    }

    pub fn catalog() -> Vec<EmergencyTemplate> {
        Self::ALL.iter().map(|k| k.template()).collect()
    }
}

impl fmt::Display for EmergencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmergencyKind {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ContractError::UnknownTemplate(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayColor {
    Red,
    Amber,
    Green,
}

impl DisplayColor {
    /// ≥90 red, ≥70 amber, otherwise green.
    pub fn from_priority(priority: Priority) -> Self {
        match priority.value() {
            90..=u8::MAX => DisplayColor::Red,
            70..=89 => DisplayColor::Amber,
            _ => DisplayColor::Green,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyTemplate {
    pub kind: EmergencyKind,
    pub content: String,
    pub priority: Priority,
    pub audio: bool,
    pub color: DisplayColor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_complete() {
        let catalog = EmergencyKind::catalog();
        assert_eq!(catalog.len(), 6);
        assert_eq!(catalog[0].kind, EmergencyKind::Evacuate);
        assert_eq!(catalog[0].priority.value(), 100);
        assert!(catalog.iter().all(|t| t.audio));
    }

    #[test]
    fn test_parse_console_names() {
        assert_eq!("evacuate".parse::<EmergencyKind>().unwrap(), EmergencyKind::Evacuate);
        assert_eq!("Lost-Child".parse::<EmergencyKind>().unwrap(), EmergencyKind::LostChild);
        assert_eq!("all clear".parse::<EmergencyKind>().unwrap(), EmergencyKind::AllClear);
        assert!("party".parse::<EmergencyKind>().is_err());
    }

    #[test]
    fn test_color_from_priority() {
        assert_eq!(DisplayColor::from_priority(Priority::new(95)), DisplayColor::Red);
        assert_eq!(DisplayColor::from_priority(Priority::new(70)), DisplayColor::Amber);
        assert_eq!(DisplayColor::from_priority(Priority::new(10)), DisplayColor::Green);
    }
}
