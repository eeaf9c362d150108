//! Hardware capability detection for signs
//!
//! Reports what the unit can do beyond showing text:
//! - Speech (piper or espeak, plus an audio player)
//! - Cellular tooling (nmcli or pppd `pon`)

use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsEngine {
    Piper,
    Espeak,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignCapabilities {
    pub tts: Option<TtsEngine>,
    pub has_speaker: bool,
    pub cellular_tooling: bool,
}

impl SignCapabilities {
    pub fn detect() -> Self {
        let tts = if command_exists("piper") && command_exists("aplay") {
            Some(TtsEngine::Piper)
        } else if command_exists("espeak") {
            Some(TtsEngine::Espeak)
        } else {
            None
        };
        let caps = Self {
            tts,
            has_speaker: tts.is_some(),
            cellular_tooling: command_exists("nmcli") || command_exists("pon"),
        };
        debug!("Detected capabilities: {:?}", caps);
        caps
    }
}

fn command_exists(command: &str) -> bool {
    match Command::new("which").arg(command).output() {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_consistent() {
        let caps = SignCapabilities::detect();
        assert_eq!(caps.has_speaker, caps.tts.is_some());
    }

    #[test]
    fn test_missing_command() {
        assert!(!command_exists("cityarray-definitely-not-installed"));
    }
}
