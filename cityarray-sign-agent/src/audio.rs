//! Spoken announcements through the local TTS engine

use crate::capabilities::TtsEngine;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const SPEAK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AudioSink {
    engine: Option<TtsEngine>,
}

impl AudioSink {
    pub fn new(enabled: bool, engine: Option<TtsEngine>) -> Self {
        Self {
            engine: engine.filter(|_| enabled),
        }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    /// Fire-and-forget; the display never waits on speech.
    pub fn announce(&self, text: &str) {
        let Some(engine) = self.engine else {
            return;
        };
        let text = text.replace('\n', ". ");
        tokio::spawn(async move {
            match tokio::time::timeout(SPEAK_TIMEOUT, speak(engine, &text)).await {
                Ok(Ok(())) => debug!("Announced: {}", text),
                Ok(Err(e)) => warn!("TTS failed: {}", e),
                Err(_) => warn!("TTS timed out"),
            }
        });
    }
}

async fn speak(engine: TtsEngine, text: &str) -> std::io::Result<()> {
    let status = match engine {
        TtsEngine::Espeak => Command::new("espeak").arg(text).kill_on_drop(true).status().await?,
        TtsEngine::Piper => {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg("piper --output_raw | aplay -r 22050 -f S16_LE -t raw -")
                .stdin(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(text.as_bytes()).await?;
            }
            child.wait().await?
        }
    };
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("tts exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_audio_has_no_engine() {
        assert!(!AudioSink::new(false, Some(TtsEngine::Espeak)).is_available());
        assert!(AudioSink::new(true, Some(TtsEngine::Piper)).is_available());
        assert!(!AudioSink::new(true, None).is_available());
    }
}
