//! Sign configuration with secure API key storage
//!
//! Handles:
//! - Kernel endpoint (host, port, TLS)
//! - Sign identity hints sent at registration (name, zone, event)
//! - Network path priority and failover tuning
//! - Timing constants (heartbeat, reconnect, network checks)
//! - Display/audio sinks

use anyhow::Result;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignConfig {
    pub server: ServerConfig,
    pub sign: SignInfo,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub display: DisplayConfig,
    /// Holds `device_id` and `cache.json`
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub store_api_key: bool,
    #[serde(skip)] // Never serialize secrets
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignInfo {
    pub name: String,
    pub zone_id: Option<String>,
    pub event_id: Option<String>,
    pub display_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Checked in order; the first one that is up is the active path
    pub interfaces: Vec<String>,
    pub cellular_interfaces: Vec<String>,
    /// Consecutive connect failures before trying the cellular path
    pub failover_threshold: u32,
    /// Tried in order until one exits successfully
    pub cellular_commands: Vec<Vec<String>>,
    pub cellular_settle_secs: u64,
    pub cellular_command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_secs: u64,
    pub reconnect_delay_secs: u64,
    pub network_check_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DisplayConfig {
    /// Matrix portal base URL (`POST {url}/display`, `POST {url}/clear`); None logs renders only
    pub sink_url: Option<String>,
    pub audio_enabled: bool,
}

impl Default for SignConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sign: SignInfo::default(),
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
            display: DisplayConfig { sink_url: None, audio_enabled: true },
            state_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cityarray-sign"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            use_tls: false,
            store_api_key: false,
            api_key: None,
        }
    }
}

impl Default for SignInfo {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "cityarray-sign".to_string()),
            zone_id: None,
            event_id: None,
            display_type: "led".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interfaces: ["wlan0", "eth0", "usb0", "ppp0"].map(String::from).to_vec(),
            cellular_interfaces: ["ppp0", "usb0", "wwan0"].map(String::from).to_vec(),
            failover_threshold: 3,
            cellular_commands: vec![
                ["nmcli", "con", "up", "cellular"].map(String::from).to_vec(),
                ["pon", "cellular"].map(String::from).to_vec(),
            ],
            cellular_settle_secs: 10,
            cellular_command_timeout_secs: 30,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 5,
            reconnect_delay_secs: 5,
            network_check_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn network_check(&self) -> Duration {
        Duration::from_secs(self.network_check_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl SignConfig {
    /// Load config from `CITYARRAY_SIGN_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            // First run - documented defaults
            Self::default()
        };

        config.server.api_key = if config.server.store_api_key {
            Self::load_api_key().ok()
        } else {
            std::env::var("CITYARRAY_API_KEY").ok().filter(|k| !k.is_empty())
        };
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()?;
        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;

        if self.server.store_api_key {
            if let Some(key) = &self.server.api_key {
                Self::save_api_key(key)?;
            }
        }
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("CITYARRAY_SIGN_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("cityarray-sign");
        path.push("config.toml");
        Ok(path)
    }

    fn load_api_key() -> Result<String> {
        let entry = Entry::new("cityarray-sign", "api-key")?;
        entry.get_password().map_err(Into::into)
    }

    fn save_api_key(key: &str) -> Result<()> {
        let entry = Entry::new("cityarray-sign", "api-key")?;
        entry.set_password(key).map_err(Into::into)
    }

    pub fn http_base(&self) -> String {
        let scheme = if self.server.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.server.host, self.server.port)
    }

    pub fn ws_url(&self, device_id: &str) -> String {
        let scheme = if self.server.use_tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/ws/sign/{device_id}", self.server.host, self.server.port)
    }

    pub fn device_id_path(&self) -> PathBuf {
        self.state_dir.join("device_id")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join("cache.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SignConfig::default();
        assert_eq!(config.timing.heartbeat_secs, 5);
        assert_eq!(config.timing.reconnect_delay_secs, 5);
        assert_eq!(config.timing.network_check_secs, 30);
        assert_eq!(config.network.failover_threshold, 3);
        assert_eq!(config.network.interfaces, vec!["wlan0", "eth0", "usb0", "ppp0"]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: SignConfig = toml::from_str(
            "[server]\nhost = \"kernel.local\"\nuse_tls = true\n\n[sign]\nname = \"Gate A\"\nzone_id = \"north\"\n",
        )
        .unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.sign.zone_id.as_deref(), Some("north"));
        assert_eq!(config.ws_url("abc"), "wss://kernel.local:8000/ws/sign/abc");
        assert_eq!(config.http_base(), "https://kernel.local:8000");
        assert_eq!(config.timing.heartbeat_secs, 5);
    }

    #[test]
    fn test_api_key_never_serialized() {
        let mut config = SignConfig::default();
        config.server.api_key = Some("secret".into());
        let txt = toml::to_string_pretty(&config).unwrap();
        assert!(!txt.contains("secret"));
    }
}
