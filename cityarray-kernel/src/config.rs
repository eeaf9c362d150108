/**
 * CONFIGURATION KERNEL - Chargement de kernel.yaml
 *
 * RÔLE : Paramètres du serveur de dispatch (écoute, stockage, liveness, MQTT).
 * FONCTIONNEMENT : YAML via serde_yaml, chemin surchargeable par
 * CITYARRAY_KERNEL_CONFIG ; fichier absent ou invalide → valeurs par défaut.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    /// Adresse d'écoute HTTP + WebSocket
    pub bind: String,
    /// Répertoire du store JSON (devices.json)
    pub data_dir: PathBuf,
    pub liveness: LivenessConf,
    /// Période de publication du health kernel (secondes)
    pub health_interval_secs: u64,
    /// Pont analytics optionnel
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessConf {
    /// Silence heartbeat au-delà duquel un panneau passe offline
    pub threshold_secs: u64,
    /// Période du balayage
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "cityarray".into()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            data_dir: PathBuf::from("./data"),
            liveness: LivenessConf::default(),
            health_interval_secs: 30,
            mqtt: None,
        }
    }
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { threshold_secs: 30, sweep_interval_secs: 10 }
    }
}

impl LivenessConf {
    pub fn threshold(&self) -> time::Duration {
        time::Duration::seconds(self.threshold_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl KernelConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }
}

pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("config invalide: {e}");
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("CITYARRAY_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        info!(path = %path, "config chargée");
        parse_config(&txt)
    } else {
        warn!(path = %path, "pas de kernel.yaml, usage config par défaut");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config("liveness:\n  threshold_secs: 45\nmqtt:\n  host: broker\n  port: 1884\n");
        assert_eq!(cfg.liveness.threshold_secs, 45);
        assert_eq!(cfg.liveness.sweep_interval_secs, 10);
        assert_eq!(cfg.bind, "0.0.0.0:8000");
        let mqtt = cfg.mqtt.unwrap();
        assert_eq!(mqtt.port, 1884);
        assert_eq!(mqtt.topic_prefix, "cityarray");
    }

    #[test]
    fn test_invalid_yaml_falls_back() {
        let cfg = parse_config("liveness: [not, a, map]");
        assert_eq!(cfg.liveness.threshold_secs, 30);
        assert!(cfg.mqtt.is_none());
    }
}
