/**
 * PONT ANALYTICS MQTT - Publication optionnelle des métriques et du health
 *
 * RÔLE : Le collaborateur analytics consomme les payloads `metrics` des
 * panneaux et le health kernel sur MQTT ; le kernel ne fait que publier.
 *
 * TOPICS : {prefix}/signs/metrics@v1, {prefix}/kernel/health@v1
 * FONCTIONNEMENT : try_publish non bloquant (le dispatch ne doit jamais
 * attendre le broker) + tâche de poll de l'eventloop qui suit l'état MQTT.
 */

use crate::config::MqttConf;
use crate::health::{HealthTracker, KernelHealth};
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use serde_json::json;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AnalyticsBridge {
    client: AsyncClient,
    metrics_topic: String,
    health_topic: String,
}

impl AnalyticsBridge {
    pub fn connect(cfg: &MqttConf, health: HealthTracker) -> Self {
        let mut opts = MqttOptions::new("cityarray-kernel", &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(rumqttc::Incoming::ConnAck(_))) => {
                        info!("connecté au broker MQTT");
                        health.mark_mqtt_connected();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT erreur: {e:?}");
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self {
            client,
            metrics_topic: format!("{}/signs/metrics@v1", cfg.topic_prefix),
            health_topic: format!("{}/kernel/health@v1", cfg.topic_prefix),
        }
    }

    pub fn publish_metrics(&self, device_id: &str, metrics: &serde_json::Value) {
        let payload = metrics_payload(device_id, metrics, OffsetDateTime::now_utc());
        self.publish(&self.metrics_topic, payload.to_string());
    }

    pub fn publish_health(&self, health: &KernelHealth) {
        match serde_json::to_string(health) {
            Ok(payload) => self.publish(&self.health_topic, payload),
            Err(e) => warn!("health non sérialisable: {e}"),
        }
    }

    fn publish(&self, topic: &str, payload: String) {
        if let Err(e) = self.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            warn!(topic, "publication MQTT abandonnée: {e:?}");
        } else {
            debug!(topic, "publié");
        }
    }
}

fn metrics_payload(device_id: &str, metrics: &serde_json::Value, now: OffsetDateTime) -> serde_json::Value {
    let timestamp = now
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    json!({
        "device_id": device_id,
        "timestamp": timestamp,
        "metrics": metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_payload_wraps_raw_metrics() {
        let now = time::macros::datetime!(2025-06-01 12:00 UTC);
        let payload = metrics_payload("d1", &json!({"crowd_count": 420}), now);
        assert_eq!(payload["device_id"], "d1");
        assert_eq!(payload["metrics"]["crowd_count"], 420);
        assert_eq!(payload["timestamp"], "2025-06-01T12:00:00Z");
    }
}
