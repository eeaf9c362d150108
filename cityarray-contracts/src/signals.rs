//! Signal envelope `{type, data}` and the sum types carried on both channels.
//!
//! Every frame is decoded exactly once, at the socket boundary, into one of
//! the enums below. Unknown `type` values are rejected by [`decode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

use crate::device::{Device, Telemetry};
use crate::message::Message;
use crate::templates::EmergencyKind;
use crate::ContractError;

/// Device → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeviceSignal {
    Heartbeat(Telemetry),
    /// Raw analytics payload, relayed untouched
    Metrics(serde_json::Value),
    Ack(AckSignal),
    OfflineReport(OfflineReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSignal {
    pub message_id: String,
}

/// Synchronization report for a queue entry triggered while offline.
/// `(device id, entry_id)` identifies it for deduplication; `entry_id` is
/// minted once per entry and survives a reset of the device's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineReport {
    pub entry_id: String,
    pub content: String,
    #[serde(default)]
    pub template: Option<EmergencyKind>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Coordinator → device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeviceCommand {
    Connected { device_id: String },
    NewMessage(Message),
    Override(Message),
    OverrideCancelled { message_id: String },
    ClearMessage {
        #[serde(default)]
        message_id: Option<String>,
    },
    Emergency { template: EmergencyKind },
    Ping,
}

/// Console → coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConsoleRequest {
    GetAllDevices,
}

/// Coordinator → consoles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConsoleEvent {
    Connected {
        consoles: usize,
        devices: usize,
    },
    AllDevices(Vec<Device>),
    DeviceRegistered(Device),
    DeviceConnected {
        device_id: String,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    DeviceDisconnected {
        device_id: String,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    DeviceOffline {
        device_id: String,
        #[serde(default, with = "time::serde::rfc3339::option")]
        last_seen: Option<OffsetDateTime>,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    DeviceUpdate(Device),
    DeviceMetrics {
        device_id: String,
        metrics: serde_json::Value,
    },
    MessageAck {
        device_id: String,
        message_id: String,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    MessageSent {
        message: Message,
        deliveries: BTreeMap<String, bool>,
    },
    MessageExpired {
        message_id: String,
    },
    MessageCleared {
        message_id: String,
        targets: BTreeSet<String>,
    },
    EmergencyTriggered {
        template: EmergencyKind,
        #[serde(default)]
        zone_id: Option<String>,
        deliveries: BTreeMap<String, bool>,
    },
    OverrideActivated {
        message: Message,
        targets: BTreeSet<String>,
        deliveries: BTreeMap<String, bool>,
    },
    OverrideCancelled {
        message_id: String,
        targets: BTreeSet<String>,
    },
    OfflineReport {
        device_id: String,
        report: OfflineReport,
    },
}

impl ConsoleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsoleEvent::Connected { .. } => "connected",
            ConsoleEvent::AllDevices(_) => "all_devices",
            ConsoleEvent::DeviceRegistered(_) => "device_registered",
            ConsoleEvent::DeviceConnected { .. } => "device_connected",
            ConsoleEvent::DeviceDisconnected { .. } => "device_disconnected",
            ConsoleEvent::DeviceOffline { .. } => "device_offline",
            ConsoleEvent::DeviceUpdate(_) => "device_update",
            ConsoleEvent::DeviceMetrics { .. } => "device_metrics",
            ConsoleEvent::MessageAck { .. } => "message_ack",
            ConsoleEvent::MessageSent { .. } => "message_sent",
            ConsoleEvent::MessageExpired { .. } => "message_expired",
            ConsoleEvent::MessageCleared { .. } => "message_cleared",
            ConsoleEvent::EmergencyTriggered { .. } => "emergency_triggered",
            ConsoleEvent::OverrideActivated { .. } => "override_activated",
            ConsoleEvent::OverrideCancelled { .. } => "override_cancelled",
            ConsoleEvent::OfflineReport { .. } => "offline_report",
        }
    }
}

pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, ContractError> {
    Ok(serde_json::from_str(frame)?)
}

pub fn encode<T: Serialize>(signal: &T) -> Result<String, ContractError> {
    Ok(serde_json::to_string(signal)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, Targets};
    use serde_json::json;

    #[test]
    fn test_heartbeat_envelope() {
        let frame = json!({
            "type": "heartbeat",
            "data": { "battery": 77, "signal_strength": -60, "network_path": "cellular" }
        })
        .to_string();
        match decode::<DeviceSignal>(&frame).unwrap() {
            DeviceSignal::Heartbeat(t) => {
                assert_eq!(t.battery, Some(77));
                assert_eq!(t.network_path, Some(crate::PathKind::Cellular));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let frame = json!({"type": "reboot", "data": {}}).to_string();
        assert!(decode::<DeviceSignal>(&frame).is_err());
    }

    #[test]
    fn test_ack_and_console_request() {
        let frame = json!({"type": "ack", "data": {"message_id": "m-1"}}).to_string();
        assert_eq!(
            decode::<DeviceSignal>(&frame).unwrap(),
            DeviceSignal::Ack(AckSignal { message_id: "m-1".into() })
        );
        let req: ConsoleRequest = decode(r#"{"type":"get_all_devices"}"#).unwrap();
        assert_eq!(req, ConsoleRequest::GetAllDevices);
    }

    #[test]
    fn test_override_command_shape() {
        let msg = Message::new(
            MessageKind::Override,
            "EVACUATE",
            Targets::All,
            OffsetDateTime::now_utc(),
        );
        let value: serde_json::Value =
            serde_json::from_str(&encode(&DeviceCommand::Override(msg.clone())).unwrap()).unwrap();
        assert_eq!(value["type"], "override");
        assert_eq!(value["data"]["id"], msg.id.as_str());
        assert_eq!(value["data"]["status"], "active");

        let cancel = encode(&DeviceCommand::OverrideCancelled { message_id: msg.id.clone() }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&cancel).unwrap();
        assert_eq!(value["type"], "override_cancelled");
        assert_eq!(value["data"]["message_id"], msg.id.as_str());
    }

    #[test]
    fn test_console_event_tag_matches_kind() {
        let event = ConsoleEvent::DeviceOffline {
            device_id: "d1".into(),
            last_seen: None,
            timestamp: OffsetDateTime::now_utc(),
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
        assert_eq!(value["type"], event.kind());
    }
}
