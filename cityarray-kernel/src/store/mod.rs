/**
 * SIGN STORE - Collaborateur de persistance des panneaux et messages
 *
 * RÔLE :
 * Interface commune que le dispatch et le monitor de liveness consomment pour
 * lire/écrire les Devices et les Messages, et résoudre l'appartenance aux
 * zones et aux événements.
 *
 * FONCTIONNEMENT :
 * - SignStore trait = CRUD device/message + lookups par défaut (zone, event)
 * - save_* = écriture durable immédiate
 * - stage_device = mise à jour en cache, persistée au prochain flush()
 *   (les heartbeats arrivent toutes les 5s, on n'écrit pas le disque à chaque fois)
 * - JsonStore = implémentation fichier JSON (voir json.rs)
 */

pub mod json;

pub use json::JsonStore;

use cityarray_contracts::{ConnectionStatus, Device, Message};
use time::OffsetDateTime;

/// Erreurs possibles lors des opérations sur le store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Filtres de listing des panneaux (tous optionnels, combinés en ET)
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub event_id: Option<String>,
    pub zone_id: Option<String>,
    pub status: Option<ConnectionStatus>,
}

impl DeviceFilter {
    pub fn matches(&self, device: &Device) -> bool {
        if let Some(event) = &self.event_id {
            if device.event_id.as_ref() != Some(event) {
                return false;
            }
        }
        if let Some(zone) = &self.zone_id {
            if device.zone_id.as_ref() != Some(zone) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if device.status != status {
                return false;
            }
        }
        true
    }
}

pub trait SignStore: Send + Sync {
    fn create_device(&self, device: Device) -> Result<Device, StoreError>;

    fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError>;

    fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError>;

    /// Écriture durable immédiate
    fn save_device(&self, device: &Device) -> Result<(), StoreError>;

    /// Mise à jour en cache, écrite au prochain `flush`
    fn stage_device(&self, device: &Device) -> Result<(), StoreError> {
        self.save_device(device)
    }

    /// online → offline si le panneau est toujours silencieux ; test et écriture
    /// sans heartbeat intercalé. Retourne le panneau rétrogradé.
    fn demote_if_silent(
        &self,
        id: &str,
        now: OffsetDateTime,
        threshold: time::Duration,
    ) -> Result<Option<Device>, StoreError> {
        let Some(mut device) = self.get_device(id)? else {
            return Ok(None);
        };
        if !device.is_online() || !device.is_silent(now, threshold) {
            return Ok(None);
        }
        device.status = ConnectionStatus::Offline;
        self.save_device(&device)?;
        Ok(Some(device))
    }

    fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError>;

    fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Messages, plus récents d'abord
    fn list_messages(&self) -> Result<Vec<Message>, StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn zone_members(&self, zone_id: &str) -> Result<Vec<String>, StoreError> {
        let filter = DeviceFilter { zone_id: Some(zone_id.to_string()), ..Default::default() };
        Ok(self.list_devices(&filter)?.into_iter().map(|d| d.id).collect())
    }

    /// Membres d'un événement ; sans événement, tout le parc
    fn event_members(&self, event_id: Option<&str>) -> Result<Vec<String>, StoreError> {
        let filter = DeviceFilter { event_id: event_id.map(str::to_string), ..Default::default() };
        Ok(self.list_devices(&filter)?.into_iter().map(|d| d.id).collect())
    }
}
