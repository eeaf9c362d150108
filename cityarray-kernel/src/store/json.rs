/**
 * JSON STORE - Persistance fichier des panneaux et messages
 *
 * RÔLE :
 * Implémentation de SignStore sur un fichier JSON unique, avec cache mémoire.
 *
 * FONCTIONNEMENT :
 * - Chargement au démarrage, fichier créé vide s'il n'existe pas
 * - Écriture via fichier temporaire + rename (pas de fichier tronqué sur crash),
 *   verrou du cache tenu pendant toute l'écriture : un seul écrivain à la fois
 * - Écriture échouée = modification annulée dans le cache
 * - stage_device marque le cache "dirty", flush() écrit si nécessaire
 * - Sans chemin : store purement mémoire (tests, démo)
 */

use super::{DeviceFilter, SignStore, StoreError};
use cityarray_contracts::{ConnectionStatus, Device, Message};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    devices: BTreeMap<String, Device>,
    #[serde(default)]
    messages: BTreeMap<String, Message>,
}

pub struct JsonStore {
    /// Chemin du fichier JSON (None = mémoire uniquement)
    storage_path: Option<PathBuf>,
    cache: Mutex<Snapshot>,
    dirty: AtomicBool,
}

impl JsonStore {
    pub fn open<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let path = storage_path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            storage_path: Some(path.clone()),
            cache: Mutex::new(Snapshot::default()),
            dirty: AtomicBool::new(false),
        };
        store.load_from_disk(&path)?;
        let (devices, messages) = store.counts();
        info!(?path, devices, messages, "store initialisé");
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self {
            storage_path: None,
            cache: Mutex::new(Snapshot::default()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        let cache = self.cache.lock();
        (cache.devices.len(), cache.messages.len())
    }

    fn load_from_disk(&self, path: &Path) -> Result<(), StoreError> {
        if !path.exists() {
            fs::write(path, "{}")?;
        }
        let content = fs::read_to_string(path)?;
        let snapshot: Snapshot = if content.trim().is_empty() {
            Snapshot::default()
        } else {
            serde_json::from_str(&content)?
        };
        *self.cache.lock() = snapshot;
        Ok(())
    }

    /// Écrit le snapshot ; l'appelant tient le verrou du cache
    fn write_locked(&self, cache: &Snapshot) -> Result<(), StoreError> {
        let Some(path) = &self.storage_path else {
            self.dirty.store(false, Ordering::Relaxed);
            return Ok(());
        };
        let json = serde_json::to_string_pretty(cache)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        self.dirty.store(false, Ordering::Relaxed);
        debug!(?path, "store écrit");
        Ok(())
    }

    fn put_device(&self, device: Device) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        let id = device.id.clone();
        let previous = cache.devices.insert(id.clone(), device);
        if let Err(e) = self.write_locked(&cache) {
            match previous {
                Some(previous) => cache.devices.insert(id, previous),
                None => cache.devices.remove(&id),
            };
            return Err(e);
        }
        Ok(())
    }
}

impl SignStore for JsonStore {
    fn create_device(&self, device: Device) -> Result<Device, StoreError> {
        self.put_device(device.clone())?;
        Ok(device)
    }

    fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.cache.lock().devices.get(id).cloned())
    }

    fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError> {
        let cache = self.cache.lock();
        let mut devices: Vec<Device> =
            cache.devices.values().filter(|d| filter.matches(d)).cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(devices)
    }

    fn save_device(&self, device: &Device) -> Result<(), StoreError> {
        self.put_device(device.clone())
    }

    fn stage_device(&self, device: &Device) -> Result<(), StoreError> {
        self.cache.lock().devices.insert(device.id.clone(), device.clone());
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn demote_if_silent(
        &self,
        id: &str,
        now: OffsetDateTime,
        threshold: time::Duration,
    ) -> Result<Option<Device>, StoreError> {
        let mut cache = self.cache.lock();
        let Some(device) = cache.devices.get_mut(id) else {
            return Ok(None);
        };
        if !device.is_online() || !device.is_silent(now, threshold) {
            return Ok(None);
        }
        device.status = ConnectionStatus::Offline;
        let demoted = device.clone();
        if let Err(e) = self.write_locked(&cache) {
            if let Some(device) = cache.devices.get_mut(id) {
                device.status = ConnectionStatus::Online;
            }
            return Err(e);
        }
        Ok(Some(demoted))
    }

    fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.save_message(message)
    }

    fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.cache.lock().messages.get(id).cloned())
    }

    fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        let previous = cache.messages.insert(message.id.clone(), message.clone());
        if let Err(e) = self.write_locked(&cache) {
            match previous {
                Some(previous) => cache.messages.insert(message.id.clone(), previous),
                None => cache.messages.remove(&message.id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn list_messages(&self) -> Result<Vec<Message>, StoreError> {
        let cache = self.cache.lock();
        let mut messages: Vec<Message> = cache.messages.values().cloned().collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(messages)
    }

    fn flush(&self) -> Result<(), StoreError> {
        if self.dirty.load(Ordering::Relaxed) {
            let cache = self.cache.lock();
            self.write_locked(&cache)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cityarray_contracts::{DeviceRegistration, MessageKind, Targets, Telemetry};
    use std::sync::Arc;

    fn sign(name: &str, zone: &str) -> Device {
        Device::register(
            DeviceRegistration {
                name: name.into(),
                event_id: Some("fest".into()),
                zone_id: Some(zone.into()),
                display_type: "led".into(),
                ..Default::default()
            },
            OffsetDateTime::now_utc(),
        )
    }

    #[test]
    fn test_devices_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let id = {
            let store = JsonStore::open(&path).unwrap();
            store.create_device(sign("Gate A", "north")).unwrap().id
        };
        let store = JsonStore::open(&path).unwrap();
        assert_eq!(store.get_device(&id).unwrap().unwrap().name, "Gate A");
    }

    #[test]
    fn test_staged_heartbeat_written_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let store = JsonStore::open(&path).unwrap();
        let mut device = store.create_device(sign("Gate A", "north")).unwrap();

        device.record_heartbeat(&Telemetry { battery: Some(42), ..Default::default() }, OffsetDateTime::now_utc());
        store.stage_device(&device).unwrap();
        let on_disk = JsonStore::open(&path).unwrap();
        assert!(on_disk.get_device(&device.id).unwrap().unwrap().telemetry.battery.is_none());

        store.flush().unwrap();
        let on_disk = JsonStore::open(&path).unwrap();
        assert_eq!(on_disk.get_device(&device.id).unwrap().unwrap().telemetry.battery, Some(42));
    }

    #[test]
    fn test_zone_and_event_lookups() {
        let store = JsonStore::in_memory();
        let a = store.create_device(sign("A", "north")).unwrap();
        let b = store.create_device(sign("B", "south")).unwrap();
        let mut other = sign("C", "north");
        other.event_id = Some("other".into());
        store.create_device(other).unwrap();

        assert_eq!(store.zone_members("south").unwrap(), vec![b.id.clone()]);
        let mut members = store.event_members(Some("fest")).unwrap();
        members.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(members, expected);
        assert_eq!(store.event_members(None).unwrap().len(), 3);
    }

    #[test]
    fn test_messages_listed_newest_first() {
        let store = JsonStore::in_memory();
        let now = OffsetDateTime::now_utc();
        let old = Message::new(MessageKind::Standard, "old", Targets::All, now - time::Duration::minutes(5));
        let new = Message::new(MessageKind::Standard, "new", Targets::All, now);
        store.insert_message(&old).unwrap();
        store.insert_message(&new).unwrap();
        let listed = store.list_messages().unwrap();
        assert_eq!(listed[0].content, "new");
        assert_eq!(listed[1].content, "old");
    }

    #[test]
    fn test_concurrent_writers_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let store = Arc::new(JsonStore::open(&path).unwrap());

        let workers: Vec<_> = (0..8)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        store.create_device(sign(&format!("s{w}-{n}"), "north")).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(JsonStore::open(&path).unwrap().counts().0, 400);
    }

    #[test]
    fn test_failed_write_leaves_cache_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = JsonStore::open(data_dir.join("devices.json")).unwrap();
        let kept = store.create_device(sign("Gate A", "north")).unwrap();

        fs::remove_dir_all(&data_dir).unwrap();
        assert!(store.create_device(sign("Gate B", "north")).is_err());
        assert_eq!(store.counts().0, 1);

        let mut renamed = kept.clone();
        renamed.name = "Gate Z".into();
        assert!(store.save_device(&renamed).is_err());
        assert_eq!(store.get_device(&kept.id).unwrap().unwrap().name, "Gate A");
    }

    #[test]
    fn test_demote_if_silent() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = JsonStore::open(data_dir.join("devices.json")).unwrap();
        let threshold = time::Duration::seconds(30);
        let now = OffsetDateTime::now_utc();
        let mut device = store.create_device(sign("Gate A", "north")).unwrap();
        device.record_heartbeat(&Telemetry::default(), now - time::Duration::seconds(40));
        store.save_device(&device).unwrap();

        // heartbeat arrivé entre le listing du monitor et la rétrogradation
        device.record_heartbeat(&Telemetry::default(), now);
        store.stage_device(&device).unwrap();
        assert!(store.demote_if_silent(&device.id, now, threshold).unwrap().is_none());
        assert!(store.get_device(&device.id).unwrap().unwrap().is_online());

        let later = now + time::Duration::seconds(31);
        fs::remove_dir_all(&data_dir).unwrap();
        assert!(store.demote_if_silent(&device.id, later, threshold).is_err());
        assert!(store.get_device(&device.id).unwrap().unwrap().is_online());

        fs::create_dir_all(&data_dir).unwrap();
        let demoted = store.demote_if_silent(&device.id, later, threshold).unwrap().unwrap();
        assert!(!demoted.is_online());
        assert!(store.demote_if_silent(&device.id, later, threshold).unwrap().is_none());
    }
}
