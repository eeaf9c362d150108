/**
 * DISPATCH COORDINATOR - Routage du contenu et relais des statuts
 *
 * RÔLE :
 * Pousse les messages vers les panneaux joignables, diffuse les événements
 * de statut aux consoles opérateur et traite les signaux entrants des panneaux.
 *
 * FONCTIONNEMENT :
 * - Registry injecté (pas d'état global), store via le trait SignStore
 * - Livraison best-effort : un panneau absent = false, jamais une erreur,
 *   rien n'est mis en file côté serveur
 * - Diffusion consoles sur un snapshot, retraits appliqués APRÈS l'itération ;
 *   l'échec d'une console n'affecte pas les autres
 * - Override : statut active immédiat, cibles recalculées à l'annulation
 * - Effacement / urgence / ping : commandes opérateur directes vers les panneaux
 *
 * UTILITÉ DANS CITYARRAY :
 * 🎯 API REST : messages, overrides, enregistrement
 * 🎯 Sockets : heartbeat / metrics / ack / offline_report
 * 🎯 Liveness : expiration des messages
 */

use crate::mqtt::AnalyticsBridge;
use crate::registry::{Connection, ConnectionRegistry, ConnectivityEvent};
use crate::state::{new_state, Shared};
use crate::store::{DeviceFilter, SignStore, StoreError};
use crate::targeting;
use cityarray_contracts::{
    encode, ConsoleEvent, ContractError, Device, DeviceCommand, DeviceRegistration, DeviceSignal,
    EmergencyKind, Message, MessageStatus, OfflineReport, Telemetry,
};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("unknown message: {0}")]
    UnknownMessage(String),
    #[error("message {0} is not an override")]
    NotAnOverride(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Résultat d'un envoi : cibles résolues + livraison par panneau
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub targets: BTreeSet<String>,
    pub deliveries: BTreeMap<String, bool>,
}

/// Nombre de rapports hors ligne mémorisés pour la déduplication
const REPORT_MEMORY: usize = 4096;

/// Rapports déjà relayés, bornés : les plus anciens sont oubliés en premier
#[derive(Debug, Default)]
struct RelayedReports {
    seen: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
}

impl RelayedReports {
    /// false si le rapport a déjà été relayé
    fn insert(&mut self, key: (String, String)) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > REPORT_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    store: Arc<dyn SignStore>,
    analytics: Option<AnalyticsBridge>,
    /// (device id, entry id) déjà relayés
    seen_reports: Shared<RelayedReports>,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry, store: Arc<dyn SignStore>, analytics: Option<AnalyticsBridge>) -> Self {
        Self {
            registry,
            store,
            analytics,
            seen_reports: new_state(RelayedReports::default()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn SignStore {
        self.store.as_ref()
    }

    // ---- Envoi ------------------------------------------------------------

    pub fn send_to_device(&self, device_id: &str, command: &DeviceCommand) -> bool {
        match encode(command) {
            Ok(frame) => self.send_frame(device_id, frame),
            Err(e) => {
                warn!(device_id, "commande non sérialisable: {e}");
                false
            }
        }
    }

    pub fn send_to_devices<'a, I>(&self, ids: I, command: &DeviceCommand) -> BTreeMap<String, bool>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let frame = match encode(command) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("commande non sérialisable: {e}");
                return ids.into_iter().map(|id| (id.clone(), false)).collect();
            }
        };
        ids.into_iter()
            .map(|id| (id.clone(), self.send_frame(id, frame.clone())))
            .collect()
    }

    pub fn send_to_zone(&self, zone_id: &str, command: &DeviceCommand) -> Result<BTreeMap<String, bool>, StoreError> {
        let members = self.store.zone_members(zone_id)?;
        Ok(self.send_to_devices(members.iter(), command))
    }

    fn send_frame(&self, device_id: &str, frame: String) -> bool {
        let Some(conn) = self.registry.device(device_id) else {
            debug!(device_id, "panneau non connecté, envoi ignoré");
            return false;
        };
        if conn.send_text(frame) {
            return true;
        }
        warn!(device_id, "envoi échoué, connexion retirée");
        if let Some(event) = self.registry.remove(&conn) {
            self.notify_connectivity(event);
        }
        false
    }

    /// Retourne le nombre de consoles atteintes
    pub fn broadcast_to_consoles(&self, event: &ConsoleEvent) -> usize {
        let frame = match encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = event.kind(), "événement non sérialisable: {e}");
                return 0;
            }
        };

        let consoles = self.registry.consoles_snapshot();
        let mut failed = Vec::new();
        let mut delivered = 0;
        for console in &consoles {
            if console.send_text(frame.clone()) {
                delivered += 1;
            } else {
                failed.push(console);
            }
        }
        for console in failed {
            debug!(console = %console.id, "console morte retirée");
            self.registry.remove(console);
        }
        delivered
    }

    // ---- Connexions -------------------------------------------------------

    pub fn console_connected(&self, conn: Connection) {
        let welcome = ConsoleEvent::Connected {
            consoles: self.registry.console_count() + 1,
            devices: self.registry.device_count(),
        };
        if let Ok(frame) = encode(&welcome) {
            conn.send_text(frame);
        }
        info!(console = %conn.id, "console connectée");
        self.registry.register(conn);
    }

    pub fn device_connected(&self, conn: Connection) {
        let Some(device_id) = conn.device_id().map(str::to_string) else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        match self.store.get_device(&device_id) {
            Ok(Some(mut device)) => {
                device.record_heartbeat(&Telemetry::default(), now);
                if let Err(e) = self.store.stage_device(&device) {
                    warn!(device_id = %device_id, "statut non enregistré: {e}");
                }
            }
            Ok(None) => warn!(device_id = %device_id, "connexion d'un panneau non enregistré"),
            Err(e) => warn!(device_id = %device_id, "store indisponible: {e}"),
        }

        if let Ok(frame) = encode(&DeviceCommand::Connected { device_id: device_id.clone() }) {
            conn.send_text(frame);
        }
        if let Some(event) = self.registry.register(conn) {
            self.notify_connectivity(event);
        }
    }

    pub fn connection_closed(&self, conn: &Connection) {
        if let Some(event) = self.registry.remove(conn) {
            self.notify_connectivity(event);
        }
    }

    fn notify_connectivity(&self, event: ConnectivityEvent) {
        let timestamp = OffsetDateTime::now_utc();
        let console_event = match event {
            ConnectivityEvent::Connected { device_id, preempted } => {
                info!(device_id = %device_id, preempted, "panneau connecté");
                ConsoleEvent::DeviceConnected { device_id, timestamp }
            }
            ConnectivityEvent::Disconnected { device_id } => {
                info!(device_id = %device_id, "panneau déconnecté");
                ConsoleEvent::DeviceDisconnected { device_id, timestamp }
            }
        };
        self.broadcast_to_consoles(&console_event);
    }

    // ---- Signaux entrants -------------------------------------------------

    pub fn handle_inbound(&self, device_id: &str, signal: DeviceSignal) -> Result<(), DispatchError> {
        let now = OffsetDateTime::now_utc();
        match signal {
            DeviceSignal::Heartbeat(telemetry) => {
                let device = self.record_heartbeat(device_id, &telemetry, now)?;
                self.broadcast_to_consoles(&ConsoleEvent::DeviceUpdate(device));
            }
            DeviceSignal::Metrics(metrics) => {
                if let Some(bridge) = &self.analytics {
                    bridge.publish_metrics(device_id, &metrics);
                }
                self.broadcast_to_consoles(&ConsoleEvent::DeviceMetrics {
                    device_id: device_id.to_string(),
                    metrics,
                });
            }
            DeviceSignal::Ack(ack) => {
                self.record_ack(device_id, &ack.message_id)?;
                self.broadcast_to_consoles(&ConsoleEvent::MessageAck {
                    device_id: device_id.to_string(),
                    message_id: ack.message_id,
                    timestamp: now,
                });
            }
            DeviceSignal::OfflineReport(report) => self.relay_offline_report(device_id, report),
        }
        Ok(())
    }

    fn record_heartbeat(&self, device_id: &str, telemetry: &Telemetry, now: OffsetDateTime) -> Result<Device, DispatchError> {
        let mut device = self
            .store
            .get_device(device_id)?
            .ok_or_else(|| DispatchError::UnknownDevice(device_id.to_string()))?;
        device.record_heartbeat(telemetry, now);
        self.store.stage_device(&device)?;
        Ok(device)
    }

    fn record_ack(&self, device_id: &str, message_id: &str) -> Result<(), DispatchError> {
        if let Some(mut message) = self.store.get_message(message_id)? {
            if message.status == MessageStatus::Active {
                message.transition(MessageStatus::Displayed)?;
                self.store.save_message(&message)?;
            }
        } else {
            debug!(device_id, message_id, "ack pour un message inconnu");
        }
        if let Some(mut device) = self.store.get_device(device_id)? {
            device.current_message_id = Some(message_id.to_string());
            self.store.stage_device(&device)?;
        }
        Ok(())
    }

    fn relay_offline_report(&self, device_id: &str, report: OfflineReport) {
        let key = (device_id.to_string(), report.entry_id.clone());
        if !self.seen_reports.lock().insert(key) {
            debug!(device_id, entry = %report.entry_id, "rapport hors ligne déjà relayé");
            return;
        }
        info!(device_id, entry = %report.entry_id, "rapport hors ligne reçu");
        self.broadcast_to_consoles(&ConsoleEvent::OfflineReport {
            device_id: device_id.to_string(),
            report,
        });
    }

    // ---- Pipeline opérateur -----------------------------------------------

    pub fn register_device(&self, registration: DeviceRegistration) -> Result<Device, DispatchError> {
        let device = self.store.create_device(Device::register(registration, OffsetDateTime::now_utc()))?;
        info!(device_id = %device.id, name = %device.name, "panneau enregistré");
        self.broadcast_to_consoles(&ConsoleEvent::DeviceRegistered(device.clone()));
        Ok(device)
    }

    /// Heartbeat HTTP : met à jour la télémétrie et retourne les messages en attente pour ce panneau
    pub fn http_heartbeat(&self, device_id: &str, telemetry: &Telemetry) -> Result<Vec<Message>, DispatchError> {
        let device = self.record_heartbeat(device_id, telemetry, OffsetDateTime::now_utc())?;
        self.broadcast_to_consoles(&ConsoleEvent::DeviceUpdate(device));
        Ok(self.pending_for_device(device_id)?)
    }

    pub fn pending_for_device(&self, device_id: &str) -> Result<Vec<Message>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut pending = Vec::new();
        for message in self.store.list_messages()? {
            if !message.is_live() || message.is_expired_at(now) {
                continue;
            }
            if targeting::resolve(self.store.as_ref(), &message)?.contains(device_id) {
                pending.push(message);
            }
        }
        Ok(pending)
    }

    pub fn snapshot_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.store.list_devices(&DeviceFilter::default())
    }

    /// Message standard : pending → active dès qu'au moins une cible est atteinte
    pub fn dispatch_message(&self, mut message: Message) -> Result<Delivery, DispatchError> {
        self.store.insert_message(&message)?;
        let targets = targeting::resolve(self.store.as_ref(), &message)?;
        let deliveries = self.send_to_devices(targets.iter(), &DeviceCommand::NewMessage(message.clone()));

        if message.status == MessageStatus::Pending && deliveries.values().any(|ok| *ok) {
            message.transition(MessageStatus::Active)?;
            self.store.save_message(&message)?;
        }
        info!(
            message_id = %message.id,
            targets = targets.len(),
            delivered = deliveries.values().filter(|ok| **ok).count(),
            "message envoyé"
        );
        self.broadcast_to_consoles(&ConsoleEvent::MessageSent {
            message: message.clone(),
            deliveries: deliveries.clone(),
        });
        Ok(Delivery { message, targets, deliveries })
    }

    pub fn send_override(&self, message: Message) -> Result<Delivery, DispatchError> {
        if !message.is_override() {
            return Err(DispatchError::NotAnOverride(message.id));
        }
        self.store.insert_message(&message)?;
        let targets = targeting::resolve(self.store.as_ref(), &message)?;
        let deliveries = self.send_to_devices(targets.iter(), &DeviceCommand::Override(message.clone()));
        info!(
            message_id = %message.id,
            priority = message.priority.value(),
            mode = ?message.mode,
            targets = targets.len(),
            "override activé"
        );
        self.broadcast_to_consoles(&ConsoleEvent::OverrideActivated {
            message: message.clone(),
            targets: targets.clone(),
            deliveries: deliveries.clone(),
        });
        Ok(Delivery { message, targets, deliveries })
    }

    /// Cibles recalculées au moment de l'annulation (membres de zone actuels)
    pub fn cancel_override(&self, message_id: &str) -> Result<Delivery, DispatchError> {
        let mut message = self
            .store
            .get_message(message_id)?
            .ok_or_else(|| DispatchError::UnknownMessage(message_id.to_string()))?;
        if !message.is_override() {
            return Err(DispatchError::NotAnOverride(message_id.to_string()));
        }
        message.transition(MessageStatus::Cancelled)?;
        self.store.save_message(&message)?;

        let (targets, deliveries) = self.withdraw(&message)?;
        info!(message_id, targets = targets.len(), "override annulé");
        Ok(Delivery { message, targets, deliveries })
    }

    fn withdraw(&self, message: &Message) -> Result<(BTreeSet<String>, BTreeMap<String, bool>), DispatchError> {
        let targets = targeting::resolve(self.store.as_ref(), message)?;
        let deliveries = self.send_to_devices(
            targets.iter(),
            &DeviceCommand::OverrideCancelled { message_id: message.id.clone() },
        );
        self.broadcast_to_consoles(&ConsoleEvent::OverrideCancelled {
            message_id: message.id.clone(),
            targets: targets.clone(),
        });
        Ok((targets, deliveries))
    }

    /// Expire les messages vivants dont `expires_at` est dépassé.
    /// Retrait poussé AVANT la persistance : un échec laisse le message vivant,
    /// repris au balayage suivant.
    pub fn expire_messages(&self, now: OffsetDateTime) -> Result<Vec<String>, DispatchError> {
        let mut expired = Vec::new();
        for mut message in self.store.list_messages()? {
            if !message.is_live() || !message.is_expired_at(now) {
                continue;
            }
            if message.is_override() {
                if let Err(e) = self.withdraw(&message) {
                    warn!(message_id = %message.id, "retrait de l'override échoué: {e}");
                    continue;
                }
            }
            message.transition(MessageStatus::Expired)?;
            if let Err(e) = self.store.save_message(&message) {
                warn!(message_id = %message.id, "expiration non enregistrée: {e}");
                continue;
            }
            self.broadcast_to_consoles(&ConsoleEvent::MessageExpired { message_id: message.id.clone() });
            expired.push(message.id);
        }
        Ok(expired)
    }

    /// Efface un message des panneaux ciblés ; un message vivant passe à cancelled
    pub fn clear_message(&self, message_id: &str) -> Result<Delivery, DispatchError> {
        let mut message = self
            .store
            .get_message(message_id)?
            .ok_or_else(|| DispatchError::UnknownMessage(message_id.to_string()))?;
        if message.is_live() {
            message.transition(MessageStatus::Cancelled)?;
            self.store.save_message(&message)?;
        }

        let targets = targeting::resolve(self.store.as_ref(), &message)?;
        let deliveries = self.send_to_devices(
            targets.iter(),
            &DeviceCommand::ClearMessage { message_id: Some(message.id.clone()) },
        );
        info!(message_id, targets = targets.len(), "message effacé");
        self.broadcast_to_consoles(&ConsoleEvent::MessageCleared {
            message_id: message.id.clone(),
            targets: targets.clone(),
        });
        Ok(Delivery { message, targets, deliveries })
    }

    /// Gabarit d'urgence poussé à une zone, ou à tout le parc sans zone
    pub fn trigger_emergency(
        &self,
        template: EmergencyKind,
        zone_id: Option<&str>,
    ) -> Result<BTreeMap<String, bool>, DispatchError> {
        let command = DeviceCommand::Emergency { template };
        let deliveries = match zone_id {
            Some(zone) => self.send_to_zone(zone, &command)?,
            None => {
                let everyone = self.store.event_members(None)?;
                self.send_to_devices(everyone.iter(), &command)
            }
        };
        warn!(
            %template,
            zone = zone_id.unwrap_or("*"),
            delivered = deliveries.values().filter(|ok| **ok).count(),
            "urgence déclenchée"
        );
        self.broadcast_to_consoles(&ConsoleEvent::EmergencyTriggered {
            template,
            zone_id: zone_id.map(str::to_string),
            deliveries: deliveries.clone(),
        });
        Ok(deliveries)
    }

    pub fn ping(&self, device_id: &str) -> bool {
        self.send_to_device(device_id, &DeviceCommand::Ping)
    }
}
