/**
 * LIVENESS MONITOR - Rétrogradation des panneaux silencieux
 *
 * RÔLE : online --(pas de heartbeat depuis ≥ seuil)--> offline
 *
 * FONCTIONNEMENT :
 * - Balayage périodique (10s par défaut) des panneaux marqués online
 * - Transition persistée puis UN device_offline par panneau et par balayage ;
 *   un panneau déjà offline n'est plus candidat, donc jamais de doublon
 * - Écriture refusée = panneau laissé online, retenté (et annoncé) au tick suivant
 * - Erreur store = log + nouvel essai au prochain tick, aucun panneau
 *   n'est marqué offline à cause d'une erreur côté monitor
 * - En fin de balayage : flush des heartbeats en cache, expiration des messages
 */

use crate::dispatch::Dispatcher;
use crate::store::{DeviceFilter, StoreError};
use cityarray_contracts::{ConnectionStatus, ConsoleEvent};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub demoted: Vec<String>,
    pub expired: Vec<String>,
}

pub struct LivenessMonitor {
    dispatcher: Dispatcher,
    threshold: time::Duration,
}

impl LivenessMonitor {
    pub fn new(dispatcher: Dispatcher, threshold: time::Duration) -> Self {
        Self { dispatcher, threshold }
    }

    pub fn sweep(&self, now: OffsetDateTime) -> Result<SweepReport, StoreError> {
        let store = self.dispatcher.store();
        let online = DeviceFilter { status: Some(ConnectionStatus::Online), ..Default::default() };
        let candidates: Vec<String> = store
            .list_devices(&online)?
            .into_iter()
            .filter(|d| d.is_silent(now, self.threshold))
            .map(|d| d.id)
            .collect();

        let mut report = SweepReport::default();
        for id in candidates {
            // revérifié sous verrou : un heartbeat a pu arriver depuis le listing
            let Some(device) = store.demote_if_silent(&id, now, self.threshold)? else { continue };
            info!(device_id = %id, "panneau passé offline (silence heartbeat)");
            self.dispatcher.broadcast_to_consoles(&ConsoleEvent::DeviceOffline {
                device_id: id.clone(),
                last_seen: device.last_seen,
                timestamp: now,
            });
            report.demoted.push(id);
        }

        store.flush()?;

        match self.dispatcher.expire_messages(now) {
            Ok(expired) => report.expired = expired,
            Err(e) => warn!("expiration des messages échouée: {e}"),
        }
        Ok(report)
    }

    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        info!(
            threshold_secs = self.threshold.whole_seconds(),
            every_secs = every.as_secs(),
            "démarrage du monitoring liveness"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match self.sweep(OffsetDateTime::now_utc()) {
                    Ok(report) if !report.demoted.is_empty() || !report.expired.is_empty() => {
                        info!(demoted = report.demoted.len(), expired = report.expired.len(), "balayage liveness");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("balayage liveness échoué, nouvel essai au prochain tick: {e}"),
                }
            }
        })
    }
}
