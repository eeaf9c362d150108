/**
 * CONNECTION REGISTRY - Carte unique des connexions temps réel
 *
 * RÔLE :
 * Source de vérité pour "le panneau X est-il joignable maintenant".
 * Une connexion par device id, un ensemble non borné de consoles opérateur.
 *
 * FONCTIONNEMENT :
 * - Chaque connexion = id + rôle + sender mpsc vers la tâche writer du socket
 * - register(device) ferme d'abord l'ancienne connexion du même id (préemption)
 * - remove() ne retire un device que si la connexion stockée est bien celle-ci :
 *   une connexion préemptée qui se termine ne produit aucun device_disconnected
 * - Les événements de connectivité sont RETOURNÉS, jamais diffusés ici :
 *   c'est le Dispatcher qui notifie les consoles
 */

use crate::state::{new_state, Shared};
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Trame à écrire sur un socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Console,
    Device(String),
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub role: Role,
    pub connected_at: OffsetDateTime,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Retourne la connexion et le récepteur que la tâche writer du socket draine
    pub fn new(role: Role) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id: Uuid::new_v4(),
            role,
            connected_at: OffsetDateTime::now_utc(),
            tx,
        };
        (conn, rx)
    }

    /// false si le writer est déjà terminé
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn device_id(&self) -> Option<&str> {
        match &self.role {
            Role::Device(id) => Some(id),
            Role::Console => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected { device_id: String, preempted: bool },
    Disconnected { device_id: String },
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    devices: Shared<HashMap<String, Connection>>,
    consoles: Shared<HashMap<Uuid, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            devices: new_state(HashMap::new()),
            consoles: new_state(HashMap::new()),
        }
    }

    pub fn register(&self, conn: Connection) -> Option<ConnectivityEvent> {
        match conn.role.clone() {
            Role::Console => {
                self.consoles.lock().insert(conn.id, conn);
                None
            }
            Role::Device(device_id) => {
                let previous = self.devices.lock().insert(device_id.clone(), conn);
                let preempted = match previous {
                    Some(old) => {
                        info!(device_id = %device_id, old = %old.id, "connexion préemptée");
                        old.close();
                        true
                    }
                    None => false,
                };
                Some(ConnectivityEvent::Connected { device_id, preempted })
            }
        }
    }

    /// Idempotent. Ne retourne un événement que si la connexion retirée était la connexion courante.
    pub fn remove(&self, conn: &Connection) -> Option<ConnectivityEvent> {
        match &conn.role {
            Role::Console => {
                self.consoles.lock().remove(&conn.id);
                None
            }
            Role::Device(device_id) => {
                let mut devices = self.devices.lock();
                let is_current = devices.get(device_id).map(|c| c.id == conn.id).unwrap_or(false);
                if !is_current {
                    debug!(device_id = %device_id, conn = %conn.id, "remove ignoré (connexion absente ou remplacée)");
                    return None;
                }
                devices.remove(device_id);
                Some(ConnectivityEvent::Disconnected { device_id: device_id.clone() })
            }
        }
    }

    pub fn is_device_connected(&self, device_id: &str) -> bool {
        self.devices.lock().contains_key(device_id)
    }

    pub fn connected_device_ids(&self) -> BTreeSet<String> {
        self.devices.lock().keys().cloned().collect()
    }

    pub fn device(&self, device_id: &str) -> Option<Connection> {
        self.devices.lock().get(device_id).cloned()
    }

    /// Copie stable pour itérer sans tenir le verrou pendant les envois
    pub fn consoles_snapshot(&self) -> Vec<Connection> {
        self.consoles.lock().values().cloned().collect()
    }

    pub fn console_count(&self) -> usize {
        self.consoles.lock().len()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}
