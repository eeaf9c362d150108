/*!
# CITYARRAY Contracts - Contrats filaires partagés kernel ↔ panneaux

Types communs aux deux extrémités du canal temps réel :
- Enveloppe `{type, data}` décodée une seule fois en types somme
  (`DeviceSignal`, `DeviceCommand`, `ConsoleEvent`, `ConsoleRequest`)
- Modèle Message (priorité ordinale, mode, cycle de vie, cibles)
- Modèle Device (statut, télémétrie)
- Catalogue des gabarits d'urgence disponibles hors ligne
*/

pub mod device;
pub mod message;
pub mod signals;
pub mod templates;

pub use device::{ConnectionStatus, Device, DeviceRegistration, PathKind, Telemetry};
pub use message::{DisplayMode, Message, MessageKind, MessageStatus, Priority, Targets};
pub use signals::{
    decode, encode, AckSignal, ConsoleEvent, ConsoleRequest, DeviceCommand, DeviceSignal,
    OfflineReport,
};
pub use templates::{DisplayColor, EmergencyKind, EmergencyTemplate};

/// Erreurs de décodage ou de transition sur les contrats
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid message transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("unknown emergency template: {0}")]
    UnknownTemplate(String),
}
