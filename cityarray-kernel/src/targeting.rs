/**
 * TARGETING - Résolution des cibles d'un message en ids de panneaux
 *
 * Règles :
 * - "all" (Targets::All) → tous les panneaux de l'événement du message
 *   (tout le parc si le message n'a pas d'événement)
 * - sinon union des ids explicites et des membres de chaque zone
 * - les ids explicites sont pris tels quels, même inconnus du store :
 *   leur livraison échouera simplement (false)
 */

use crate::store::{SignStore, StoreError};
use cityarray_contracts::{Message, Targets};
use std::collections::BTreeSet;

pub fn resolve(store: &dyn SignStore, message: &Message) -> Result<BTreeSet<String>, StoreError> {
    match &message.targets {
        Targets::All => Ok(store.event_members(message.event_id.as_deref())?.into_iter().collect()),
        Targets::Explicit { devices, zones } => {
            let mut ids = devices.clone();
            for zone in zones {
                ids.extend(store.zone_members(zone)?);
            }
            Ok(ids)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use cityarray_contracts::{Device, DeviceRegistration, MessageKind};
    use time::OffsetDateTime;

    fn add(store: &JsonStore, event: &str, zone: &str) -> String {
        let device = Device::register(
            DeviceRegistration {
                name: format!("{event}-{zone}"),
                event_id: Some(event.into()),
                zone_id: Some(zone.into()),
                ..Default::default()
            },
            OffsetDateTime::now_utc(),
        );
        store.create_device(device).unwrap().id
    }

    fn message(targets: Targets, event: Option<&str>) -> Message {
        let mut msg = Message::new(MessageKind::Standard, "hi", targets, OffsetDateTime::now_utc());
        msg.event_id = event.map(str::to_string);
        msg
    }

    #[test]
    fn test_all_resolves_to_event_members() {
        let store = JsonStore::in_memory();
        let a = add(&store, "fest", "north");
        let b = add(&store, "fest", "south");
        add(&store, "marathon", "north");

        let ids = resolve(&store, &message(Targets::All, Some("fest"))).unwrap();
        assert_eq!(ids, [a, b].into_iter().collect());
    }

    #[test]
    fn test_explicit_ids_and_zones_are_unioned() {
        let store = JsonStore::in_memory();
        let north = add(&store, "fest", "north");
        let south = add(&store, "fest", "south");

        let targets = Targets::from_lists(
            Some(vec![south.clone(), "ghost".into()]),
            Some(vec!["north".into()]),
        );
        let ids = resolve(&store, &message(targets, Some("fest"))).unwrap();
        assert_eq!(ids, [north, south, "ghost".to_string()].into_iter().collect());
    }

    #[test]
    fn test_all_sentinel_beats_explicit_ids() {
        let store = JsonStore::in_memory();
        let a = add(&store, "fest", "north");
        let b = add(&store, "fest", "south");

        let targets = Targets::from_lists(Some(vec![a.clone(), "all".into()]), None);
        let ids = resolve(&store, &message(targets, Some("fest"))).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&b));
    }
}
