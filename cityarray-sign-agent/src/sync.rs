//! Offline queue replay
//!
//! Runs on a fresh connection before any other traffic. Entries are sent in
//! sequence order and marked sent only after the frame went out, so a crash
//! between the two produces at most one duplicate (the kernel dedups on
//! `(device, entry_id)`).

use crate::cache::{CacheError, LocalCache, QueueEntry};
use crate::state::Shared;
use cityarray_contracts::{encode, ContractError, DeviceSignal};
use futures::{Sink, SinkExt};
use std::fmt::Display;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("send failed after {sent} entries: {reason}")]
    Send { sent: usize, reason: String },
    #[error(transparent)]
    Encode(#[from] ContractError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub async fn send_report<S>(sink: &mut S, entry: &QueueEntry) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = encode(&DeviceSignal::OfflineReport(entry.to_report())).map_err(|e| e.to_string())?;
    sink.send(Message::Text(frame.into())).await.map_err(|e| e.to_string())
}

pub async fn replay_pending<S>(cache: &Shared<LocalCache>, sink: &mut S) -> Result<usize, ReplayError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let pending = cache.lock().pending();
    if pending.is_empty() {
        return Ok(0);
    }

    let mut sent = 0;
    for entry in &pending {
        send_report(sink, entry)
            .await
            .map_err(|reason| ReplayError::Send { sent, reason })?;
        cache.lock().mark_sent(entry.seq)?;
        debug!("Replayed offline entry {}", entry.seq);
        sent += 1;
    }

    let pruned = cache.lock().prune_sent()?;
    info!("Offline queue synchronized: {} sent, {} pruned", sent, pruned);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_state;
    use cityarray_contracts::{decode, EmergencyKind};
    use futures::channel::mpsc;
    use futures::StreamExt;
    use tempfile::tempdir;

    fn entry_ids(frames: Vec<Message>) -> Vec<String> {
        frames
            .into_iter()
            .map(|m| match decode::<DeviceSignal>(m.to_text().unwrap()).unwrap() {
                DeviceSignal::OfflineReport(report) => report.entry_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replay_in_order_then_empty() {
        let dir = tempdir().unwrap();
        let cache = new_state(LocalCache::open(dir.path().join("cache.json")).unwrap());
        let a = cache.lock().enqueue("OFFLINE: evacuate", Some(EmergencyKind::Evacuate)).unwrap();
        let b = cache.lock().enqueue("OFFLINE: medical", Some(EmergencyKind::Medical)).unwrap();

        let (mut tx, rx) = mpsc::unbounded::<Message>();
        assert_eq!(replay_pending(&cache, &mut tx).await.unwrap(), 2);
        drop(tx);
        assert_eq!(entry_ids(rx.collect().await), vec![a.id, b.id]);
        assert!(cache.lock().pending().is_empty());

        let (mut tx, _rx) = mpsc::unbounded::<Message>();
        assert_eq!(replay_pending(&cache, &mut tx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_entries() {
        let dir = tempdir().unwrap();
        let cache = new_state(LocalCache::open(dir.path().join("cache.json")).unwrap());
        cache.lock().enqueue("OFFLINE: shelter", None).unwrap();

        let (mut tx, rx) = mpsc::unbounded::<Message>();
        drop(rx);
        let err = replay_pending(&cache, &mut tx).await.unwrap_err();
        assert!(matches!(err, ReplayError::Send { sent: 0, .. }));
        assert_eq!(cache.lock().pending().len(), 1);
    }

    #[tokio::test]
    async fn test_crash_between_send_and_mark_duplicates_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let (mut tx, rx) = mpsc::unbounded::<Message>();
        {
            let mut cache = LocalCache::open(&path).unwrap();
            let entry = cache.enqueue("OFFLINE: evacuate", Some(EmergencyKind::Evacuate)).unwrap();
            // frame leaves, process dies before the sent flag is written
            send_report(&mut tx, &entry).await.unwrap();
        }

        let cache = new_state(LocalCache::open(&path).unwrap());
        assert_eq!(replay_pending(&cache, &mut tx).await.unwrap(), 1);
        assert_eq!(replay_pending(&cache, &mut tx).await.unwrap(), 0);
        drop(tx);

        let ids = entry_ids(rx.collect().await);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }
}
