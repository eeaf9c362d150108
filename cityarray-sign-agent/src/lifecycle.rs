//! Link lifecycle state machine
//!
//! One owner drives transitions; every other task observes through a
//! `watch` receiver. Each entry into `Connected` bumps a generation so tasks
//! spawned for an older session can tell they are stale.

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unregistered,
    Registering,
    Connected,
    Reconnecting,
    FailoverAttempt,
    Offline,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Unregistered, Reconnecting)
                | (Registering, Reconnecting)
                | (Registering, Offline)
                | (Reconnecting, Connected)
                | (Reconnecting, Reconnecting)
                | (Reconnecting, FailoverAttempt)
                | (Reconnecting, Offline)
                | (Connected, Reconnecting)
                | (FailoverAttempt, Reconnecting)
                | (FailoverAttempt, Offline)
                | (Offline, Reconnecting)
                | (Offline, Connected)
                | (Offline, Registering)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub generation: u64,
}

#[derive(Debug, Error)]
#[error("invalid link transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: LinkState,
    pub to: LinkState,
}

pub struct Lifecycle {
    tx: watch::Sender<LinkSnapshot>,
}

impl Lifecycle {
    pub fn new(initial: LinkState) -> Self {
        let (tx, _rx) = watch::channel(LinkSnapshot { state: initial, generation: 0 });
        Self { tx }
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        *self.tx.borrow()
    }

    pub fn state(&self) -> LinkState {
        self.snapshot().state
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.tx.subscribe()
    }

    pub fn transition(&self, to: LinkState) -> Result<LinkSnapshot, TransitionError> {
        let mut outcome = Err(TransitionError { from: self.state(), to });
        self.tx.send_if_modified(|snap| {
            if !snap.state.can_transition_to(to) {
                outcome = Err(TransitionError { from: snap.state, to });
                return false;
            }
            snap.state = to;
            if to == LinkState::Connected {
                snap.generation += 1;
            }
            outcome = Ok(*snap);
            true
        });
        if let Ok(snap) = &outcome {
            tracing::info!(state = ?snap.state, generation = snap.generation, "link state");
        }
        outcome
    }

    /// True only while the session that observed `generation` is still the live one.
    pub fn is_current(&self, generation: u64) -> bool {
        let snap = self.snapshot();
        snap.state == LinkState::Connected && snap.generation == generation
    }
}
