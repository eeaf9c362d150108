//! Network path detection and cellular failover
//!
//! This module handles:
//! - Active interface selection by configured priority
//! - Primary vs cellular classification
//! - Bringing the cellular link up (`nmcli`, then `pon`)
//! - The failover decision after consecutive connect failures

use cityarray_contracts::PathKind;
use if_addrs::get_if_addrs;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePath {
    pub interface: String,
    pub kind: PathKind,
}

pub fn classify(interface: &str, cellular: &[String]) -> PathKind {
    if cellular.iter().any(|c| c == interface) {
        PathKind::Cellular
    } else {
        PathKind::Primary
    }
}

/// Picks among interfaces that are up: configured priority first, then any
/// other non-loopback interface.
pub fn select_active(up: &[String], priority: &[String], cellular: &[String]) -> Option<ActivePath> {
    let chosen = priority
        .iter()
        .find(|p| up.contains(*p))
        .or_else(|| up.first())?;
    Some(ActivePath {
        interface: chosen.clone(),
        kind: classify(chosen, cellular),
    })
}

pub fn detect_active(priority: &[String], cellular: &[String]) -> Option<ActivePath> {
    let interfaces = match get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            warn!("Failed to enumerate interfaces: {}", e);
            return None;
        }
    };

    let mut up: Vec<String> = Vec::new();
    for iface in interfaces.into_iter().filter(|i| !i.is_loopback()) {
        debug!("Interface up: {} ({})", iface.name, iface.ip());
        if !up.contains(&iface.name) {
            up.push(iface.name);
        }
    }
    select_active(&up, priority, cellular)
}

/// Runs each bring-up command in turn (by default `nmcli con up cellular`,
/// then `pon cellular`). Waits `settle` after the first success.
pub async fn enable_cellular(commands: &[Vec<String>], command_timeout: Duration, settle: Duration) -> bool {
    for command in commands {
        let Some((program, args)) = command.split_first() else {
            continue;
        };
        let run = Command::new(program).args(args).kill_on_drop(true).output();
        match tokio::time::timeout(command_timeout, run).await {
            Ok(Ok(output)) if output.status.success() => {
                info!("Cellular link raised via {}", program);
                tokio::time::sleep(settle).await;
                return true;
            }
            Ok(Ok(output)) => {
                warn!(
                    "{} failed: {}",
                    program,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(Err(e)) => warn!("{} unavailable: {}", program, e),
            Err(_) => warn!("{} timed out after {:?}", program, command_timeout),
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    Retry,
    AttemptFailover,
    GoOffline,
}

/// Counts consecutive connect failures. Failover is attempted once per
/// outage; a second exhaustion (or one that starts on cellular) goes offline.
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    threshold: u32,
    failures: u32,
    failover_used: bool,
}

impl FailoverPolicy {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: 0,
            failover_used: false,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self, on_cellular: bool) -> FailoverDecision {
        self.failures += 1;
        if self.failures < self.threshold {
            FailoverDecision::Retry
        } else if on_cellular || self.failover_used {
            FailoverDecision::GoOffline
        } else {
            FailoverDecision::AttemptFailover
        }
    }

    /// Cellular came up: start counting again on the new path.
    pub fn failover_succeeded(&mut self) {
        self.failures = 0;
        self.failover_used = true;
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.failover_used = false;
    }
}
