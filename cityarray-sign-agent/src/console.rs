//! Local operator console, active while the sign is offline
//!
//! Lets staff on site put an emergency template on screen without the
//! kernel. Every trigger is queued durably and reported once the link is back.

use crate::cache::LocalCache;
use crate::handler::{emergency_template, Presenter};
use crate::lifecycle::{Lifecycle, LinkState};
use crate::state::Shared;
use cityarray_contracts::EmergencyKind;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Trigger(EmergencyKind),
    Clear,
    Reconnect,
    Quit,
    Help,
    Empty,
    Unknown(String),
}

pub fn parse_command(line: &str) -> ConsoleCommand {
    let line = line.trim();
    match line.to_ascii_lowercase().as_str() {
        "" => ConsoleCommand::Empty,
        "clear" => ConsoleCommand::Clear,
        "reconnect" | "retry" => ConsoleCommand::Reconnect,
        "quit" | "exit" => ConsoleCommand::Quit,
        "help" | "?" => ConsoleCommand::Help,
        other => other
            .parse::<EmergencyKind>()
            .map(ConsoleCommand::Trigger)
            .unwrap_or_else(|_| ConsoleCommand::Unknown(line.to_string())),
    }
}

pub struct OfflineConsole {
    pub lifecycle: Arc<Lifecycle>,
    pub presenter: Arc<Mutex<Presenter>>,
    pub cache: Shared<LocalCache>,
    pub reconnect: Arc<Notify>,
    pub shutdown: Arc<Notify>,
}

impl OfflineConsole {
    pub async fn run(self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut link = self.lifecycle.subscribe();
        loop {
            tokio::select! {
                changed = link.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let state = link.borrow_and_update().state;
                    match state {
                        LinkState::Offline => {
                            println!("*** OFFLINE - local emergency console active ***");
                            print_help();
                        }
                        LinkState::Connected => println!("*** Kernel link up ***"),
                        _ => {}
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !self.execute(parse_command(&line)).await {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!("Console input closed: {}", e);
                        return;
                    }
                },
            }
        }
    }

    /// Returns false once the operator asked to quit.
    pub async fn execute(&self, command: ConsoleCommand) -> bool {
        let offline = self.lifecycle.state() == LinkState::Offline;
        match command {
            ConsoleCommand::Quit => {
                self.shutdown.notify_one();
                return false;
            }
            ConsoleCommand::Help | ConsoleCommand::Empty => print_help(),
            ConsoleCommand::Unknown(input) => println!("Unknown command: {input} (type 'help')"),
            _ if !offline => println!("Kernel link is up; local commands are disabled"),
            ConsoleCommand::Reconnect => self.reconnect.notify_one(),
            ConsoleCommand::Clear => {
                self.presenter.lock().await.clear(None).await;
            }
            ConsoleCommand::Trigger(kind) => self.trigger(kind).await,
        }
        true
    }

    async fn trigger(&self, kind: EmergencyKind) {
        let template = emergency_template(&self.cache, kind);
        self.presenter.lock().await.show_template(&template).await;
        let queued = self.cache.lock().enqueue(format!("OFFLINE: {kind}"), Some(kind));
        match queued {
            Ok(entry) => info!("Offline trigger {} queued as #{}", kind, entry.seq),
            Err(e) => error!("Failed to queue offline trigger {}: {}", kind, e),
        }
    }
}

fn print_help() {
    let names: Vec<&str> = EmergencyKind::ALL.iter().map(|k| k.as_str()).collect();
    println!("Templates: {}", names.join(", "));
    println!("Other: clear, reconnect, quit");
}
