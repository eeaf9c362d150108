//! CITYARRAY Sign Agent - resilient runtime for a single display sign
//!
//! Keeps a sign useful whatever the network does:
//! - Registration and a realtime session with the dispatch kernel
//! - Heartbeats with battery, signal and path telemetry
//! - Cellular failover when the primary path keeps failing
//! - Offline emergency templates with a durable report queue

mod audio;
mod cache;
mod capabilities;
mod client;
mod config;
mod console;
mod display;
mod handler;
mod identity;
mod lifecycle;
mod network;
mod runtime;
mod state;
mod sync;
mod telemetry;

use crate::audio::AudioSink;
use crate::cache::LocalCache;
use crate::capabilities::SignCapabilities;
use crate::client::KernelClient;
use crate::config::SignConfig;
use crate::console::OfflineConsole;
use crate::display::DisplaySink;
use crate::handler::Presenter;
use crate::lifecycle::{Lifecycle, LinkState};
use crate::runtime::{Runtime, RuntimeHandles};
use crate::state::new_state;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting CITYARRAY sign agent v{}", env!("CARGO_PKG_VERSION"));

    let config = SignConfig::load().await.context("Failed to load configuration")?;
    if !SignConfig::config_file_path()?.exists() {
        match config.save().await {
            Ok(()) => info!("Wrote default configuration to {:?}", SignConfig::config_file_path()?),
            Err(e) => warn!("Could not write default configuration: {:#}", e),
        }
    }
    if config.server.api_key.is_none() {
        warn!("No API key configured; the kernel will reject the sign if it enforces one");
    }

    let cache = LocalCache::open(config.cache_path())
        .with_context(|| format!("Failed to open cache {:?}", config.cache_path()))?;
    let device_id = identity::load_device_id(&config.device_id_path()).await;
    match &device_id {
        Some(id) => info!("Known sign identity: {}", id),
        None => info!("No stored identity, will register as '{}'", config.sign.name),
    }

    let capabilities = SignCapabilities::detect();
    if !capabilities.cellular_tooling {
        warn!("Neither nmcli nor pon found; cellular failover will fail");
    }
    let audio = AudioSink::new(config.display.audio_enabled, capabilities.tts);
    info!("Audio announcements: {}", if audio.is_available() { "on" } else { "off" });
    let presenter = Presenter::new(DisplaySink::new(config.display.sink_url.clone()), audio);

    let handles = RuntimeHandles {
        lifecycle: Arc::new(Lifecycle::new(LinkState::Unregistered)),
        cache: new_state(cache),
        presenter: Arc::new(Mutex::new(presenter)),
        reconnect: Arc::new(Notify::new()),
    };
    let shutdown = Arc::new(Notify::new());

    tokio::spawn(
        OfflineConsole {
            lifecycle: handles.lifecycle.clone(),
            presenter: handles.presenter.clone(),
            cache: handles.cache.clone(),
            reconnect: handles.reconnect.clone(),
            shutdown: shutdown.clone(),
        }
        .run(),
    );

    let client = KernelClient::new(&config)?;
    let runtime = Runtime::new(config, client, capabilities, handles, device_id);

    tokio::select! {
        result = runtime.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
        _ = shutdown.notified() => {
            info!("Operator quit");
            Ok(())
        }
    }
}
