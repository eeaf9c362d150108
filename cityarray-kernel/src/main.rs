/**
 * CITYARRAY KERNEL - Point d'entrée du serveur de dispatch
 *
 * RÔLE : Orchestration des modules : config, store, registry, dispatch,
 * liveness, pont MQTT optionnel, HTTP + WebSocket.
 *
 * ARCHITECTURE : Registry injecté dans le Dispatcher (aucun état global),
 * balayage liveness en tâche indépendante, API REST + sockets via Axum.
 * UTILITÉ : Point central de diffusion de contenu vers le parc de panneaux.
 */

mod config;
mod dispatch;
mod health;
mod http;
mod liveness;
mod mqtt;
mod registry;
mod state;
mod store;
mod targeting;
mod ws;

use crate::config::load_config;
use crate::dispatch::Dispatcher;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::liveness::LivenessMonitor;
use crate::mqtt::AnalyticsBridge;
use crate::registry::ConnectionRegistry;
use crate::store::JsonStore;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    let store = JsonStore::open(cfg.store_path())
        .with_context(|| format!("ouverture du store {:?}", cfg.store_path()))?;

    let health = HealthTracker::new();
    let bridge = cfg.mqtt.as_ref().map(|mqtt| {
        info!(host = %mqtt.host, port = mqtt.port, "pont analytics MQTT activé");
        AnalyticsBridge::connect(mqtt, health.clone())
    });

    let dispatcher = Dispatcher::new(ConnectionRegistry::new(), Arc::new(store), bridge.clone());

    // balayage liveness + expiration des messages
    LivenessMonitor::new(dispatcher.clone(), cfg.liveness.threshold()).spawn(cfg.liveness.sweep_interval());

    if let Some(bridge) = bridge {
        health.spawn_health_publisher(bridge, dispatcher.clone(), cfg.health_interval());
    }

    let app = http::build_router(AppState { dispatcher, health });

    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!("listening on http://{}", cfg.bind);
    axum::serve(listener, app).await.context("serveur HTTP")?;
    Ok(())
}
