/**
 * API REST CITYARRAY - Serveur HTTP + WebSocket du kernel
 *
 * RÔLE :
 * Surface opérateur (messages, overrides, panneaux) et repli HTTP pour les
 * panneaux sans canal persistant (enregistrement, heartbeat).
 *
 * FONCTIONNEMENT :
 * - Axum, middleware auth API key, sérialisation JSON automatique
 * - Routes : /health, /api/status, /api/signs, /api/messages, /api/override,
 *   /api/emergency, /api/templates, /ws/console, /ws/sign/{id}
 * - Erreurs métier → 404 (inconnu), 422 (requête invalide), 500 (store)
 *
 * SÉCURITÉ :
 * - x-api-key obligatoire sauf /health (ou ?api_key= pour les navigateurs,
 *   qui ne peuvent pas poser d'en-tête sur un WebSocket)
 */

use crate::dispatch::{Delivery, DispatchError, Dispatcher};
use crate::health::{HealthTracker, KernelHealth};
use crate::store::DeviceFilter;
use crate::ws;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use cityarray_contracts::{
    Device, DeviceRegistration, DisplayMode, EmergencyKind, EmergencyTemplate, Message, MessageKind,
    Priority, Targets, Telemetry,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub health: HealthTracker,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("CITYARRAY_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        error!("SECURITY: CITYARRAY_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    if !api_key_matches(req.headers(), req.uri(), &expected) {
        warn!(path, "accès refusé (api key)");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

/// En-tête x-api-key, ou paramètre ?api_key= (décodé)
fn api_key_matches(headers: &HeaderMap, uri: &Uri, expected: &str) -> bool {
    let from_header = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    from_header
        || Query::<ApiKeyQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(q)| q.api_key)
            .map(|key| key == expected)
            .unwrap_or(false)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/ws/console", get(ws::console_ws))
        .route("/ws/sign/{device_id}", get(ws::device_ws))
        .route("/api/signs", get(list_signs).post(register_sign))
        .route("/api/signs/{id}", get(get_sign))
        .route("/api/signs/{id}/heartbeat", post(sign_heartbeat))
        .route("/api/signs/{id}/ping", post(ping_sign))
        .route("/api/templates", get(list_templates))
        .route("/api/messages", get(list_messages).post(create_message))
        .route("/api/messages/{id}/clear", post(clear_message))
        .route("/api/emergency", post(trigger_emergency))
        .route("/api/override", post(create_override))
        .route("/api/override/{id}", delete(cancel_override))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

fn to_status(e: DispatchError) -> StatusCode {
    match e {
        DispatchError::UnknownDevice(_) | DispatchError::UnknownMessage(_) => StatusCode::NOT_FOUND,
        DispatchError::NotAnOverride(_) | DispatchError::Contract(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::Store(e) => {
            error!("store: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// GET /health (sans auth)
async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let registry = app.dispatcher.registry();
    Json(json!({
        "status": "healthy",
        "devices_connected": registry.device_count(),
        "consoles_connected": registry.console_count(),
    }))
}

// GET /api/status
async fn status(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.dispatcher))
}

#[derive(Debug, Deserialize)]
struct SignQuery {
    event_id: Option<String>,
    zone_id: Option<String>,
}

// GET /api/signs
async fn list_signs(
    State(app): State<AppState>,
    Query(q): Query<SignQuery>,
) -> Result<Json<Vec<Device>>, StatusCode> {
    let filter = DeviceFilter { event_id: q.event_id, zone_id: q.zone_id, status: None };
    app.dispatcher
        .store()
        .list_devices(&filter)
        .map(Json)
        .map_err(|e| to_status(e.into()))
}

// POST /api/signs
async fn register_sign(
    State(app): State<AppState>,
    Json(reg): Json<DeviceRegistration>,
) -> Result<(StatusCode, Json<Device>), StatusCode> {
    if reg.name.trim().is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    let device = app.dispatcher.register_device(reg).map_err(to_status)?;
    Ok((StatusCode::CREATED, Json(device)))
}

// GET /api/signs/{id}
async fn get_sign(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Device>, StatusCode> {
    match app.dispatcher.store().get_device(&id) {
        Ok(Some(device)) => Ok(Json(device)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(to_status(e.into())),
    }
}

#[derive(Debug, Serialize)]
struct HeartbeatReply {
    status: &'static str,
    pending_messages: Vec<Message>,
}

// POST /api/signs/{id}/heartbeat (repli HTTP)
async fn sign_heartbeat(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(telemetry): Json<Telemetry>,
) -> Result<Json<HeartbeatReply>, StatusCode> {
    let pending_messages = app.dispatcher.http_heartbeat(&id, &telemetry).map_err(to_status)?;
    Ok(Json(HeartbeatReply { status: "ok", pending_messages }))
}

// POST /api/signs/{id}/ping
async fn ping_sign(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match app.dispatcher.store().get_device(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => return Err(to_status(e.into())),
    }
    let delivered = app.dispatcher.ping(&id);
    Ok(Json(json!({ "device_id": id, "delivered": delivered })))
}

// GET /api/templates
async fn list_templates() -> Json<Vec<EmergencyTemplate>> {
    Json(EmergencyKind::catalog())
}

// GET /api/messages
async fn list_messages(State(app): State<AppState>) -> Result<Json<Vec<Message>>, StatusCode> {
    app.dispatcher.store().list_messages().map(Json).map_err(|e| to_status(e.into()))
}

/// Corps commun à POST /api/messages et POST /api/override
#[derive(Debug, Deserialize)]
struct ContentRequest {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    template_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    target_signs: Option<Vec<String>>,
    #[serde(default)]
    target_zones: Option<Vec<String>>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    mode: Option<DisplayMode>,
    #[serde(default)]
    audio_enabled: Option<bool>,
    #[serde(default)]
    audio_languages: Option<Vec<String>>,
    #[serde(default)]
    duration_seconds: Option<u32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    created_by: Option<String>,
}

impl ContentRequest {
    /// Contenu explicite, sinon celui du gabarit d'urgence nommé
    fn content(&self) -> Option<String> {
        if let Some(content) = self.content.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            return Some(content.to_string());
        }
        let template = self.template_id.as_deref()?.parse::<EmergencyKind>().ok()?;
        Some(template.template().content)
    }

    fn into_message(self, kind: MessageKind, now: OffsetDateTime) -> Result<Message, StatusCode> {
        let content = self.content().ok_or(StatusCode::UNPROCESSABLE_ENTITY)?;
        let targets = Targets::from_lists(self.target_signs, self.target_zones);
        let mut message = Message::new(kind, content, targets, now);
        message.event_id = self.event_id;
        message.template_id = self.template_id;
        message.created_by = self.created_by;
        match kind {
            MessageKind::Standard => {
                message.priority = self.priority.unwrap_or(Priority::LOW);
                message.mode = self.mode.unwrap_or_default();
                message.audio_enabled = self.audio_enabled.unwrap_or(false);
                message.audio_languages = self.audio_languages.unwrap_or_else(|| vec!["en".into()]);
                message.duration_seconds = Some(self.duration_seconds.unwrap_or(30));
                message.expires_at = self.expires_at;
            }
            MessageKind::Override => {
                message.priority = self.priority.unwrap_or(Priority::HIGH);
                message.mode = self.mode.unwrap_or_default();
                message.audio_enabled = self.audio_enabled.unwrap_or(true);
                message.audio_languages =
                    self.audio_languages.unwrap_or_else(|| vec!["en".into(), "es".into()]);
                // sans durée : jusqu'à annulation
                message.duration_seconds = self.duration_seconds;
                message.expires_at = self
                    .expires_at
                    .or_else(|| self.duration_seconds.map(|s| now + time::Duration::seconds(s as i64)));
            }
        }
        Ok(message)
    }
}

#[derive(Debug, Serialize)]
struct DeliveryReply {
    message: Message,
    targets: BTreeSet<String>,
    deliveries: BTreeMap<String, bool>,
    delivered: usize,
}

impl From<Delivery> for DeliveryReply {
    fn from(d: Delivery) -> Self {
        let delivered = d.deliveries.values().filter(|ok| **ok).count();
        Self { message: d.message, targets: d.targets, deliveries: d.deliveries, delivered }
    }
}

// POST /api/messages
async fn create_message(
    State(app): State<AppState>,
    Json(req): Json<ContentRequest>,
) -> Result<(StatusCode, Json<DeliveryReply>), StatusCode> {
    let message = req.into_message(MessageKind::Standard, OffsetDateTime::now_utc())?;
    let delivery = app.dispatcher.dispatch_message(message).map_err(to_status)?;
    Ok((StatusCode::CREATED, Json(delivery.into())))
}

// POST /api/messages/{id}/clear
async fn clear_message(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryReply>, StatusCode> {
    let delivery = app.dispatcher.clear_message(&id).map_err(to_status)?;
    Ok(Json(delivery.into()))
}

#[derive(Debug, Deserialize)]
struct EmergencyRequest {
    template: EmergencyKind,
    #[serde(default)]
    zone_id: Option<String>,
}

// POST /api/emergency
async fn trigger_emergency(
    State(app): State<AppState>,
    Json(req): Json<EmergencyRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let deliveries = app
        .dispatcher
        .trigger_emergency(req.template, req.zone_id.as_deref())
        .map_err(to_status)?;
    let delivered = deliveries.values().filter(|ok| **ok).count();
    Ok(Json(json!({
        "template": req.template,
        "zone_id": req.zone_id,
        "deliveries": deliveries,
        "delivered": delivered,
    })))
}

// POST /api/override
async fn create_override(
    State(app): State<AppState>,
    Json(req): Json<ContentRequest>,
) -> Result<(StatusCode, Json<DeliveryReply>), StatusCode> {
    let message = req.into_message(MessageKind::Override, OffsetDateTime::now_utc())?;
    let delivery = app.dispatcher.send_override(message).map_err(to_status)?;
    Ok((StatusCode::CREATED, Json(delivery.into())))
}

// DELETE /api/override/{id}
async fn cancel_override(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryReply>, StatusCode> {
    let delivery = app.dispatcher.cancel_override(&id).map_err(to_status)?;
    Ok(Json(delivery.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: serde_json::Value) -> ContentRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_override_defaults() {
        let now = OffsetDateTime::now_utc();
        let msg = request(json!({"content": "Gates closing"}))
            .into_message(MessageKind::Override, now)
            .unwrap();
        assert!(msg.targets.is_all());
        assert_eq!(msg.priority, Priority::HIGH);
        assert_eq!(msg.mode, DisplayMode::Insert);
        assert!(msg.audio_enabled);
        assert_eq!(msg.audio_languages, vec!["en", "es"]);
        assert!(msg.expires_at.is_none());
    }

    #[test]
    fn test_override_duration_sets_expiry() {
        let now = OffsetDateTime::now_utc();
        let msg = request(json!({
            "content": "Hold", "priority": "critical", "mode": "emergency",
            "target_zones": ["north"], "duration_seconds": 60
        }))
        .into_message(MessageKind::Override, now)
        .unwrap();
        assert_eq!(msg.priority.value(), 100);
        assert_eq!(msg.expires_at, Some(now + time::Duration::seconds(60)));
        assert!(!msg.targets.is_all());
    }

    #[test]
    fn test_template_fills_missing_content() {
        let now = OffsetDateTime::now_utc();
        let msg = request(json!({"template_id": "evacuate"}))
            .into_message(MessageKind::Standard, now)
            .unwrap();
        assert!(msg.content.starts_with("EVACUATE"));
        assert_eq!(msg.duration_seconds, Some(30));
        assert_eq!(msg.priority, Priority::LOW);

        let err = request(json!({"content": "   "})).into_message(MessageKind::Standard, now);
        assert_eq!(err.unwrap_err(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_api_key_header_or_decoded_query() {
        let key = "s3cr3t+/=";
        let mut headers = HeaderMap::new();
        let plain: Uri = "/ws/console".parse().unwrap();
        assert!(!api_key_matches(&headers, &plain, key));

        let encoded: Uri = "/ws/console?zone=north&api_key=s3cr3t%2B%2F%3D".parse().unwrap();
        assert!(api_key_matches(&headers, &encoded, key));
        let raw: Uri = "/ws/console?api_key=s3cr3t+/=".parse().unwrap();
        assert!(!api_key_matches(&headers, &raw, key));

        headers.insert("x-api-key", key.parse().unwrap());
        assert!(api_key_matches(&headers, &plain, key));
    }

    #[test]
    fn test_emergency_request_names() {
        let req: EmergencyRequest = serde_json::from_value(json!({"template": "evacuate", "zone_id": "north"})).unwrap();
        assert_eq!(req.template, EmergencyKind::Evacuate);
        assert_eq!(req.zone_id.as_deref(), Some("north"));
    }
}
