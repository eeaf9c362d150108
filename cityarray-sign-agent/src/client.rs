//! Kernel client: HTTP registration plus the realtime WebSocket
//!
//! This module handles:
//! - `POST /api/signs` registration and `GET /api/templates`
//! - HTTP heartbeat fallback while the socket is down
//! - Opening `/ws/sign/{id}` with the API key header

use crate::config::SignConfig;
use anyhow::{Context, Result};
use cityarray_contracts::{Device, DeviceRegistration, EmergencyTemplate, Message, Telemetry};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::ClientRequestBuilder;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
struct HeartbeatReply {
    #[serde(default)]
    pending_messages: Vec<Message>,
}

#[derive(Clone)]
pub struct KernelClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    connect_timeout: Duration,
}

impl KernelClient {
    pub fn new(config: &SignConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timing.connect_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.http_base(),
            api_key: config.server.api_key.clone(),
            connect_timeout: config.timing.connect_timeout(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    pub async fn register(&self, registration: &DeviceRegistration) -> Result<Device> {
        let device: Device = self
            .request(reqwest::Method::POST, "/api/signs")
            .json(registration)
            .send()
            .await
            .context("Registration request failed")?
            .error_for_status()?
            .json()
            .await
            .context("Invalid registration reply")?;
        info!("Registered as {} ({})", device.id, device.name);
        Ok(device)
    }

    pub async fn fetch_templates(&self) -> Result<Vec<EmergencyTemplate>> {
        let templates = self
            .request(reqwest::Method::GET, "/api/templates")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(templates)
    }

    /// Returns whatever live messages the kernel still has for this sign.
    pub async fn heartbeat(&self, device_id: &str, telemetry: &Telemetry) -> Result<Vec<Message>> {
        let reply: HeartbeatReply = self
            .request(reqwest::Method::POST, &format!("/api/signs/{device_id}/heartbeat"))
            .json(telemetry)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.pending_messages)
    }

    pub async fn connect(&self, ws_url: &str) -> Result<WsStream> {
        let uri: Uri = ws_url.parse().context("Invalid WebSocket URL")?;
        let mut request = ClientRequestBuilder::new(uri);
        if let Some(key) = &self.api_key {
            request = request.with_header(API_KEY_HEADER, key.as_str());
        }

        debug!("Connecting to {}", ws_url);
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .context("WebSocket connect timed out")?
            .context("WebSocket connect failed")?;
        Ok(ws)
    }
}
