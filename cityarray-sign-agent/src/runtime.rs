//! Sign runtime: drives the link lifecycle
//!
//! Each step looks at the current `LinkState` and performs exactly one
//! action (register, connect, fail over, wait offline). A connected session
//! owns its writer, heartbeat and network monitor tasks; all three are
//! aborted together when the session ends, and the heartbeat also checks its
//! generation so nothing from an old session reaches a new socket.

use crate::cache::LocalCache;
use crate::capabilities::SignCapabilities;
use crate::client::{KernelClient, WsStream};
use crate::config::SignConfig;
use crate::handler::{handle_command, Presenter};
use crate::identity;
use crate::lifecycle::{Lifecycle, LinkState};
use crate::network::{self, ActivePath, FailoverDecision, FailoverPolicy};
use crate::state::{new_state, Shared};
use crate::sync;
use crate::telemetry;
use anyhow::{anyhow, Result};
use cityarray_contracts::{decode, encode, DeviceCommand, DeviceRegistration, DeviceSignal, PathKind};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// One `metrics` signal every this many heartbeats.
const METRICS_EVERY: u64 = 12;

/// State shared between the runtime and the offline console.
#[derive(Clone)]
pub struct RuntimeHandles {
    pub lifecycle: Arc<Lifecycle>,
    pub cache: Shared<LocalCache>,
    pub presenter: Arc<Mutex<Presenter>>,
    pub reconnect: Arc<Notify>,
}

pub struct Runtime {
    config: SignConfig,
    client: KernelClient,
    capabilities: SignCapabilities,
    handles: RuntimeHandles,
    active_path: Shared<Option<ActivePath>>,
    policy: FailoverPolicy,
    device_id: Option<String>,
}

struct SessionTasks(Vec<AbortHandle>);

impl Drop for SessionTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

impl Runtime {
    pub fn new(
        config: SignConfig,
        client: KernelClient,
        capabilities: SignCapabilities,
        handles: RuntimeHandles,
        device_id: Option<String>,
    ) -> Self {
        let policy = FailoverPolicy::new(config.network.failover_threshold);
        Self {
            config,
            client,
            capabilities,
            handles,
            active_path: new_state(None),
            policy,
            device_id,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            self.step().await?;
        }
    }

    async fn step(&mut self) -> Result<()> {
        match self.handles.lifecycle.state() {
            LinkState::Unregistered => {
                let next = if self.device_id.is_some() {
                    LinkState::Reconnecting
                } else {
                    LinkState::Registering
                };
                self.handles.lifecycle.transition(next)?;
            }
            LinkState::Registering => self.register().await?,
            LinkState::Reconnecting => self.reconnect().await?,
            LinkState::FailoverAttempt => self.failover().await?,
            LinkState::Offline => self.offline().await?,
            LinkState::Connected => {
                // sessions always leave Connected themselves
                self.handles.lifecycle.transition(LinkState::Reconnecting)?;
            }
        }
        Ok(())
    }

    fn registration(&self) -> DeviceRegistration {
        DeviceRegistration {
            name: self.config.sign.name.clone(),
            event_id: self.config.sign.event_id.clone(),
            zone_id: self.config.sign.zone_id.clone(),
            hardware_id: hostname::get().ok().map(|h| h.to_string_lossy().to_string()),
            display_type: self.config.sign.display_type.clone(),
            has_speaker: self.capabilities.has_speaker,
        }
    }

    async fn register(&mut self) -> Result<()> {
        match self.client.register(&self.registration()).await {
            Ok(device) => {
                if let Err(e) = identity::save_device_id(&self.config.device_id_path(), &device.id).await {
                    warn!("Failed to persist device id: {}", e);
                }
                self.device_id = Some(device.id);
                self.refresh_templates().await;
                self.handles.lifecycle.transition(LinkState::Reconnecting)?;
            }
            Err(e) => {
                warn!("Registration failed: {:#}", e);
                self.enter_offline()?;
            }
        }
        Ok(())
    }

    async fn refresh_templates(&self) {
        match self.client.fetch_templates().await {
            Ok(templates) => {
                if let Err(e) = self.handles.cache.lock().cache_templates(templates) {
                    warn!("Failed to cache templates: {}", e);
                }
            }
            Err(e) => debug!("Template refresh skipped: {:#}", e),
        }
    }

    fn refresh_path(&self) -> Option<ActivePath> {
        let detected = network::detect_active(&self.config.network.interfaces, &self.config.network.cellular_interfaces);
        *self.active_path.lock() = detected.clone();
        detected
    }

    fn ws_url(&self) -> Result<String> {
        let device_id = self
            .device_id
            .as_deref()
            .ok_or_else(|| anyhow!("no device id to connect with"))?;
        Ok(self.config.ws_url(device_id))
    }

    async fn reconnect(&mut self) -> Result<()> {
        let url = self.ws_url()?;
        match self.client.connect(&url).await {
            Ok(ws) => {
                self.policy.reset();
                self.run_session(ws).await
            }
            Err(e) => {
                let on_cellular = self.refresh_path().map(|p| p.kind) == Some(PathKind::Cellular);
                let decision = self.policy.record_failure(on_cellular);
                warn!(
                    "Connect failed ({} consecutive): {:#} -> {:?}",
                    self.policy.failures(),
                    e,
                    decision
                );
                match decision {
                    FailoverDecision::Retry => {
                        tokio::time::sleep(self.config.timing.reconnect_delay()).await;
                        self.handles.lifecycle.transition(LinkState::Reconnecting)?;
                    }
                    FailoverDecision::AttemptFailover => {
                        self.handles.lifecycle.transition(LinkState::FailoverAttempt)?;
                    }
                    FailoverDecision::GoOffline => self.enter_offline()?,
                }
                Ok(())
            }
        }
    }

    async fn failover(&mut self) -> Result<()> {
        let net = &self.config.network;
        let raised = network::enable_cellular(
            &net.cellular_commands,
            Duration::from_secs(net.cellular_command_timeout_secs),
            Duration::from_secs(net.cellular_settle_secs),
        )
        .await;
        if raised {
            self.policy.failover_succeeded();
            self.refresh_path();
            self.handles.lifecycle.transition(LinkState::Reconnecting)?;
        } else {
            self.enter_offline()?;
        }
        Ok(())
    }

    fn enter_offline(&self) -> Result<()> {
        self.handles.lifecycle.transition(LinkState::Offline)?;
        warn!("Kernel unreachable, sign is offline");
        Ok(())
    }

    async fn offline(&mut self) -> Result<()> {
        tokio::select! {
            _ = self.handles.reconnect.notified() => info!("Operator requested reconnect"),
            _ = tokio::time::sleep(self.config.timing.network_check()) => {}
        }

        let Some(device_id) = self.device_id.clone() else {
            self.handles.lifecycle.transition(LinkState::Registering)?;
            return Ok(());
        };

        match self.client.connect(&self.config.ws_url(&device_id)).await {
            Ok(ws) => {
                info!("Kernel reachable again");
                self.policy.reset();
                self.run_session(ws).await
            }
            Err(e) => {
                debug!("Still offline: {:#}", e);
                self.http_fallback(&device_id).await;
                Ok(())
            }
        }
    }

    /// Socket down but HTTP may still get through: report in and pick up live content.
    async fn http_fallback(&self, device_id: &str) {
        let active = self.refresh_path();
        let current = self.handles.presenter.lock().await.current_message_id();
        let telemetry = telemetry::collect(active.as_ref(), current);
        match self.client.heartbeat(device_id, &telemetry).await {
            Ok(messages) => {
                let mut presenter = self.handles.presenter.lock().await;
                for message in &messages {
                    presenter.show_message(message).await;
                }
                debug!("HTTP heartbeat delivered {} messages", messages.len());
            }
            Err(e) => debug!("HTTP heartbeat failed: {:#}", e),
        }
    }

    async fn run_session(&mut self, ws: WsStream) -> Result<()> {
        let generation = self.handles.lifecycle.transition(LinkState::Connected)?.generation;
        let (mut sink, mut stream) = ws.split();

        // queued offline triggers go out before anything else
        if let Err(e) = sync::replay_pending(&self.handles.cache, &mut sink).await {
            warn!("Offline queue replay incomplete: {}", e);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<DeviceSignal>();
        let mut writer = tokio::spawn(write_loop(sink, out_rx));

        let heartbeat = Heartbeat {
            lifecycle: self.handles.lifecycle.clone(),
            generation,
            every: self.config.timing.heartbeat(),
            path: self.active_path.clone(),
            presenter: self.handles.presenter.clone(),
        };
        let monitor = NetworkMonitor {
            every: self.config.timing.network_check(),
            interfaces: self.config.network.interfaces.clone(),
            cellular: self.config.network.cellular_interfaces.clone(),
            path: self.active_path.clone(),
        };
        let client = self.client.clone();
        let cache = self.handles.cache.clone();
        let tasks = SessionTasks(vec![
            tokio::spawn(heartbeat.run(out_tx.clone())).abort_handle(),
            tokio::spawn(monitor.run()).abort_handle(),
            tokio::spawn(async move {
                if let Ok(templates) = client.fetch_templates().await {
                    if let Err(e) = cache.lock().cache_templates(templates) {
                        warn!("Failed to cache templates: {}", e);
                    }
                }
            })
            .abort_handle(),
        ]);

        loop {
            tokio::select! {
                _ = &mut writer => {
                    warn!("Session writer stopped");
                    break;
                }
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match decode::<DeviceCommand>(&text) {
                        Ok(command) => {
                            if let Some(reply) = handle_command(&self.handles.presenter, &self.handles.cache, command).await {
                                let _ = out_tx.send(reply);
                            }
                        }
                        Err(e) => warn!("Undecodable kernel frame: {}", e),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!("Kernel closed the session: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Session read error: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }

        self.handles.lifecycle.transition(LinkState::Reconnecting)?;
        drop(tasks);
        writer.abort();
        tokio::time::sleep(self.config.timing.reconnect_delay()).await;
        Ok(())
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, WsMessage>, mut rx: UnboundedReceiver<DeviceSignal>) {
    while let Some(signal) = rx.recv().await {
        let frame = match encode(&signal) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode signal: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
            warn!("Send failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

pub(crate) struct Heartbeat {
    lifecycle: Arc<Lifecycle>,
    generation: u64,
    every: Duration,
    path: Shared<Option<ActivePath>>,
    presenter: Arc<Mutex<Presenter>>,
}

impl Heartbeat {
    pub(crate) async fn run(self, out: UnboundedSender<DeviceSignal>) {
        let mut interval = tokio::time::interval(self.every);
        let mut beats: u64 = 0;
        loop {
            interval.tick().await;
            if !self.lifecycle.is_current(self.generation) {
                debug!("Heartbeat for session {} stopped", self.generation);
                return;
            }
            let current = self.presenter.lock().await.current_message_id();
            let active = self.path.lock().clone();
            if out.send(DeviceSignal::Heartbeat(telemetry::collect(active.as_ref(), current))).is_err() {
                return;
            }
            beats += 1;
            if beats % METRICS_EVERY == 0 && out.send(DeviceSignal::Metrics(telemetry::system_metrics())).is_err() {
                return;
            }
        }
    }
}

struct NetworkMonitor {
    every: Duration,
    interfaces: Vec<String>,
    cellular: Vec<String>,
    path: Shared<Option<ActivePath>>,
}

impl NetworkMonitor {
    async fn run(self) {
        let mut interval = tokio::time::interval(self.every);
        loop {
            interval.tick().await;
            let detected = network::detect_active(&self.interfaces, &self.cellular);
            let mut current = self.path.lock();
            if *current != detected {
                match &detected {
                    Some(p) => info!("Active network path: {} ({:?})", p.interface, p.kind),
                    None => warn!("No active network interface"),
                }
                *current = detected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{cache, presenter};
    use cityarray_contracts::{EmergencyKind, Message, MessageKind, Targets};
    use tempfile::TempDir;
    use time::OffsetDateTime;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn handles(state: LinkState) -> (TempDir, RuntimeHandles) {
        let (dir, cache) = cache();
        let lifecycle = Lifecycle::new(LinkState::Unregistered);
        if state != LinkState::Unregistered {
            lifecycle.transition(LinkState::Reconnecting).unwrap();
            if state != LinkState::Reconnecting {
                lifecycle.transition(state).unwrap();
            }
        }
        let handles = RuntimeHandles {
            lifecycle: Arc::new(lifecycle),
            cache,
            presenter: Arc::new(presenter()),
            reconnect: Arc::new(Notify::new()),
        };
        (dir, handles)
    }

    fn runtime(port: u16, handles: RuntimeHandles, state_dir: &std::path::Path) -> Runtime {
        let mut config = SignConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = port;
        config.timing.reconnect_delay_secs = 0;
        config.timing.connect_timeout_secs = 2;
        config.state_dir = state_dir.to_path_buf();
        let client = KernelClient::new(&config).unwrap();
        Runtime::new(config, client, SignCapabilities::default(), handles, Some("sign-1".into()))
    }

    #[tokio::test]
    async fn test_heartbeat_stops_with_its_session() {
        let (_dir, handles) = handles(LinkState::Connected);
        let generation = handles.lifecycle.snapshot().generation;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(
            Heartbeat {
                lifecycle: handles.lifecycle.clone(),
                generation,
                every: Duration::from_millis(10),
                path: new_state(None),
                presenter: handles.presenter.clone(),
            }
            .run(tx),
        );

        assert!(matches!(rx.recv().await, Some(DeviceSignal::Heartbeat(_))));

        handles.lifecycle.transition(LinkState::Reconnecting).unwrap();
        handles.lifecycle.transition(LinkState::Connected).unwrap();
        // the new session has a new generation; the old loop must exit on its own
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_without_id_registers() {
        let (dir, handles) = handles(LinkState::Unregistered);
        let mut rt = runtime(9, handles.clone(), dir.path());
        rt.device_id = None;
        rt.step().await.unwrap();
        assert_eq!(handles.lifecycle.state(), LinkState::Registering);
    }

    #[tokio::test]
    async fn test_failures_escalate_to_failover() {
        let (dir, handles) = handles(LinkState::Reconnecting);
        // nothing listens on this port
        let mut rt = runtime(unused_port(), handles.clone(), dir.path());
        rt.config.network.failover_threshold = 2;
        rt.policy = FailoverPolicy::new(2);
        // force the primary-path branch regardless of the host's interfaces
        rt.config.network.cellular_interfaces.clear();

        rt.step().await.unwrap();
        assert_eq!(handles.lifecycle.state(), LinkState::Reconnecting);
        rt.step().await.unwrap();
        assert_eq!(handles.lifecycle.state(), LinkState::FailoverAttempt);
    }

    #[tokio::test]
    async fn test_session_replays_then_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let message = Message::new(MessageKind::Standard, "Doors open", Targets::All, OffsetDateTime::now_utc());
        let message_id = message.id.clone();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let mut signals = Vec::new();

            let first = ws.next().await.unwrap().unwrap();
            signals.push(decode::<DeviceSignal>(first.to_text().unwrap()).unwrap());

            let frame = encode(&DeviceCommand::NewMessage(message)).unwrap();
            ws.send(WsMessage::Text(frame.into())).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let WsMessage::Text(text) = frame {
                    let signal = decode::<DeviceSignal>(&text).unwrap();
                    let done = matches!(signal, DeviceSignal::Ack(_));
                    signals.push(signal);
                    if done {
                        break;
                    }
                }
            }
            ws.close(None).await.unwrap();
            signals
        });

        let (dir, handles) = handles(LinkState::Reconnecting);
        let entry = handles.cache.lock().enqueue("OFFLINE: evacuate", Some(EmergencyKind::Evacuate)).unwrap();
        let mut rt = runtime(port, handles.clone(), dir.path());

        let ws = rt.client.connect(&rt.config.ws_url("sign-1")).await.unwrap();
        rt.run_session(ws).await.unwrap();

        assert_eq!(handles.lifecycle.state(), LinkState::Reconnecting);
        assert_eq!(handles.lifecycle.snapshot().generation, 1);
        assert!(handles.cache.lock().pending().is_empty());

        let signals = server.await.unwrap();
        match &signals[0] {
            DeviceSignal::OfflineReport(report) => assert_eq!(report.entry_id, entry.id),
            other => panic!("expected offline report first, got {other:?}"),
        }
        match signals.last().unwrap() {
            DeviceSignal::Ack(ack) => assert_eq!(ack.message_id, message_id),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_failover_without_cellular_goes_offline() {
        let (dir, handles) = handles(LinkState::FailoverAttempt);
        let mut rt = runtime(unused_port(), handles.clone(), dir.path());
        rt.config.network.cellular_commands = vec![vec!["false".into()]];
        rt.config.network.cellular_settle_secs = 0;

        rt.step().await.unwrap();
        assert_eq!(handles.lifecycle.state(), LinkState::Offline);
    }

    #[tokio::test]
    async fn test_failover_is_tried_once_per_outage() {
        let (dir, handles) = handles(LinkState::FailoverAttempt);
        let mut rt = runtime(unused_port(), handles.clone(), dir.path());
        rt.config.network.cellular_commands = vec![vec!["true".into()]];
        rt.config.network.cellular_settle_secs = 0;
        rt.config.network.cellular_interfaces.clear();
        rt.policy = FailoverPolicy::new(1);

        rt.step().await.unwrap();
        assert_eq!(handles.lifecycle.state(), LinkState::Reconnecting);
        // still refused after the switch: no second failover
        rt.step().await.unwrap();
        assert_eq!(handles.lifecycle.state(), LinkState::Offline);
    }

    #[tokio::test]
    async fn test_offline_recovers_and_replays_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let signal = decode::<DeviceSignal>(first.to_text().unwrap()).unwrap();
            ws.close(None).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            signal
        });

        let (dir, handles) = handles(LinkState::Offline);
        let entry = handles.cache.lock().enqueue("OFFLINE: shelter", Some(EmergencyKind::Shelter)).unwrap();
        let mut rt = runtime(port, handles.clone(), dir.path());

        // operator typed "reconnect" on the local console
        handles.reconnect.notify_one();
        rt.step().await.unwrap();

        assert_eq!(handles.lifecycle.snapshot().generation, 1);
        assert_eq!(handles.lifecycle.state(), LinkState::Reconnecting);
        assert!(handles.cache.lock().pending().is_empty());
        match server.await.unwrap() {
            DeviceSignal::OfflineReport(report) => {
                assert_eq!(report.entry_id, entry.id);
                assert_eq!(report.template, Some(EmergencyKind::Shelter));
            }
            other => panic!("expected offline report, got {other:?}"),
        }
    }
}
