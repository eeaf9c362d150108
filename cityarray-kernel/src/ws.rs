/**
 * SOCKETS TEMPS RÉEL - /ws/console et /ws/sign/{id}
 *
 * FONCTIONNEMENT :
 * - Socket scindé : tâche writer alimentée par le mpsc de la Connection,
 *   boucle reader qui décode chaque trame UNE fois en type somme
 * - Fin du writer (préemption, sink mort) ou du reader → retrait du registry
 * - Trame invalide = log, la session continue
 */

use crate::dispatch::Dispatcher;
use crate::http::AppState;
use crate::registry::{Connection, Outbound, Role};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use cityarray_contracts::{decode, encode, ConsoleEvent, ConsoleRequest, DeviceSignal};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub async fn console_ws(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| console_session(socket, app.dispatcher))
}

pub async fn device_ws(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    State(app): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| device_session(socket, device_id, app.dispatcher))
}

fn spawn_writer(mut sink: SplitSink<WebSocket, WsMessage>, mut rx: UnboundedReceiver<Outbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Text(text) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    })
}

/// Prochaine trame texte ; None quand le socket est fermé
async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(WsMessage::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn device_session(socket: WebSocket, device_id: String, dispatcher: Dispatcher) {
    let (sink, mut stream) = socket.split();
    let (conn, rx) = Connection::new(Role::Device(device_id.clone()));
    let mut writer = spawn_writer(sink, rx);
    dispatcher.device_connected(conn.clone());

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = next_text(&mut stream) => {
                let Some(frame) = frame else { break };
                match decode::<DeviceSignal>(&frame) {
                    Ok(signal) => {
                        if let Err(e) = dispatcher.handle_inbound(&device_id, signal) {
                            warn!(device_id = %device_id, "signal non traité: {e}");
                        }
                    }
                    Err(e) => warn!(device_id = %device_id, "trame invalide: {e}"),
                }
            }
        }
    }

    let duree = time::OffsetDateTime::now_utc() - conn.connected_at;
    debug!(device_id = %device_id, conn = %conn.id, secs = duree.whole_seconds(), "fin de session panneau");
    dispatcher.connection_closed(&conn);
    writer.abort();
}

async fn console_session(socket: WebSocket, dispatcher: Dispatcher) {
    let (sink, mut stream) = socket.split();
    let (conn, rx) = Connection::new(Role::Console);
    let mut writer = spawn_writer(sink, rx);
    dispatcher.console_connected(conn.clone());

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = next_text(&mut stream) => {
                let Some(frame) = frame else { break };
                match decode::<ConsoleRequest>(&frame) {
                    Ok(ConsoleRequest::GetAllDevices) => reply_snapshot(&dispatcher, &conn),
                    Err(e) => warn!(console = %conn.id, "requête console invalide: {e}"),
                }
            }
        }
    }

    dispatcher.connection_closed(&conn);
    writer.abort();
}

fn reply_snapshot(dispatcher: &Dispatcher, conn: &Connection) {
    let devices = match dispatcher.snapshot_devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("snapshot impossible: {e}");
            return;
        }
    };
    match encode(&ConsoleEvent::AllDevices(devices)) {
        Ok(frame) => {
            conn.send_text(frame);
        }
        Err(e) => warn!("snapshot non sérialisable: {e}"),
    }
}
