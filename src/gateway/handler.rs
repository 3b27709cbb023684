//! WebSocket transport for the host channel.
//!
//! A host opens `GET /hosts/connect`, sends a `register` frame, and from then
//! on exchanges JSON frames with the gateway until either side closes.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::gateway::connection::{ConnectionId, HostGateway};
use crate::gateway::messages::{HostMessage, ServerMessage};

/// How long a new connection may stay silent before its `register` frame.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<HostGateway>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<HostGateway>) {
    let (mut sink, mut stream) = socket.split();

    let first = tokio::time::timeout(REGISTER_TIMEOUT, next_frame(&mut stream)).await;
    let (host_name, claims) = match first {
        Ok(Some(HostMessage::Register { host_name, claims })) => (host_name, claims),
        Ok(Some(other)) => {
            tracing::warn!(frame = ?other, "First frame was not a registration");
            reject(&mut sink, "expected register frame").await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            tracing::warn!("Host did not register in time");
            reject(&mut sink, "registration timed out").await;
            return;
        }
    };

    let (id, host, outgoing_rx) = match gateway.connect(&host_name, &claims) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(host = %host_name, error = %e, "Host registration rejected");
            reject(&mut sink, &e.to_string()).await;
            return;
        }
    };

    let registered = ServerMessage::Registered {
        host_name: host.name.clone(),
        group: host.group.clone(),
    };
    let outgoing = tokio::spawn(forward_outgoing(sink, outgoing_rx, registered));

    process_incoming(stream, id, &gateway).await;

    outgoing.abort();
    gateway.disconnect(id);
}

/// Read frames until one parses as a [`HostMessage`] or the stream ends.
async fn next_frame(stream: &mut SplitStream<WebSocket>) -> Option<HostMessage> {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<HostMessage>(text.as_str()) {
                Ok(msg) => return Some(msg),
                Err(e) => tracing::debug!(error = %e, "Unparseable host frame"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let frame = ServerMessage::Rejected {
        reason: reason.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink.close().await;
}

async fn forward_outgoing(
    mut sink: SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::Receiver<ServerMessage>,
    initial: ServerMessage,
) {
    let mut pending = Some(initial);
    loop {
        let msg = match pending.take() {
            Some(msg) => msg,
            None => match outgoing_rx.recv().await {
                Some(msg) => msg,
                None => break,
            },
        };
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize host frame"),
        }
    }
}

async fn process_incoming(
    mut stream: SplitStream<WebSocket>,
    id: ConnectionId,
    gateway: &HostGateway,
) {
    while let Some(msg) = next_frame(&mut stream).await {
        gateway.handle_message(id, msg).await;
    }
}
