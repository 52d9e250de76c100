use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    llamadash_protocol::{Broadcast, Frame, events, now_ms},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    broadcast::{send_reply, send_to},
    methods::MethodRegistry,
    state::{ConnectedClient, GatewayState},
};

/// Serve one upgraded socket until either side closes it.
///
/// The gateway speaks first with `connection:open`, answers the client's
/// `connection:ack` with `connection:established`, and dispatches every
/// other frame as a request on its own task so a slow handler never
/// stalls the read loop.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (client_tx, mut client_rx) = mpsc::channel::<String>(state.config.outbound_capacity());
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(text) = client_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws write failed, closing writer");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    state
        .register_client(ConnectedClient::new(
            conn_id.clone(),
            client_tx,
            Some(remote_addr),
        ))
        .await;
    info!(conn_id = %conn_id, remote_ip = %remote_addr, "Client connected");

    let hello = Broadcast::ConnectionOpen {
        client_id: conn_id.clone(),
    };
    match hello.into_frame() {
        Ok(frame) => {
            send_to(&state, &conn_id, &frame).await;
        },
        Err(e) => warn!(conn_id = %conn_id, error = %e, "failed to encode hello"),
    }

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws read error");
                break;
            },
        };

        let frame = match Frame::from_text(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "invalid frame");
                continue;
            },
        };
        state.touch_client(&conn_id).await;

        if frame.event == events::CONNECTION_ACK {
            let established = Broadcast::ConnectionEstablished {
                client_id: conn_id.clone(),
                timestamp: now_ms(),
            };
            if let Ok(frame) = established.into_frame() {
                send_reply(&state, &conn_id, &frame).await;
            }
            continue;
        }

        let state = Arc::clone(&state);
        let methods = Arc::clone(&methods);
        let conn_id = conn_id.clone();
        tokio::spawn(async move {
            let reply = methods.dispatch(Arc::clone(&state), &conn_id, frame).await;
            if !send_reply(&state, &conn_id, &reply).await {
                warn!(conn_id = %conn_id, event = %reply.event, "reply dropped");
            }
        });
    }

    let duration = state
        .remove_client(&conn_id)
        .await
        .map(|c| c.connected_at.elapsed())
        .unwrap_or_default();
    write_handle.abort();
    info!(
        conn_id = %conn_id,
        duration_secs = duration.as_secs(),
        "Client disconnected"
    );
}
