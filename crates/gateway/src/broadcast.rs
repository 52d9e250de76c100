//! Server pushes: producers publish on an [`EventBus`], one fan-out task
//! delivers each [`Broadcast`] to every connected client.

use std::{sync::Arc, time::Duration};

use {
    llamadash_protocol::{Broadcast, Frame},
    tokio::{sync::broadcast, task::JoinHandle, time},
    tracing::{debug, warn},
};

use crate::state::GatewayState;

const BUS_CAPACITY: usize = 1024;

/// How long a request reply may wait for room in a full outbound queue.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable publish handle shared by every producer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Broadcast>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to every subscriber. A push with nobody listening is dropped.
    pub fn publish(&self, event: Broadcast) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }
}

/// Serialize `frame` once and queue it on every client. Returns how many
/// clients accepted it.
pub async fn broadcast_frame(state: &GatewayState, frame: &Frame) -> usize {
    let seq = state.next_seq();
    let json = match frame.to_text() {
        Ok(json) => json,
        Err(e) => {
            warn!(event = %frame.event, error = %e, "failed to serialize broadcast");
            return 0;
        },
    };

    let inner = state.inner.read().await;
    let mut delivered = 0;
    for client in inner.clients.values() {
        if client.send(&json) {
            delivered += 1;
        } else {
            warn!(conn_id = %client.conn_id, event = %frame.event, seq, "client buffer full, broadcast dropped");
        }
    }
    debug!(event = %frame.event, seq, delivered, "broadcast");
    delivered
}

pub async fn broadcast(state: &GatewayState, event: Broadcast) -> usize {
    match event.into_frame() {
        Ok(frame) => broadcast_frame(state, &frame).await,
        Err(e) => {
            warn!(error = %e, "failed to encode broadcast");
            0
        },
    }
}

/// Send one frame to a single client.
pub async fn send_to(state: &GatewayState, conn_id: &str, frame: &Frame) -> bool {
    let Ok(json) = frame.to_text() else {
        return false;
    };
    let inner = state.inner.read().await;
    inner
        .clients
        .get(conn_id)
        .is_some_and(|client| client.send(&json))
}

/// Deliver the reply to a request, waiting for queue space.
///
/// Unlike pushes, replies are never dropped for a slow consumer: the
/// client correlates on them. Gives up after [`REPLY_TIMEOUT`] or once
/// the client is gone.
pub async fn send_reply(state: &GatewayState, conn_id: &str, frame: &Frame) -> bool {
    let Ok(json) = frame.to_text() else {
        return false;
    };
    let sender = {
        let inner = state.inner.read().await;
        match inner.clients.get(conn_id) {
            Some(client) => client.sender.clone(),
            None => return false,
        }
    };
    matches!(time::timeout(REPLY_TIMEOUT, sender.send(json)).await, Ok(Ok(())))
}

/// Drain the bus into the connected clients until the bus closes.
pub fn spawn_fanout(state: Arc<GatewayState>) -> JoinHandle<()> {
    let mut rx = state.bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    broadcast(&state, event).await;
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "broadcast fan-out lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::{
            services::GatewayServices,
            state::{ConnectedClient, GatewayState},
        },
        llamadash_config::ServerConfig,
        llamadash_protocol::{RouterState, RouterStatus, events},
        tokio::sync::mpsc,
    };

    async fn state_with_clients(n: usize) -> (Arc<GatewayState>, Vec<mpsc::Receiver<String>>) {
        let bus = EventBus::new();
        let state = GatewayState::new(
            ServerConfig::default(),
            GatewayServices::local(&bus, 10),
            bus,
        );
        let mut receivers = Vec::new();
        for i in 0..n {
            let (tx, rx) = mpsc::channel(8);
            state
                .register_client(ConnectedClient::new(format!("conn-{i}"), tx, None))
                .await;
            receivers.push(rx);
        }
        (state, receivers)
    }

    #[tokio::test]
    async fn reaches_every_client() {
        let (state, mut receivers) = state_with_clients(2).await;
        let status = RouterStatus {
            status: RouterState::Running,
            ..RouterStatus::default()
        };
        assert_eq!(broadcast(&state, Broadcast::RouterStatusChanged(status)).await, 2);

        for rx in &mut receivers {
            let frame = Frame::from_text(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame.event, events::LLAMA_STATUS);
            assert_eq!(frame.data["status"], "running");
        }
    }

    #[tokio::test]
    async fn fanout_delivers_published_events() {
        let (state, mut receivers) = state_with_clients(1).await;
        let fanout = spawn_fanout(Arc::clone(&state));
        state.bus.publish(Broadcast::RouterStopped {});

        let frame = Frame::from_text(&receivers[0].recv().await.unwrap()).unwrap();
        assert_eq!(frame.event, events::MODELS_ROUTER_STOPPED);
        fanout.abort();
    }

    #[tokio::test]
    async fn send_to_targets_one_client() {
        let (state, mut receivers) = state_with_clients(2).await;
        let frame = Frame::new(events::CONNECTION_ESTABLISHED, serde_json::json!({}));
        assert!(send_to(&state, "conn-1", &frame).await);
        assert!(!send_to(&state, "conn-9", &frame).await);
        assert!(receivers[0].try_recv().is_err());
        assert!(receivers[1].try_recv().is_ok());
    }

    #[tokio::test]
    async fn reply_waits_for_room_in_full_queue() {
        let (state, _) = state_with_clients(0).await;
        let (tx, mut rx) = mpsc::channel(1);
        state
            .register_client(ConnectedClient::new("slow", tx, None))
            .await;
        let filler = Frame::new(events::LOGS_ENTRY, serde_json::json!({"message": "filler"}));
        assert!(send_to(&state, "slow", &filler).await);
        assert!(!send_to(&state, "slow", &filler).await);

        let request = Frame::new(events::MODELS_LIST, serde_json::json!({"requestId": 1}));
        let reply = crate::methods::MethodRegistry::new()
            .dispatch(Arc::clone(&state), "slow", request)
            .await;
        let sending = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { send_reply(&state, "slow", &reply).await })
        };

        let first = Frame::from_text(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.event, events::LOGS_ENTRY);
        let second = Frame::from_text(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second.event, "models:list:result");
        assert_eq!(second.data["requestId"], 1);
        assert!(sending.await.unwrap());
    }

    #[tokio::test]
    async fn reply_to_departed_client_fails() {
        let (state, receivers) = state_with_clients(1).await;
        drop(receivers);
        let frame = Frame::new("models:list:result", serde_json::json!({"requestId": 1}));
        assert!(!send_reply(&state, "conn-0", &frame).await);
        assert!(!send_reply(&state, "conn-7", &frame).await);
    }
}
