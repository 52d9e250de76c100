//! In-memory gateway stand-in for unit tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    llamadash_config::ReconnectConfig,
    llamadash_protocol::{Envelope, Frame, events, extract_request_id, result_event},
    serde_json::Value,
    tokio::{sync::mpsc, task::JoinHandle},
};

use crate::{
    Error, Result,
    rpc::Correlator,
    transport::{Connector, LinkEvent, Session, Transport},
};

/// Connector whose sessions are handed to the test as [`ServerEnd`]s.
pub struct Loopback {
    sessions: mpsc::UnboundedSender<ServerEnd>,
    failures: AtomicU32,
}

impl Loopback {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions,
                failures: AtomicU32::new(0),
            }),
            rx,
        )
    }

    /// Make the next `n` opens fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for Loopback {
    async fn open(&self) -> Result<Session> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Connect("connection refused".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.sessions
            .send(ServerEnd {
                conn_id: id.clone(),
                from_client,
                tx: Push(to_client),
            })
            .map_err(|_| Error::Connect("loopback server gone".into()))?;
        Ok(Session {
            id,
            outbound,
            inbound,
        })
    }
}

/// Sends frames to the client side of a loopback session.
#[derive(Clone)]
pub struct Push(mpsc::UnboundedSender<LinkEvent>);

impl Push {
    pub fn push(&self, event: &str, data: Value) {
        let _ = self.0.send(LinkEvent::Frame(Frame::new(event, data)));
    }

    pub fn reply(&self, request: &Frame, outcome: std::result::Result<Value, String>) {
        let id = extract_request_id(&request.data).unwrap();
        let envelope = match outcome {
            Ok(data) => Envelope::ok(id, data),
            Err(message) => Envelope::err(id, message),
        };
        self.push(&result_event(&request.event), envelope.to_value().unwrap());
    }

    pub fn close(&self, reason: &str) {
        let _ = self.0.send(LinkEvent::Closed(reason.to_string()));
    }
}

/// The server's view of one loopback session.
pub struct ServerEnd {
    pub conn_id: String,
    pub from_client: mpsc::UnboundedReceiver<Frame>,
    tx: Push,
}

impl ServerEnd {
    pub fn pusher(&self) -> Push {
        self.tx.clone()
    }

    pub fn push(&self, event: &str, data: Value) {
        self.tx.push(event, data);
    }

    pub fn close(&self, reason: &str) {
        self.tx.close(reason);
    }

    /// Next request from the client, skipping the handshake ack.
    pub async fn recv(&mut self) -> Frame {
        loop {
            let frame = self.from_client.recv().await.unwrap();
            if frame.event != events::CONNECTION_ACK {
                return frame;
            }
        }
    }

    pub fn reply_ok(&self, request: &Frame, data: Value) {
        self.tx.reply(request, Ok(data));
    }

    pub fn reply_err(&self, request: &Frame, message: &str) {
        self.tx.reply(request, Err(message.to_string()));
    }

    /// Answer every request with `handler` until the client goes away.
    /// `None` leaves the request unanswered.
    pub fn serve<F>(mut self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&Frame, &Push) -> Option<std::result::Result<Value, String>> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(frame) = self.from_client.recv().await {
                if frame.event == events::CONNECTION_ACK {
                    continue;
                }
                if let Some(outcome) = handler(&frame, &self.tx) {
                    self.tx.reply(&frame, outcome);
                }
            }
        })
    }
}

/// Record every occurrence of `names` on the transport.
pub fn record(transport: &Transport, names: &[&str]) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for name in names {
        let tx = tx.clone();
        let event = name.to_string();
        transport.on(name, move |data| {
            let _ = tx.send((event.clone(), data.clone()));
        });
    }
    rx
}

/// A correlator over a connected loopback session.
pub async fn connected() -> (Arc<Correlator>, ServerEnd) {
    let (connector, mut sessions) = Loopback::new();
    let transport = Transport::new(connector, ReconnectConfig::default());
    let rpc = Correlator::new(transport, Duration::from_secs(5), Duration::from_secs(1));
    rpc.transport().connect();
    let server = sessions.recv().await.unwrap();
    assert!(rpc.transport().wait_connected(Duration::from_secs(1)).await);
    (rpc, server)
}

/// Yield until `cond` holds, failing the test after a second.
pub async fn until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}
