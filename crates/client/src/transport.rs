//! A single logical connection to the gateway.
//!
//! [`Transport`] owns at most one [`Session`] at a time, forwards every
//! inbound frame to its listeners, and reopens the session after an
//! unexpected close. The wire itself sits behind [`Connector`].

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    llamadash_config::ReconnectConfig,
    llamadash_protocol::{Frame, events},
    serde_json::{Value, json},
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Result,
    listeners::{ListenerId, ListenerRegistry},
};

// ── Disconnect reasons ───────────────────────────────────────────────────────

/// `disconnect()` was called locally.
pub const CLIENT_DISCONNECT: &str = "io client disconnect";
/// The server closed the socket.
pub const SERVER_DISCONNECT: &str = "io server disconnect";
/// The socket ended without a close frame.
pub const TRANSPORT_CLOSE: &str = "transport close";
pub const TRANSPORT_ERROR: &str = "transport error";

// ── Connector ────────────────────────────────────────────────────────────────

/// What an open session reports back to the transport.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(Frame),
    Closed(String),
}

/// An open connection. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct Session {
    /// Server-assigned connection id.
    pub id: String,
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens sessions for a [`Transport`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Session>;
}

// ── Transport ────────────────────────────────────────────────────────────────

struct Run {
    epoch: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Link {
    /// The background task driving the connection, if one is active.
    run: Option<Run>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

enum Step {
    /// The session opened and later closed.
    Closed,
    /// The open itself failed.
    Failed,
    /// Stopped by `disconnect()`, or superseded by a newer run.
    Cancelled,
}

pub struct Transport {
    connector: Arc<dyn Connector>,
    policy: ReconnectConfig,
    listeners: ListenerRegistry,
    /// Connection id, `Some` exactly while connected.
    conn: watch::Sender<Option<String>>,
    link: Mutex<Link>,
    epochs: AtomicU64,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectConfig) -> Arc<Self> {
        let (conn, _) = watch::channel(None);
        Arc::new(Self {
            connector,
            policy,
            listeners: ListenerRegistry::new(),
            conn,
            link: Mutex::new(Link::default()),
            epochs: AtomicU64::new(0),
        })
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start connecting. No-op while a connection or a retry loop is active.
    pub fn connect(self: &Arc<Self>) -> &Self {
        let mut link = self.lock_link();
        if link.run.is_some() {
            return self;
        }
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        link.run = Some(Run {
            epoch,
            cancel: cancel.clone(),
        });
        drop(link);

        debug!(epoch, "connecting");
        tokio::spawn(Self::run(Arc::downgrade(self), epoch, cancel));
        self
    }

    /// Tear down the connection and stop retrying. Safe to call repeatedly.
    pub fn disconnect(&self) -> &Self {
        let was_connected = {
            let mut link = self.lock_link();
            if let Some(run) = link.run.take() {
                run.cancel.cancel();
            }
            link.outbound = None;
            self.conn.send_replace(None).is_some()
        };
        if was_connected {
            info!(reason = CLIENT_DISCONNECT, "disconnected");
            self.listeners
                .dispatch(events::DISCONNECT, &json!({ "reason": CLIENT_DISCONNECT }));
        }
        self
    }

    pub fn is_connected(&self) -> bool {
        self.conn.borrow().is_some()
    }

    /// Whether a connection or retry loop is running.
    pub fn is_active(&self) -> bool {
        self.lock_link().run.is_some()
    }

    pub fn id(&self) -> Option<String> {
        self.conn.borrow().clone()
    }

    /// Watch the connection id; `None` while disconnected.
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.conn.subscribe()
    }

    /// Resolve once connected, or `false` after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.conn.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        )
    }

    /// Send a frame. Silently dropped while disconnected.
    pub fn emit(&self, event: &str, data: Value) -> &Self {
        self.send(event, data);
        self
    }

    /// Like [`Self::emit`], reporting whether the frame was queued.
    pub fn send(&self, event: &str, data: Value) -> bool {
        let link = self.lock_link();
        match &link.outbound {
            Some(tx) => tx.send(Frame::new(event, data)).is_ok(),
            None => {
                debug!(event, "not connected, dropping emit");
                false
            },
        }
    }

    // ── Listeners ────────────────────────────────────────────────────────────

    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.listeners.on(event, handler)
    }

    pub fn once(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.once(event, handler)
    }

    /// Remove one listener, or all listeners of `event` when `id` is `None`.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        self.listeners.off(event, id)
    }

    /// Observe every frame received from the server.
    pub fn on_any(&self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) -> ListenerId {
        self.listeners.on_any(handler)
    }

    pub fn off_any(&self, id: ListenerId) -> bool {
        self.listeners.off_any(id)
    }

    // ── Connection task ──────────────────────────────────────────────────────

    async fn run(weak: Weak<Self>, epoch: u64, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            match Self::connect_once(&weak, epoch, &cancel).await {
                Step::Cancelled => return,
                Step::Closed => attempt = 0,
                Step::Failed => {},
            }

            attempt += 1;
            let Some(this) = weak.upgrade() else { return };
            if attempt > this.policy.attempts {
                info!(attempts = this.policy.attempts, "giving up reconnecting");
                if this.finish(epoch) {
                    this.listeners.dispatch(
                        events::RECONNECT_FAILED,
                        &json!({ "attempts": this.policy.attempts }),
                    );
                }
                return;
            }
            let delay = this.policy.delay_for(attempt);
            drop(this);

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {},
            }
            let Some(this) = weak.upgrade() else { return };
            debug!(attempt, ?delay, "reconnecting");
            this.listeners
                .dispatch(events::RECONNECT_ATTEMPT, &json!({ "attempt": attempt }));
        }
    }

    async fn connect_once(weak: &Weak<Self>, epoch: u64, cancel: &CancellationToken) -> Step {
        let Some(this) = weak.upgrade() else {
            return Step::Cancelled;
        };
        let opened = tokio::select! {
            () = cancel.cancelled() => return Step::Cancelled,
            opened = this.connector.open() => opened,
        };
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "connect failed");
                this.listeners
                    .dispatch(events::CONNECT_ERROR, &json!({ "message": e.to_string() }));
                return Step::Failed;
            },
        };
        let Some(mut inbound) = this.opened(epoch, session) else {
            return Step::Cancelled;
        };
        drop(this);

        let reason = loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return Step::Cancelled,
                event = inbound.recv() => event,
            };
            match event {
                Some(LinkEvent::Frame(frame)) => match weak.upgrade() {
                    Some(this) => this.deliver(&frame),
                    None => return Step::Cancelled,
                },
                Some(LinkEvent::Closed(reason)) => break reason,
                None => break TRANSPORT_CLOSE.to_string(),
            }
        };

        match weak.upgrade() {
            Some(this) if this.closed(epoch, &reason) => Step::Closed,
            _ => Step::Cancelled,
        }
    }

    /// Install a freshly opened session. `None` if this run was superseded.
    fn opened(&self, epoch: u64, session: Session) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        let Session {
            id,
            outbound,
            inbound,
        } = session;
        {
            let mut link = self.lock_link();
            if link.run.as_ref().map(|r| r.epoch) != Some(epoch) {
                return None;
            }
            link.outbound = Some(outbound);
            self.conn.send_replace(Some(id.clone()));
        }
        info!(conn_id = %id, "connected");
        self.listeners.dispatch(events::CONNECT, &json!({ "id": id }));
        self.send(events::CONNECTION_ACK, json!({}));
        Some(inbound)
    }

    /// Clear a closed session. `false` if this run was superseded.
    fn closed(&self, epoch: u64, reason: &str) -> bool {
        {
            let mut link = self.lock_link();
            if link.run.as_ref().map(|r| r.epoch) != Some(epoch) {
                return false;
            }
            link.outbound = None;
            self.conn.send_replace(None);
        }
        info!(reason, "disconnected");
        self.listeners
            .dispatch(events::DISCONNECT, &json!({ "reason": reason }));
        true
    }

    /// Forget a run that gave up, so a later `connect()` starts over.
    fn finish(&self, epoch: u64) -> bool {
        let mut link = self.lock_link();
        if link.run.as_ref().map(|r| r.epoch) != Some(epoch) {
            return false;
        }
        link.run = None;
        true
    }

    fn deliver(&self, frame: &Frame) {
        if events::is_reserved(&frame.event) {
            warn!(event = %frame.event, "dropping reserved event from server");
            return;
        }
        debug!(event = %frame.event, "frame received");
        self.listeners.dispatch_any(&frame.event, &frame.data);
        self.listeners.dispatch(&frame.event, &frame.data);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = link.run.take() {
            run.cancel.cancel();
        }
    }
}

// ── Listener guard ───────────────────────────────────────────────────────────

/// Listeners registered on behalf of one owner, removed when it is dropped.
pub struct ListenerGuard {
    transport: Weak<Transport>,
    events: Vec<(String, ListenerId)>,
    any: Vec<ListenerId>,
}

impl ListenerGuard {
    pub fn new(transport: &Arc<Transport>) -> Self {
        Self {
            transport: Arc::downgrade(transport),
            events: Vec::new(),
            any: Vec::new(),
        }
    }

    pub fn on(&mut self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) {
        if let Some(transport) = self.transport.upgrade() {
            let id = transport.on(event, handler);
            self.events.push((event.to_string(), id));
        }
    }

    pub fn on_any(&mut self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) {
        if let Some(transport) = self.transport.upgrade() {
            self.any.push(transport.on_any(handler));
        }
    }

    pub fn len(&self) -> usize {
        self.events.len() + self.any.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        for (event, id) in self.events.drain(..) {
            transport.off(&event, Some(id));
        }
        for id in self.any.drain(..) {
            transport.off_any(id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::test_support::{Loopback, record},
    };

    fn policy(attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            attempts,
            delay_ms: 100,
            delay_max_ms: 500,
        }
    }

    #[tokio::test]
    async fn connect_sets_id_and_acks() {
        let (connector, mut sessions) = Loopback::new();
        let transport = Transport::new(connector, policy(0));
        let mut seen = record(&transport, &[events::CONNECT]);
        assert!(!transport.is_connected());
        assert_eq!(transport.id(), None);

        transport.connect();
        let mut server = sessions.recv().await.unwrap();
        let (event, data) = seen.recv().await.unwrap();
        assert_eq!(event, "connect");
        assert_eq!(data["id"], server.conn_id.as_str());
        assert!(transport.is_connected());
        assert_eq!(transport.id().as_deref(), Some(server.conn_id.as_str()));

        let ack = server.from_client.recv().await.unwrap();
        assert_eq!(ack.event, events::CONNECTION_ACK);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (connector, mut sessions) = Loopback::new();
        let transport = Transport::new(connector, policy(0));
        transport.connect().on("noop", |_| {});
        transport.connect();
        assert!(transport.wait_connected(Duration::from_secs(1)).await);
        sessions.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert!(sessions.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_while_disconnected_is_silent() {
        let (connector, _sessions) = Loopback::new();
        let transport = Transport::new(connector, policy(0));
        assert!(!transport.send("models:list", json!({})));
        transport.emit("models:list", json!({})).disconnect().disconnect();
    }

    #[tokio::test]
    async fn frames_are_forwarded_but_reserved_names_are_not() {
        let (connector, mut sessions) = Loopback::new();
        let transport = Transport::new(connector, policy(0));
        let mut seen = record(&transport, &[events::DISCONNECT, events::LLAMA_STATUS]);
        transport.connect();
        let server = sessions.recv().await.unwrap();

        server.push(events::DISCONNECT, json!({ "reason": "spoofed" }));
        server.push(events::LLAMA_STATUS, json!({ "status": "running" }));

        let (event, data) = seen.recv().await.unwrap();
        assert_eq!(event, "llama:status");
        assert_eq!(data["status"], "running");
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn client_disconnect_is_synchronous_and_final() {
        let (connector, mut sessions) = Loopback::new();
        let transport = Transport::new(connector, policy(3));
        let mut seen = record(&transport, &[events::DISCONNECT, events::RECONNECT_ATTEMPT]);
        transport.connect();
        sessions.recv().await.unwrap();
        assert!(transport.wait_connected(Duration::from_secs(1)).await);

        transport.disconnect();
        let (event, data) = seen.try_recv().unwrap();
        assert_eq!(event, "disconnect");
        assert_eq!(data["reason"], CLIENT_DISCONNECT);
        assert!(!transport.is_connected());
        assert!(!transport.is_active());

        transport.disconnect();
        tokio::task::yield_now().await;
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_reconnects_with_new_id() {
        let (connector, mut sessions) = Loopback::new();
        let transport = Transport::new(connector, policy(3));
        let mut seen = record(&transport, &[
            events::DISCONNECT,
            events::RECONNECT_ATTEMPT,
            events::CONNECT,
        ]);
        transport.connect();
        let first = sessions.recv().await.unwrap();
        assert_eq!(seen.recv().await.unwrap().0, "connect");

        first.close(SERVER_DISCONNECT);
        let (event, data) = seen.recv().await.unwrap();
        assert_eq!(event, "disconnect");
        assert_eq!(data["reason"], SERVER_DISCONNECT);
        assert_eq!(seen.recv().await.unwrap().0, "reconnect_attempt");

        let second = sessions.recv().await.unwrap();
        assert_eq!(seen.recv().await.unwrap().0, "connect");
        assert_ne!(first.conn_id, second.conn_id);
        assert_eq!(transport.id().as_deref(), Some(second.conn_id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_configured_attempts() {
        let (connector, _sessions) = Loopback::new();
        connector.fail_next(10);
        let transport = Transport::new(connector, policy(2));
        let mut seen = record(&transport, &[
            events::CONNECT_ERROR,
            events::RECONNECT_ATTEMPT,
            events::RECONNECT_FAILED,
        ]);
        transport.connect();

        let names: Vec<String> = {
            let mut names = Vec::new();
            while let Some((event, _)) = seen.recv().await {
                let done = event == events::RECONNECT_FAILED;
                names.push(event);
                if done {
                    break;
                }
            }
            names
        };
        assert_eq!(names, vec![
            "connect_error",
            "reconnect_attempt",
            "connect_error",
            "reconnect_attempt",
            "connect_error",
            "reconnect_failed",
        ]);
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn listener_guard_removes_on_drop() {
        let (connector, _sessions) = Loopback::new();
        let transport = Transport::new(connector, policy(0));
        {
            let mut guard = ListenerGuard::new(&transport);
            guard.on(events::LOGS_ENTRY, |_| {});
            guard.on_any(|_, _| {});
            assert_eq!(guard.len(), 2);
            assert_eq!(transport.listeners.listener_count(events::LOGS_ENTRY), 1);
        }
        assert_eq!(transport.listeners.listener_count(events::LOGS_ENTRY), 0);
    }
}
