//! Request/response correlation over the transport.
//!
//! Every call gets a fresh `requestId` and a pending entry keyed by it. One
//! catch-all observer routes each `"<event>:result"` frame to the entry with
//! the matching id and event, so concurrent calls to the same event never
//! resolve each other. An entry is removed before it is settled, so the first
//! settlement wins and late duplicates find nothing.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    llamadash_protocol::{
        Envelope, Method, RequestId, events, extract_request_id, request_event, with_request_id,
    },
    serde_json::Value,
    tokio::sync::oneshot,
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    transport::{ListenerGuard, Transport},
};

/// A call waiting for its result frame.
struct PendingRequest {
    event: String,
    sender: oneshot::Sender<Result<Value>>,
    created_at: Instant,
}

type PendingTable = Mutex<HashMap<String, PendingRequest>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry if the call is abandoned before settling.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).remove(&self.key);
    }
}

pub struct Correlator {
    transport: Arc<Transport>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    request_timeout: Duration,
    connect_wait: Duration,
    _listeners: ListenerGuard,
}

impl Correlator {
    pub fn new(
        transport: Arc<Transport>,
        request_timeout: Duration,
        connect_wait: Duration,
    ) -> Arc<Self> {
        let pending: Arc<PendingTable> = Arc::default();
        let mut listeners = ListenerGuard::new(&transport);

        let table = Arc::downgrade(&pending);
        listeners.on_any(move |event, data| route_result(&table, event, data));

        let table = Arc::downgrade(&pending);
        listeners.on(events::DISCONNECT, move |data| {
            let reason = data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("disconnected");
            reject_all(&table, reason);
        });

        Arc::new(Self {
            transport,
            pending,
            next_id: AtomicU64::new(0),
            request_timeout,
            connect_wait,
            _listeners: listeners,
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Calls currently waiting for a result.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Age of the oldest pending call.
    pub fn oldest_pending(&self) -> Option<Duration> {
        lock(&self.pending)
            .values()
            .map(|p| p.created_at.elapsed())
            .max()
    }

    /// Send `event` with `payload` and wait for its envelope.
    ///
    /// Resolves with the envelope's `data`, or fails with the server's
    /// message, a lost connection, or a timeout.
    pub async fn request(&self, event: &str, payload: Value) -> Result<Value> {
        if !self.transport.is_connected() && !self.transport.wait_connected(self.connect_wait).await
        {
            return Err(Error::NotConnected {
                event: event.to_string(),
            });
        }

        let request_id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let payload = with_request_id(payload, &request_id)?;
        let key = request_id.key();
        let (tx, rx) = oneshot::channel();

        // Register before sending so a fast reply always finds its entry.
        lock(&self.pending).insert(key.clone(), PendingRequest {
            event: event.to_string(),
            sender: tx,
            created_at: Instant::now(),
        });
        let _guard = PendingGuard {
            table: &self.pending,
            key,
        };

        if !self.transport.send(event, payload) {
            return Err(Error::NotConnected {
                event: event.to_string(),
            });
        }
        debug!(event, request_id = %request_id, "request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost {
                reason: "request abandoned".into(),
            }),
            Err(_) => {
                warn!(event, request_id = %request_id, "request timed out");
                Err(Error::Timeout {
                    event: event.to_string(),
                    after: self.request_timeout,
                })
            },
        }
    }

    /// Typed form of [`Self::request`].
    pub async fn call<M: Method>(&self, params: &M::Params) -> Result<M::Output> {
        let payload = serde_json::to_value(params)?;
        let data = self.request(M::EVENT, payload).await?;
        Ok(serde_json::from_value(data)?)
    }
}

fn route_result(table: &Weak<PendingTable>, event: &str, data: &Value) {
    let Some(base) = request_event(event) else {
        return;
    };
    let Some(table) = table.upgrade() else {
        return;
    };
    let Some(request_id) = extract_request_id(data) else {
        warn!(event, "result without requestId dropped");
        return;
    };
    let key = request_id.key();
    let entry = {
        let mut pending = lock(&table);
        match pending.get(&key).map(|p| p.event == base) {
            None => {
                warn!(event, request_id = %key, "result for unknown request dropped");
                return;
            },
            Some(false) => {
                warn!(event, request_id = %key, "result event does not match pending request");
                return;
            },
            Some(true) => pending.remove(&key),
        }
    };
    let Some(entry) = entry else {
        return;
    };

    let outcome = match Envelope::from_value(data.clone()) {
        Ok(envelope) => envelope.into_result().map_err(|e| Error::Remote {
            event: base.to_string(),
            message: e.message,
        }),
        Err(e) => Err(Error::Protocol(e)),
    };
    debug!(event, request_id = %key, ok = outcome.is_ok(), "request settled");
    let _ = entry.sender.send(outcome);
}

fn reject_all(table: &Weak<PendingTable>, reason: &str) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let drained: Vec<PendingRequest> = lock(&table).drain().map(|(_, p)| p).collect();
    if !drained.is_empty() {
        debug!(count = drained.len(), reason, "rejecting pending requests");
    }
    for entry in drained {
        let _ = entry.sender.send(Err(Error::ConnectionLost {
            reason: reason.to_string(),
        }));
    }
}
