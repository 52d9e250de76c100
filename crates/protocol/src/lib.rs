//! Dashboard socket protocol definitions.
//!
//! All communication uses JSON text frames over a single WebSocket. Every
//! frame is a named event with a JSON payload:
//!
//! - request: client → gateway, `{ ...params, requestId }` under the method's event name
//! - result: gateway → client, an [`Envelope`] under `"<event>:result"`
//! - broadcast: gateway → all clients, a domain payload under its own event name

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod broadcast;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod methods;

pub use {
    broadcast::Broadcast,
    entity::{
        Entity, LogEntry, LogLevel, Model, ModelPatch, ModelStatus, Preset, PresetPatch,
        RouterState, RouterStatus,
    },
    envelope::{Envelope, ErrorBody, RequestId},
    error::{ProtocolError, Result},
    methods::Method,
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const DEFAULT_WS_PATH: &str = "/llamaproxws";
pub const DEFAULT_PORT: u16 = 8585;
pub const REQUEST_TIMEOUT_MS: u64 = 30_000; // 30s
pub const CONNECT_WAIT_MS: u64 = 5_000; // 5s
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s
pub const LOG_CAPACITY: usize = 100;

/// Suffix appended to a request event to form its result event.
pub const RESULT_SUFFIX: &str = ":result";

// ── Event names ──────────────────────────────────────────────────────────────

pub mod events {
    // Local transport lifecycle. Never forwarded from the wire.
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const RECONNECT_ATTEMPT: &str = "reconnect_attempt";
    pub const RECONNECT_FAILED: &str = "reconnect_failed";

    // Handshake
    pub const CONNECTION_OPEN: &str = "connection:open";
    pub const CONNECTION_ACK: &str = "connection:ack";
    pub const CONNECTION_ESTABLISHED: &str = "connection:established";

    // Models
    pub const MODELS_LIST: &str = "models:list";
    pub const MODELS_GET: &str = "models:get";
    pub const MODELS_CREATE: &str = "models:create";
    pub const MODELS_UPDATE: &str = "models:update";
    pub const MODELS_DELETE: &str = "models:delete";
    pub const MODELS_LOAD: &str = "models:load";
    pub const MODELS_UNLOAD: &str = "models:unload";
    pub const MODELS_SCAN: &str = "models:scan";
    pub const MODELS_CREATED: &str = "models:created";
    pub const MODELS_UPDATED: &str = "models:updated";
    pub const MODELS_DELETED: &str = "models:deleted";
    pub const MODELS_STATUS: &str = "models:status";
    pub const MODELS_SCANNED: &str = "models:scanned";
    pub const MODELS_ROUTER_STOPPED: &str = "models:router-stopped";

    // Logs
    pub const LOGS_GET: &str = "logs:get";
    pub const LOGS_CLEAR: &str = "logs:clear";
    pub const LOGS_ENTRY: &str = "logs:entry";

    // Presets
    pub const PRESETS_LIST: &str = "presets:list";
    pub const PRESETS_READ: &str = "presets:read";
    pub const PRESETS_SAVE: &str = "presets:save";
    pub const PRESETS_CREATE: &str = "presets:create";
    pub const PRESETS_DELETE: &str = "presets:delete";

    // Router
    pub const LLAMA_STATUS: &str = "llama:status";
    pub const LLAMA_START: &str = "llama:start";
    pub const LLAMA_STOP: &str = "llama:stop";
    pub const LLAMA_RESTART: &str = "llama:restart";
    pub const LLAMA_CONFIG: &str = "llama:config";

    /// Names the transport raises locally; a frame from the wire carrying one
    /// of these is dropped instead of forwarded.
    pub const RESERVED: &[&str] = &[
        CONNECT,
        DISCONNECT,
        CONNECT_ERROR,
        RECONNECT_ATTEMPT,
        RECONNECT_FAILED,
    ];

    pub fn is_reserved(event: &str) -> bool {
        RESERVED.contains(&event)
    }
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// One message on the socket: a named event carrying a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parse a text message received from the socket.
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The originating request event if this frame is a result.
    pub fn result_of(&self) -> Option<&str> {
        request_event(&self.event)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// `"models:list"` → `"models:list:result"`.
pub fn result_event(event: &str) -> String {
    format!("{event}{RESULT_SUFFIX}")
}

/// `"models:list:result"` → `Some("models:list")`.
pub fn request_event(result: &str) -> Option<&str> {
    result
        .strip_suffix(RESULT_SUFFIX)
        .filter(|base| !base.is_empty())
}

/// Build the outbound request payload `{ ...payload, requestId }`.
///
/// A `null` payload becomes `{ requestId }`. Anything other than an object or
/// `null` cannot carry the id and is rejected.
pub fn with_request_id(
    payload: serde_json::Value,
    request_id: &RequestId,
) -> Result<serde_json::Value> {
    let mut map = match payload {
        serde_json::Value::Null => serde_json::Map::new(),
        serde_json::Value::Object(map) => map,
        other => {
            return Err(ProtocolError::InvalidPayload(format!(
                "request payload must be an object, got {}",
                json_kind(&other)
            )));
        },
    };
    map.insert("requestId".into(), serde_json::to_value(request_id)?);
    Ok(serde_json::Value::Object(map))
}

/// Read the `requestId` field of an inbound payload, if it carries one.
pub fn extract_request_id(payload: &serde_json::Value) -> Option<RequestId> {
    payload
        .get("requestId")
        .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok())
}

pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn result_event_appends_suffix() {
        assert_eq!(result_event("models:list"), "models:list:result");
        assert_eq!(request_event("models:list:result"), Some("models:list"));
        assert_eq!(request_event("models:list"), None);
        assert_eq!(request_event(":result"), None);
    }

    #[test]
    fn frame_without_data_defaults_to_null() {
        let frame = Frame::from_text(r#"{"event":"models:router-stopped"}"#).unwrap();
        assert_eq!(frame.event, "models:router-stopped");
        assert!(frame.data.is_null());
    }

    #[test]
    fn frame_result_of() {
        let frame = Frame::new("llama:status:result", serde_json::json!({}));
        assert_eq!(frame.result_of(), Some("llama:status"));
        let frame = Frame::new("llama:status", serde_json::json!({}));
        assert_eq!(frame.result_of(), None);
    }

    #[test]
    fn with_request_id_merges_into_object() {
        let payload = with_request_id(serde_json::json!({"foo": 1}), &RequestId::Number(7)).unwrap();
        assert_eq!(payload, serde_json::json!({"foo": 1, "requestId": 7}));
    }

    #[test]
    fn with_request_id_null_payload() {
        let payload = with_request_id(serde_json::Value::Null, &RequestId::from("abc")).unwrap();
        assert_eq!(payload, serde_json::json!({"requestId": "abc"}));
    }

    #[test]
    fn with_request_id_rejects_array() {
        let err = with_request_id(serde_json::json!([1, 2]), &RequestId::Number(1)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn extract_request_id_number_and_string() {
        assert_eq!(
            extract_request_id(&serde_json::json!({"requestId": 3})),
            Some(RequestId::Number(3))
        );
        assert_eq!(
            extract_request_id(&serde_json::json!({"requestId": "req_1"})),
            Some(RequestId::from("req_1"))
        );
        assert_eq!(extract_request_id(&serde_json::json!({})), None);
    }

    #[test]
    fn reserved_events() {
        assert!(events::is_reserved("connect"));
        assert!(events::is_reserved("disconnect"));
        assert!(!events::is_reserved("models:list"));
    }
}
