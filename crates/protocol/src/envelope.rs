//! The uniform reply wrapper.
//!
//! Wire shape:
//!
//! ```json
//! { "success": true,  "data": {...},                  "requestId": 1, "timestamp": 1700000000000 }
//! { "success": false, "error": { "message": "..." }, "requestId": 1, "timestamp": 1700000000000 }
//! ```
//!
//! `data` is present iff `success`; `error` is present iff not. The invariant
//! is enforced when decoding, so an [`Envelope`] value can only hold one side.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, now_ms};

/// Message used when a failure envelope omits its `error` object.
pub const FALLBACK_ERROR_MESSAGE: &str = "Request failed";

// ── Request id ───────────────────────────────────────────────────────────────

/// Correlation id of a request. Clients send counters; servers that have to
/// fabricate one use a millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl RequestId {
    /// Id for a request that arrived without one.
    pub fn fallback() -> Self {
        Self::Number(now_ms())
    }

    /// Key used in pending tables. `1` and `"1"` correlate to the same call.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A decoded reply to exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    pub request_id: RequestId,
    /// Diagnostics only; never used for ordering.
    pub timestamp: u64,
    pub outcome: Result<serde_json::Value, ErrorBody>,
}

impl Envelope {
    pub fn ok(request_id: RequestId, data: serde_json::Value) -> Self {
        Self {
            request_id,
            timestamp: now_ms(),
            outcome: Ok(data),
        }
    }

    pub fn err(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            timestamp: now_ms(),
            outcome: Err(ErrorBody::new(message)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Decode an envelope from a result frame's payload.
    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn into_result(self) -> Result<serde_json::Value, ErrorBody> {
        self.outcome
    }
}

/// The literal wire layout, before the data/error invariant is checked.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    request_id: RequestId,
    #[serde(default)]
    timestamp: u64,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let outcome = match (raw.success, raw.data, raw.error) {
            (true, _, Some(_)) => {
                return Err(ProtocolError::InvalidEnvelope(
                    "success envelope carries an error".into(),
                ));
            },
            (false, Some(data), _) if !data.is_null() => {
                return Err(ProtocolError::InvalidEnvelope(
                    "failure envelope carries data".into(),
                ));
            },
            (true, data, None) => Ok(data.unwrap_or(serde_json::Value::Null)),
            (false, _, error) => {
                Err(error.unwrap_or_else(|| ErrorBody::new(FALLBACK_ERROR_MESSAGE)))
            },
        };
        Ok(Self {
            request_id: raw.request_id,
            timestamp: raw.timestamp,
            outcome,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        match envelope.outcome {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
                request_id: envelope.request_id,
                timestamp: envelope.timestamp,
            },
            Err(error) => Self {
                success: false,
                data: None,
                error: Some(error),
                request_id: envelope.request_id,
                timestamp: envelope.timestamp,
            },
        }
    }
}
