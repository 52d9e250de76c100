use std::time::Duration;

use llamadash_protocol::ProtocolError;

/// Every failure a caller of the client can observe.
///
/// A result frame nobody is waiting for is not an error value: it is logged
/// and dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection dropped while the request was pending.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("{event} timed out after {after:?}")]
    Timeout { event: String, after: Duration },

    /// The server answered with `success: false`. Displays the server's
    /// message verbatim.
    #[error("{message}")]
    Remote { event: String, message: String },

    /// A local lookup failed before any request was sent.
    #[error("{family} not found: {id}")]
    NotFound { family: &'static str, id: String },

    #[error("not connected, cannot send {event}")]
    NotConnected { event: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl Error {
    pub fn not_found(family: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            family,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. }
                | Self::Timeout { .. }
                | Self::NotConnected { .. }
                | Self::Connect(_)
                | Self::WebSocket(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
