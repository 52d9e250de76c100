//! Server pushes that are not tied to any request.

use serde::{Deserialize, Serialize};

use crate::{
    Frame, ProtocolError, Result,
    entity::{LogEntry, Model, ModelStatus, RouterStatus},
    events,
    methods::ScanSummary,
};

/// Every broadcast the gateway emits, keyed by event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum Broadcast {
    /// Hello sent to a freshly accepted socket; carries its connection id.
    #[serde(rename = "connection:open")]
    ConnectionOpen { client_id: String },
    #[serde(rename = "connection:established")]
    ConnectionEstablished { client_id: String, timestamp: u64 },
    #[serde(rename = "models:created")]
    ModelCreated { model: Model },
    #[serde(rename = "models:updated")]
    ModelUpdated { model: Model },
    #[serde(rename = "models:deleted")]
    ModelDeleted { model_id: String },
    #[serde(rename = "models:status")]
    ModelStatusChanged {
        model_name: String,
        status: ModelStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The router exited; every model it held is now unloaded.
    #[serde(rename = "models:router-stopped")]
    RouterStopped {},
    #[serde(rename = "models:scanned")]
    ModelsScanned(ScanSummary),
    #[serde(rename = "logs:entry")]
    LogAppended { entry: LogEntry },
    #[serde(rename = "llama:status")]
    RouterStatusChanged(RouterStatus),
}

const KNOWN: &[&str] = &[
    events::CONNECTION_OPEN,
    events::CONNECTION_ESTABLISHED,
    events::MODELS_CREATED,
    events::MODELS_UPDATED,
    events::MODELS_DELETED,
    events::MODELS_STATUS,
    events::MODELS_ROUTER_STOPPED,
    events::MODELS_SCANNED,
    events::LOGS_ENTRY,
    events::LLAMA_STATUS,
];

impl Broadcast {
    /// Decode a pushed event. `None` when the event is not a broadcast.
    pub fn parse(event: &str, data: &serde_json::Value) -> Option<Result<Self>> {
        if !KNOWN.contains(&event) {
            return None;
        }
        let data = if data.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            data.clone()
        };
        let tagged = serde_json::json!({ "event": event, "data": data });
        Some(serde_json::from_value(tagged).map_err(ProtocolError::from))
    }

    pub fn from_frame(frame: &Frame) -> Option<Result<Self>> {
        Self::parse(&frame.event, &frame.data)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionOpen { .. } => events::CONNECTION_OPEN,
            Self::ConnectionEstablished { .. } => events::CONNECTION_ESTABLISHED,
            Self::ModelCreated { .. } => events::MODELS_CREATED,
            Self::ModelUpdated { .. } => events::MODELS_UPDATED,
            Self::ModelDeleted { .. } => events::MODELS_DELETED,
            Self::ModelStatusChanged { .. } => events::MODELS_STATUS,
            Self::RouterStopped {} => events::MODELS_ROUTER_STOPPED,
            Self::ModelsScanned(_) => events::MODELS_SCANNED,
            Self::LogAppended { .. } => events::LOGS_ENTRY,
            Self::RouterStatusChanged(_) => events::LLAMA_STATUS,
        }
    }

    pub fn into_frame(self) -> Result<Frame> {
        let event = self.event_name();
        let mut value = serde_json::to_value(self)?;
        let data = value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or_default();
        Ok(Frame::new(event, data))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::entity::{LogLevel, RouterState},
        serde_json::json,
    };

    #[test]
    fn parses_status_by_name() {
        let parsed = Broadcast::parse(
            "models:status",
            &json!({"modelName": "llama", "status": "loaded"}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(parsed, Broadcast::ModelStatusChanged {
            model_name: "llama".into(),
            status: ModelStatus::Loaded,
            error: None,
        });
    }

    #[test]
    fn router_stopped_accepts_null_data() {
        let parsed = Broadcast::parse("models:router-stopped", &serde_json::Value::Null)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, Broadcast::RouterStopped {});
    }

    #[test]
    fn unknown_event_is_none() {
        assert!(Broadcast::parse("metrics:update", &json!({})).is_none());
        assert!(Broadcast::parse("models:list:result", &json!({})).is_none());
    }

    #[test]
    fn malformed_known_event_is_error() {
        let parsed = Broadcast::parse("models:deleted", &json!({"id": 3})).unwrap();
        assert!(parsed.is_err());
    }

    #[test]
    fn llama_status_is_the_status_object() {
        let parsed = Broadcast::parse("llama:status", &json!({"status": "running", "port": 8080}))
            .unwrap()
            .unwrap();
        let Broadcast::RouterStatusChanged(status) = parsed else {
            panic!("expected router status");
        };
        assert_eq!(status.status, RouterState::Running);
        assert_eq!(status.port, Some(8080));
    }

    #[test]
    fn into_frame_splits_event_and_data() {
        let frame = Broadcast::LogAppended {
            entry: LogEntry {
                id: 4,
                level: LogLevel::Warn,
                message: "slow".into(),
                timestamp: 10,
            },
        }
        .into_frame()
        .unwrap();
        assert_eq!(frame.event, "logs:entry");
        assert_eq!(frame.data, json!({"entry": {
            "id": 4, "level": "warn", "message": "slow", "timestamp": 10
        }}));

        let frame = Broadcast::RouterStopped {}.into_frame().unwrap();
        assert_eq!(frame.data, json!({}));
    }

    #[test]
    fn frame_round_trips_through_parse() {
        let original = Broadcast::ModelDeleted {
            model_id: "m1".into(),
        };
        let frame = original.clone().into_frame().unwrap();
        assert_eq!(frame.data, json!({"modelId": "m1"}));
        assert_eq!(Broadcast::from_frame(&frame).unwrap().unwrap(), original);
    }
}
