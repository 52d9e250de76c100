#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<String>("not-json").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn invalid_envelope_message() {
        let err = ProtocolError::InvalidEnvelope("data present on failure".into());
        assert_eq!(err.to_string(), "invalid envelope: data present on failure");
    }
}
