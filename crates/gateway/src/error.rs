/// Why a request handler failed. The `Display` text becomes the error
/// envelope's message.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error("{0}")]
    NotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A collaborator the request needs is not ready, e.g. the router is
    /// not running.
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl MethodError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{what} not found: {id}"))
    }

    /// Label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidParams(_) => "invalid_params",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

pub type MethodResult<T> = Result<T, MethodError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_the_display_text() {
        assert_eq!(
            MethodError::not_found("Preset", "fast").to_string(),
            "Preset not found: fast"
        );
        assert_eq!(
            MethodError::Unavailable("llama-server not running".into()).to_string(),
            "llama-server not running"
        );
        assert_eq!(MethodError::InvalidParams("x".into()).kind(), "invalid_params");
    }
}
