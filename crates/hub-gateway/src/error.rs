use hub_types::envelope::{DecodeError, ErrorCode};

/// Per-request failures. Each is answered with an `ERROR` envelope and the
/// connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unknown action tag '{0}'")]
    UnknownAction(String),

    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("store failure: {0:#}")]
    Store(anyhow::Error),
}

impl ActionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) | Self::UnknownAction(_) | Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Store(_) => ErrorCode::ServerError,
        }
    }

    /// Text sent to the client. Store details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Socket-level failure. Fatal to the session that hit it, and to no other.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket write timed out")]
    WriteTimeout,

    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_client_messages() {
        assert_eq!(
            ActionError::UnknownAction("X".into()).code(),
            ErrorCode::ProtocolError
        );
        assert_eq!(
            ActionError::Validation("room text must not be empty".into()).code(),
            ErrorCode::ValidationError
        );
        assert_eq!(ActionError::NotFound("gone".into()).code(), ErrorCode::NotFound);

        let store = ActionError::Store(anyhow::anyhow!("disk I/O error"));
        assert_eq!(store.code(), ErrorCode::ServerError);
        assert_eq!(store.client_message(), "internal server error");
        assert!(store.to_string().contains("disk I/O error"));
    }
}
