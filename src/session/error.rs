use thiserror::Error;
use tracing::error;

/// Failures surfaced by the session state machine.
///
/// Validation and lookup failures carry a client-safe message. `Internal`
/// wraps store, hash and crypto failures; it is logged when constructed and
/// its detail never leaves the process.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid refresh token")]
    InvalidRefreshToken,
    #[error("invalid access token")]
    InvalidAccessToken,
    #[error("insufficient role")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl SessionError {
    /// Log a store or crypto failure with its context and wrap it.
    pub(crate) fn internal(context: &'static str, err: anyhow::Error) -> Self {
        error!("{context}: {err:#}");
        Self::Internal(err.context(context))
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_keeps_source_chain() {
        let err = SessionError::internal("failed to revoke", anyhow::anyhow!("connection reset"));
        let SessionError::Internal(inner) = err else {
            panic!("expected internal error");
        };
        let chain = format!("{inner:#}");
        assert!(chain.contains("failed to revoke"));
        assert!(chain.contains("connection reset"));
    }

    #[test]
    fn client_messages_do_not_leak_internal_detail() {
        let err = SessionError::Internal(anyhow::anyhow!("password=hunter2"));
        assert_eq!(err.to_string(), "internal error");
        assert_eq!(SessionError::NotFound("user").to_string(), "user not found");
    }
}
