//! Client-side error taxonomy.

/// Errors surfaced by the client session layer.
///
/// The split between [`ClientError::SessionRevoked`] and
/// [`ClientError::TransientFailure`] drives session handling: the first drops
/// the cached token, the second keeps it and lets the caller retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Login rejected; the message is meant for the user.
    #[error("{0}")]
    InvalidCredentials(String),
    /// The server refused the refresh credential. The session is gone.
    #[error("session is no longer valid")]
    SessionRevoked,
    /// Network failure, timeout, or server fault. Retryable.
    #[error("temporary failure, try again: {0}")]
    TransientFailure(String),
    /// The server could not mint a token.
    #[error("server error while issuing token")]
    SigningUnavailable,
    /// Request rejected for another reason (e.g. registration validation).
    #[error("{0}")]
    Rejected(String),
    /// The call needs a session and there is none.
    #[error("not logged in")]
    NotAuthenticated,
}

impl ClientError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::TransientFailure(_) | ClientError::SigningUnavailable
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::TransientFailure(e.to_string())
    }
}
