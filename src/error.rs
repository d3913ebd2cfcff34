// Error handling module
// Defines the session error taxonomy shared by the auth layer and the transport

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Token could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Wrong segment count, bad base64, bad JSON or an unusable claim
    #[error("Malformed token: {0}")]
    Malformed(String),
}

/// Class of transport failure seen while talking to the auth server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    Timeout,
    Connect,
    Other,
}

impl NetworkFailure {
    /// Categorize a reqwest error
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkFailure::Timeout
        } else if err.is_connect() {
            NetworkFailure::Connect
        } else {
            NetworkFailure::Other
        }
    }
}

impl fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            NetworkFailure::Timeout => "timeout",
            NetworkFailure::Connect => "connection_failed",
            NetworkFailure::Other => "unknown",
        };
        f.write_str(kind)
    }
}

/// Errors produced by the session lifecycle
///
/// Cloneable because a single re-authentication outcome is observed by every
/// caller that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Login rejected by the server
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Refresh token rejected by the server
    #[error("Refresh rejected: {0}")]
    RefreshRejected(String),

    /// Auth server could not be reached
    #[error("Auth server unreachable ({kind}): {message}")]
    Unreachable {
        kind: NetworkFailure,
        message: String,
    },

    /// Server reported the stored access token as invalid
    #[error("Session rejected: {0}")]
    SessionRejected(String),

    /// No session to operate on
    #[error("Not signed in")]
    NotSignedIn,

    /// Exchange did not resolve within its deadline
    #[error("Re-authentication timed out after {0:?}")]
    TimedOut(Duration),

    /// Server answered with something we could not interpret
    #[error("Unexpected auth server response: {0}")]
    Protocol(String),
}

impl AuthError {
    /// Build an `Unreachable` error from a reqwest transport failure
    pub fn unreachable(err: &reqwest::Error) -> Self {
        AuthError::Unreachable {
            kind: NetworkFailure::classify(err),
            message: err.to_string(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Unreachable { .. } | AuthError::TimedOut(_))
    }
}

/// Errors surfaced by the authorized HTTP client
#[derive(Error, Debug)]
pub enum TransportError {
    /// Re-authentication exhausted every option; the caller should send the
    /// user to a sign-in surface
    #[error("Authentication failed: {0}")]
    AuthenticationTerminal(#[source] AuthError),

    /// Request body cannot be cloned, so it could never be replayed
    #[error("Request body is not cloneable")]
    NotReplayable,

    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AuthError>;
