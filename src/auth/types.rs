// Authentication types

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkFailure;

/// Phase of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    SignedOut,
    SignedIn,
    /// Exactly one exchange is outstanding
    Reauthenticating,
}

/// Signed-in user as seen by the catalog client
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub roles: BTreeSet<String>,
}

/// Username/password pair submitted at login
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Tokens and identity returned by a successful login
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub identity: Identity,
}

/// Token data from refresh response
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub access_token: String,
    /// Present when the server rotates refresh tokens
    pub refresh_token: Option<String>,
}

/// Outcome of a successful re-authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The process-wide session state
///
/// Only the session manager mutates it, always under one write lock, so the
/// token and its expiry never drift apart.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub identity: Option<Identity>,
    pub phase: SessionPhase,
    pub remember_me: bool,

    /// Bumped by login and logout; exchanges started under an older
    /// generation never apply their result
    pub(crate) generation: u64,
}

/// How to treat a token validation that failed at the transport level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkErrorPolicy {
    /// Any network failure keeps the stored session
    #[default]
    Lenient,
    /// Only timeouts and connection failures keep the stored session
    TimeoutsOnly,
    /// Every network failure counts as a rejection
    Strict,
}

impl NetworkErrorPolicy {
    /// Whether a validation failing with `kind` should be treated as "still valid"
    pub fn tolerates(&self, kind: NetworkFailure) -> bool {
        match self {
            NetworkErrorPolicy::Lenient => true,
            NetworkErrorPolicy::TimeoutsOnly => {
                matches!(kind, NetworkFailure::Timeout | NetworkFailure::Connect)
            }
            NetworkErrorPolicy::Strict => false,
        }
    }
}

/// Timing and failure policy for the session manager
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Renew this long before the token expires
    pub refresh_margin: Duration,

    /// Upper bound on a single re-authentication exchange
    pub exchange_timeout: Duration,

    /// Floor on how soon a proactive wake may fire
    pub min_wake_delay: Duration,

    pub network_errors: NetworkErrorPolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(60),
            exchange_timeout: Duration::from_secs(30),
            min_wake_delay: Duration::from_secs(5),
            network_errors: NetworkErrorPolicy::default(),
        }
    }
}

/// WordPress JWT login request
#[derive(Serialize)]
pub struct WpTokenRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// WordPress JWT login response
#[derive(Deserialize)]
pub struct WpTokenResponse {
    pub token: String,
    pub refresh_token: Option<String>,
    pub user_email: Option<String>,
    pub user_nicename: Option<String>,
    pub user_display_name: Option<String>,
}

/// WordPress JWT refresh request
#[derive(Serialize)]
pub struct WpRefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// WordPress JWT refresh response
#[derive(Deserialize)]
pub struct WpRefreshResponse {
    pub token: String,
    pub refresh_token: Option<String>,
}

/// WordPress error body (`{"code": "...", "message": "..."}`)
#[derive(Deserialize)]
pub struct WpErrorResponse {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// WordPress `users/me` profile
#[derive(Deserialize)]
pub struct WpUserProfile {
    pub id: u64,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl From<WpUserProfile> for Identity {
    fn from(profile: WpUserProfile) -> Self {
        Identity {
            id: profile.id.to_string(),
            display_name: profile.name.unwrap_or_default(),
            email: profile.email.unwrap_or_default(),
            roles: profile.roles.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_policy() {
        assert!(NetworkErrorPolicy::Lenient.tolerates(NetworkFailure::Other));
        assert!(NetworkErrorPolicy::TimeoutsOnly.tolerates(NetworkFailure::Timeout));
        assert!(NetworkErrorPolicy::TimeoutsOnly.tolerates(NetworkFailure::Connect));
        assert!(!NetworkErrorPolicy::TimeoutsOnly.tolerates(NetworkFailure::Other));
        assert!(!NetworkErrorPolicy::Strict.tolerates(NetworkFailure::Timeout));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_profile_into_identity() {
        let profile: WpUserProfile = serde_json::from_str(
            r#"{"id": 7, "name": "Ana", "email": "ana@example.org", "roles": ["editor", "subscriber"]}"#,
        )
        .unwrap();
        let identity = Identity::from(profile);
        assert_eq!(identity.id, "7");
        assert_eq!(identity.display_name, "Ana");
        assert!(identity.roles.contains("editor"));
        assert_eq!(identity.roles.len(), 2);
    }
}
