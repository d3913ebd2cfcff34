// Remote collaborators of the session manager

use async_trait::async_trait;

use super::types::{Credentials, Identity, LoginGrant, RefreshGrant};
use crate::error::AuthError;

/// Credential exchanges against the auth server
///
/// Implementations should carry their own transport timeout; the session
/// manager additionally bounds every re-authentication exchange.
#[async_trait]
pub trait AuthExchange: Send + Sync {
    /// Fails with `InvalidCredentials` or `Unreachable`
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, AuthError>;

    /// Fails with `RefreshRejected` or `Unreachable`
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, AuthError>;

    /// `Ok(false)` for an invalid token; `Err` only for transport failures
    async fn validate(&self, access_token: &str) -> Result<bool, AuthError>;
}

/// Best-effort profile lookup; failures never block sign-in
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn fetch_identity(&self, access_token: &str) -> Result<Identity, AuthError>;
}
