use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AuthError, TransportError};

/// What the transport needs from the session layer
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Current access token, if signed in
    async fn bearer_token(&self) -> Option<String>;

    /// Re-authenticate (joining any attempt in flight) and return the new token
    async fn force_reauth(&self) -> std::result::Result<String, AuthError>;
}

/// HTTP client for the catalog API with 401 recovery
///
/// A 401 triggers one re-authentication and one replay of the original
/// request. The replayed response is final, whatever its status.
pub struct AuthorizedClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    session: Arc<dyn SessionAuthority>,
}

impl AuthorizedClient {
    /// Create a new HTTP client
    pub fn new(session: Arc<dyn SessionAuthority>, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, session))
    }

    pub fn with_client(client: Client, session: Arc<dyn SessionAuthority>) -> Self {
        Self { client, session }
    }

    /// Send a request with the current bearer token, recovering once from a 401
    pub async fn execute(&self, mut request: Request) -> Result<Response, TransportError> {
        if let Some(token) = self.session.bearer_token().await {
            set_bearer(&mut request, &token)?;
        }

        let original = request.try_clone().ok_or(TransportError::NotReplayable)?;

        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        let response = self.client.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(method = %method, url = %url, "Received 401, re-authenticating...");
        self.on_unauthorized(original).await
    }

    /// Re-authenticate and replay `original` exactly once with the new token
    ///
    /// Fails with `AuthenticationTerminal` when re-authentication is exhausted;
    /// the caller is expected to send the user to sign in.
    pub async fn on_unauthorized(&self, mut original: Request) -> Result<Response, TransportError> {
        let token = match self.session.force_reauth().await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, url = %original.url(), "Re-authentication failed");
                return Err(TransportError::AuthenticationTerminal(e));
            }
        };

        set_bearer(&mut original, &token)?;
        let response = self.client.execute(original).await?;

        tracing::debug!(status = %response.status(), "Replayed request after re-authentication");
        Ok(response)
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn set_bearer(request: &mut Request, token: &str) -> Result<(), TransportError> {
    let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
        TransportError::AuthenticationTerminal(AuthError::Protocol(
            "access token is not a valid header value".to_string(),
        ))
    })?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}
