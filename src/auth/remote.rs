// WordPress JWT auth endpoints

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use super::exchange::{AuthExchange, ProfileLookup};
use super::types::{
    Credentials, Identity, LoginGrant, RefreshGrant, WpErrorResponse, WpRefreshRequest,
    WpRefreshResponse, WpTokenRequest, WpTokenResponse, WpUserProfile,
};
use crate::error::{AuthError, NetworkFailure};

const TOKEN_PATH: &str = "/wp-json/jwt-auth/v1/token";
const REFRESH_PATH: &str = "/wp-json/jwt-auth/v1/token/refresh";
const VALIDATE_PATH: &str = "/wp-json/jwt-auth/v1/token/validate";
const PROFILE_PATH: &str = "/wp-json/wp/v2/users/me?context=edit";

/// Auth exchange against a WordPress site running the JWT auth plugin
pub struct WordPressAuth {
    client: Client,
    base_url: String,
}

impl WordPressAuth {
    /// Create a client for the site at `base_url` with a per-request timeout
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl AuthExchange for WordPressAuth {
    async fn login(&self, credentials: &Credentials) -> std::result::Result<LoginGrant, AuthError> {
        tracing::debug!(url = %self.url(TOKEN_PATH), "Requesting access token");

        let response = self
            .client
            .post(self.url(TOKEN_PATH))
            .json(&WpTokenRequest {
                username: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(|e| AuthError::unreachable(&e))?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            tracing::warn!(status = %status, message = %message, "Login rejected");
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AuthError::InvalidCredentials(message)
                }
                // Overloaded or broken site: the user may try again
                s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                    AuthError::Unreachable {
                        kind: NetworkFailure::Other,
                        message: format!("token endpoint returned {} - {}", status, message),
                    }
                }
                _ => AuthError::Protocol(format!("{} - {}", status, message)),
            });
        }

        let data: WpTokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Protocol(format!("Failed to parse token response: {}", e)))?;

        if data.token.is_empty() {
            return Err(AuthError::Protocol(
                "Token response does not contain a token".to_string(),
            ));
        }

        // The id comes from the token claims; the manager fills it in
        let identity = Identity {
            id: String::new(),
            display_name: data
                .user_display_name
                .or(data.user_nicename)
                .unwrap_or_default(),
            email: data.user_email.unwrap_or_default(),
            roles: Default::default(),
        };

        Ok(LoginGrant {
            access_token: data.token,
            refresh_token: data.refresh_token,
            identity,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> std::result::Result<RefreshGrant, AuthError> {
        tracing::info!("Refreshing access token...");

        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&WpRefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| AuthError::unreachable(&e))?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            tracing::warn!(status = %status, message = %message, "Refresh rejected");
            return Err(AuthError::RefreshRejected(format!("{} - {}", status, message)));
        }

        let data: WpRefreshResponse = response.json().await.map_err(|e| {
            AuthError::Protocol(format!("Failed to parse refresh response: {}", e))
        })?;

        if data.token.is_empty() {
            return Err(AuthError::RefreshRejected(
                "Refresh response does not contain a token".to_string(),
            ));
        }

        Ok(RefreshGrant {
            access_token: data.token,
            refresh_token: data.refresh_token,
        })
    }

    async fn validate(&self, access_token: &str) -> std::result::Result<bool, AuthError> {
        let response = self
            .client
            .post(self.url(VALIDATE_PATH))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::unreachable(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status.is_server_error() {
            // The site is up but broken; we cannot tell whether the token is valid
            return Err(AuthError::Unreachable {
                kind: NetworkFailure::Other,
                message: format!("validation endpoint returned {}", status),
            });
        }

        let message = error_message(response).await;
        tracing::debug!(status = %status, message = %message, "Token failed validation");
        Ok(false)
    }
}

#[async_trait]
impl ProfileLookup for WordPressAuth {
    async fn fetch_identity(&self, access_token: &str) -> std::result::Result<Identity, AuthError> {
        let response = self
            .client
            .get(self.url(PROFILE_PATH))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::unreachable(&e))?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(AuthError::Protocol(format!(
                "Profile lookup failed: {} - {}",
                status, message
            )));
        }

        let profile: WpUserProfile = response
            .json()
            .await
            .map_err(|e| AuthError::Protocol(format!("Failed to parse profile: {}", e)))?;
        Ok(profile.into())
    }
}

/// Best human-readable message from a WordPress error body
async fn error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<WpErrorResponse>(&text) {
        Ok(WpErrorResponse {
            message: Some(message),
            ..
        }) => message,
        Ok(WpErrorResponse {
            code: Some(code), ..
        }) => code,
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn auth_for(server: &mockito::ServerGuard) -> WordPressAuth {
        WordPressAuth::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_login_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::Json(serde_json::json!({
                "username": "ana",
                "password": "secret"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"token":"a.b.c","refresh_token":"r-1","user_email":"ana@example.org","user_nicename":"ana","user_display_name":"Ana"}"#,
            )
            .create_async()
            .await;

        let grant = auth_for(&server)
            .login(&Credentials::new("ana", "secret"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(grant.access_token, "a.b.c");
        assert_eq!(grant.refresh_token.as_deref(), Some("r-1"));
        assert_eq!(grant.identity.display_name, "Ana");
        assert_eq!(grant.identity.email, "ana@example.org");
    }

    #[tokio::test]
    async fn test_login_invalid_credentials() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(403)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"[jwt_auth] incorrect_password","message":"The password you entered is incorrect.","data":{"status":403}}"#)
            .create_async()
            .await;

        let err = auth_for(&server)
            .login(&Credentials::new("ana", "wrong"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AuthError::InvalidCredentials("The password you entered is incorrect.".to_string())
        );
    }

    #[tokio::test]
    async fn test_login_unreachable() {
        // Nothing listens on port 9 of localhost
        let auth = WordPressAuth::new("http://127.0.0.1:9", Duration::from_secs(5)).unwrap();
        let err = auth.login(&Credentials::new("ana", "secret")).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(
            err,
            AuthError::Unreachable {
                kind: NetworkFailure::Connect,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_login_server_errors_are_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::Json(serde_json::json!({
                "username": "busy",
                "password": "secret"
            })))
            .with_status(503)
            .with_body("Service Unavailable")
            .create_async()
            .await;
        server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::Json(serde_json::json!({
                "username": "eager",
                "password": "secret"
            })))
            .with_status(429)
            .create_async()
            .await;

        let auth = auth_for(&server);
        for username in ["busy", "eager"] {
            let err = auth
                .login(&Credentials::new(username, "secret"))
                .await
                .unwrap_err();
            assert!(err.is_retryable(), "{} -> {:?}", username, err);
            assert!(matches!(
                err,
                AuthError::Unreachable {
                    kind: NetworkFailure::Other,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn test_refresh_success_and_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", REFRESH_PATH)
            .match_body(Matcher::Json(serde_json::json!({ "refresh_token": "good" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"new.access.token"}"#)
            .create_async()
            .await;
        server
            .mock("POST", REFRESH_PATH)
            .match_body(Matcher::Json(serde_json::json!({ "refresh_token": "revoked" })))
            .with_status(401)
            .with_body(r#"{"code":"jwt_auth_invalid_refresh_token","message":"Invalid refresh token"}"#)
            .create_async()
            .await;

        let auth = auth_for(&server);
        let grant = auth.refresh("good").await.unwrap();
        assert_eq!(grant.access_token, "new.access.token");
        assert_eq!(grant.refresh_token, None);

        let err = auth.refresh("revoked").await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshRejected(ref m) if m.contains("Invalid refresh token")));
    }

    #[tokio::test]
    async fn test_validate() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", VALIDATE_PATH)
            .match_header("authorization", "Bearer valid")
            .with_status(200)
            .with_body(r#"{"code":"jwt_auth_valid_token","data":{"status":200}}"#)
            .create_async()
            .await;
        server
            .mock("POST", VALIDATE_PATH)
            .match_header("authorization", "Bearer expired")
            .with_status(403)
            .with_body(r#"{"code":"jwt_auth_invalid_token","message":"Expired token"}"#)
            .create_async()
            .await;
        server
            .mock("POST", VALIDATE_PATH)
            .match_header("authorization", "Bearer unlucky")
            .with_status(502)
            .create_async()
            .await;

        let auth = auth_for(&server);
        assert_eq!(auth.validate("valid").await, Ok(true));
        assert_eq!(auth.validate("expired").await, Ok(false));
        assert!(auth.validate("unlucky").await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_identity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/wp-json/wp/v2/users/me")
            .match_query(Matcher::UrlEncoded("context".into(), "edit".into()))
            .match_header("authorization", "Bearer a.b.c")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":42,"name":"Ana","email":"ana@example.org","roles":["editor"]}"#)
            .create_async()
            .await;

        let identity = auth_for(&server).fetch_identity("a.b.c").await.unwrap();
        assert_eq!(identity.id, "42");
        assert!(identity.roles.contains("editor"));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let auth = WordPressAuth::new("https://catalog.example.org/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            auth.url(TOKEN_PATH),
            "https://catalog.example.org/wp-json/jwt-auth/v1/token"
        );
    }
}
