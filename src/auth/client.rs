// Transport to the auth endpoints

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::types::{LoginRequest, RefreshRequest, RegisterRequest, TokenResponse};
use crate::error::{extract_error_message, EndpointError};

/// Get machine fingerprint for User-Agent
fn get_machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// HTTP client for `/auth/login`, `/auth/register`, `/auth/refresh` and `/auth/logout`
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl AuthClient {
    /// Create a client for the auth server at `base_url`
    pub fn new(base_url: &str, connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let user_agent = format!(
            "session-gate/{}-{}",
            env!("CARGO_PKG_VERSION"),
            get_machine_fingerprint()
        );

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<TokenResponse, EndpointError> {
        tracing::debug!(email = %request.email, "Logging in");
        self.post_for_tokens("/auth/login", request).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<TokenResponse, EndpointError> {
        tracing::debug!(email = %request.email, "Registering account");
        self.post_for_tokens("/auth/register", request).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, EndpointError> {
        tracing::info!("Refreshing access token...");
        let response = self
            .post_for_tokens("/auth/refresh", &RefreshRequest { refresh_token })
            .await?;

        if response.access_token.as_deref().map_or(true, str::is_empty) {
            return Err(EndpointError::Malformed(
                "refresh response does not contain access_token".to_string(),
            ));
        }
        Ok(response)
    }

    /// Tell the server the session is over. Callers treat failure as non-fatal.
    pub async fn logout(&self, access_token: &str) -> Result<(), EndpointError> {
        let url = format!("{}/auth/logout", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| EndpointError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EndpointError::Rejected {
                status: status.as_u16(),
                message: extract_error_message(status.as_u16(), &body),
            });
        }
        Ok(())
    }

    async fn post_for_tokens<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<TokenResponse, EndpointError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| EndpointError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = extract_error_message(status.as_u16(), &body);
            tracing::warn!(
                status = status.as_u16(),
                url = %url,
                message = %message,
                "Auth endpoint rejected request"
            );
            return Err(EndpointError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| EndpointError::from_reqwest(e, self.timeout))?;
        if text.trim().is_empty() {
            return Ok(TokenResponse::default());
        }
        serde_json::from_str(&text).map_err(|e| {
            EndpointError::Malformed(format!("Failed to parse {} response: {}", path, e))
        })
    }
}
