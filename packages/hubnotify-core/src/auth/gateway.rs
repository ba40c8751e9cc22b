//! Client for the identity gateway that turns an authorization code into a
//! session token and registers the resulting session, and for the provider's
//! user-info endpoint.

use crate::auth::error::AuthError;
use crate::config::Settings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const USER_AGENT: &str = concat!("hubnotify/", env!("CARGO_PKG_VERSION"));

/// Backend calls made during the handshake. Stateless, one request per call.
#[async_trait]
pub trait IdentityGateway: Send + Sync {
    /// Trade a single-use authorization code for a session token.
    async fn exchange_code(&self, code: &str) -> Result<String, AuthError>;

    /// Look up the account login that owns `session_token`.
    async fn fetch_account_login(&self, session_token: &str) -> Result<String, AuthError>;

    /// Register the stored session and its account with the gateway. Runs
    /// once both credentials are persisted.
    async fn register_session(
        &self,
        session_token: &str,
        account_login: &str,
    ) -> Result<(), AuthError>;

    /// Tell the gateway the session is being discarded.
    async fn sign_out(&self, session_token: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Clone)]
pub struct HttpIdentityGateway {
    gateway_url: String,
    api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    login: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

impl HttpIdentityGateway {
    pub fn new(gateway_url: &str, api_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(&settings.gateway_url.value, &settings.api_url.value)
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, AuthError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("{} returned status {}", operation, status);
        Err(AuthError::Exchange {
            operation,
            status: Some(status),
            detail: body,
        })
    }
}

#[async_trait]
impl IdentityGateway for HttpIdentityGateway {
    async fn exchange_code(&self, code: &str) -> Result<String, AuthError> {
        const OPERATION: &str = "code exchange";
        let url = format!("{}/auth", self.gateway_url);

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&ExchangeRequest { code })
            .send()
            .await
            .map_err(|e| AuthError::transport(OPERATION, e))?;

        let response = Self::ensure_success(response, OPERATION).await?;
        let body = response
            .json::<ExchangeResponse>()
            .await
            .map_err(|e| AuthError::transport(OPERATION, e))?;

        if body.token.is_empty() {
            return Err(AuthError::Exchange {
                operation: OPERATION,
                status: None,
                detail: "gateway returned an empty token".to_string(),
            });
        }
        Ok(body.token)
    }

    async fn fetch_account_login(&self, session_token: &str) -> Result<String, AuthError> {
        const OPERATION: &str = "account lookup";
        let url = format!("{}/user", self.api_url);

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(session_token)
            .send()
            .await
            .map_err(|e| AuthError::transport(OPERATION, e))?;

        let response = Self::ensure_success(response, OPERATION).await?;
        let user = response
            .json::<UserResponse>()
            .await
            .map_err(|e| AuthError::transport(OPERATION, e))?;
        Ok(user.login)
    }

    async fn register_session(
        &self,
        session_token: &str,
        account_login: &str,
    ) -> Result<(), AuthError> {
        const OPERATION: &str = "session registration";
        let url = format!("{}/login", self.gateway_url);

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(session_token)
            .json(&RegisterRequest {
                login: account_login,
            })
            .send()
            .await
            .map_err(|e| AuthError::transport(OPERATION, e))?;

        Self::ensure_success(response, OPERATION).await?;
        tracing::debug!("Session registered for {}", account_login);
        Ok(())
    }

    async fn sign_out(&self, session_token: &str) -> Result<(), AuthError> {
        const OPERATION: &str = "sign out";
        let url = format!("{}/logout", self.gateway_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(session_token)
            .send()
            .await
            .map_err(|e| AuthError::transport(OPERATION, e))?;

        Self::ensure_success(response, OPERATION).await?;
        Ok(())
    }
}
