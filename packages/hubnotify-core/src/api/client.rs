use crate::auth::{load_session, CredentialStore, SessionCredentials};
use crate::config::Settings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The stored session was refused by the API; signing in again is needed.
#[derive(Debug, thiserror::Error)]
#[error("Session rejected by GitHub (HTTP {0})")]
pub struct SessionRejected(pub u16);

#[derive(Debug, Clone)]
pub struct NotificationsClient {
    api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub unread: bool,
    pub reason: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub subject: NotificationSubject,
    pub repository: NotificationRepository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSubject {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRepository {
    pub full_name: String,
}

impl NotificationsClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(crate::auth::USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(&settings.api_url.value)
    }

    /// Fetch notifications for `session`. With `all`, read ones are included.
    pub async fn fetch_notifications(
        &self,
        session: &SessionCredentials,
        all: bool,
    ) -> Result<Vec<Notification>> {
        let url = format!("{}/notifications", self.api_url);

        let mut request = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .bearer_auth(&session.session_token);
        if all {
            request = request.query(&[("all", "1")]);
        }

        let resp = request.send().await.context("Failed to fetch notifications")?;

        match resp.status().as_u16() {
            401 | 403 => {
                let status = resp.status().as_u16();
                tracing::warn!("Notifications request rejected with status {}", status);
                Err(SessionRejected(status).into())
            }
            _ if !resp.status().is_success() => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(anyhow::anyhow!("Server returned error: {} - {}", status, body))
            }
            _ => {
                let notifications = resp
                    .json::<Vec<Notification>>()
                    .await
                    .context("Failed to parse notifications response")?;
                tracing::debug!(
                    "Fetched {} notifications for {}",
                    notifications.len(),
                    session.account_login
                );
                Ok(notifications)
            }
        }
    }

    /// Fetch notifications using the session persisted in `store`.
    pub async fn fetch_for_stored_session(
        &self,
        store: &dyn CredentialStore,
        all: bool,
    ) -> Result<Vec<Notification>> {
        let session = load_session(store)
            .await
            .context("Failed to load credentials")?
            .ok_or_else(|| anyhow::anyhow!("Not signed in"))?;
        self.fetch_notifications(&session, all).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryCredentialStore, LOGIN_KEY, TOKEN_KEY};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session() -> SessionCredentials {
        SessionCredentials {
            session_token: "tok_1".into(),
            account_login: "octocat".into(),
        }
    }

    fn sample() -> serde_json::Value {
        serde_json::json!([{
            "id": "1",
            "unread": true,
            "reason": "review_requested",
            "updated_at": "2024-05-01T12:00:00Z",
            "subject": { "title": "Fix flaky test", "type": "PullRequest", "url": null },
            "repository": { "full_name": "octo/hello-world", "private": false }
        }])
    }

    #[tokio::test]
    async fn test_fetch_all_notifications() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notifications"))
            .and(query_param("all", "1"))
            .and(header("authorization", "Bearer tok_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample()))
            .expect(1)
            .mount(&server)
            .await;

        let client = NotificationsClient::new(&server.uri()).unwrap();
        let notifications = client.fetch_notifications(&session(), true).await.unwrap();

        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].subject.kind, "PullRequest");
        assert_eq!(notifications[0].repository.full_name, "octo/hello-world");
    }

    #[tokio::test]
    async fn test_unauthorized_is_session_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notifications"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = NotificationsClient::new(&server.uri()).unwrap();
        let err = client.fetch_notifications(&session(), false).await.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionRejected>().map(|e| e.0), Some(401));
    }

    #[tokio::test]
    async fn test_partial_session_is_not_signed_in() {
        let store = MemoryCredentialStore::new();
        store.set(TOKEN_KEY, "tok_1").await.unwrap();

        let client = NotificationsClient::new("http://127.0.0.1:9").unwrap();
        let err = client.fetch_for_stored_session(&store, true).await.unwrap_err();
        assert!(err.to_string().contains("Not signed in"));

        store.set(LOGIN_KEY, "octocat").await.unwrap();
        assert!(load_session(&store).await.unwrap().is_some());
    }
}
