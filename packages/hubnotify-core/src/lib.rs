//! hubnotify Core Library
//!
//! This crate provides the core functionality for hubnotify clients:
//! - GitHub sign-in (OAuth authorization code via an external browser)
//! - Credential management (keyring with file fallback)
//! - The authenticated notifications request
//!
//! # Features
//!
//! - `keyring-storage` (default): Use platform keyring for credential storage
//! - `file-storage`: Always use file-based credential storage (for headless Linux)
//! - `browser` (default): Open the authorization page in the default browser
//!
//! # Example
//!
//! ```no_run
//! use hubnotify_core::{api, auth, config};
//! use std::sync::Arc;
//!
//! struct PrintAlerts;
//!
//! impl auth::AlertSink for PrintAlerts {
//!     fn alert(&self, kind: auth::ErrorKind, message: &str) {
//!         eprintln!("{kind}: {message}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = config::load_settings();
//!     let store: Arc<dyn auth::CredentialStore> = Arc::from(auth::default_store()?);
//!
//!     let machine = auth::AuthMachine::new(
//!         auth::HandshakeConfig {
//!             authorize_url: settings.authorize_url()?.to_string(),
//!             callback_prefix: settings.callback_url.value.clone(),
//!         },
//!         auth::Collaborators {
//!             store: store.clone(),
//!             gateway: Arc::new(auth::HttpIdentityGateway::from_settings(&settings)?),
//!             launcher: Arc::new(auth::LoopbackLauncher::new()),
//!             alerts: Arc::new(PrintAlerts),
//!             telemetry: Arc::new(auth::TracingReporter),
//!         },
//!     );
//!
//!     if let auth::AttemptResult::Authenticated(session) = machine.login().await {
//!         let client = api::NotificationsClient::from_settings(&settings)?;
//!         let notifications = client.fetch_notifications(&session, true).await?;
//!         println!("{} notifications for {}", notifications.len(), session.account_login);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;

// Re-export commonly used types
pub use api::{Notification, NotificationsClient};
pub use auth::{AttemptResult, AuthError, AuthMachine, AuthPhase, AuthSnapshot, AuthStatus, SessionCredentials};
pub use config::{load_settings, ConfigSource, Settings};
