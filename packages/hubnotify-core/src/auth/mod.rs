//! Authentication module for hubnotify.
//!
//! Provides the OAuth authorization-code handshake with GitHub and secure
//! credential storage.

mod credentials;
mod deep_link;
mod error;
mod gateway;
mod launcher;
mod machine;

pub use credentials::{
    auth_status, clear_session, default_store, get_credential_storage_info, load_session,
    save_session, AuthStatus, CredentialStore, FileCredentialStore, MemoryCredentialStore,
    SessionCredentials, LOGIN_KEY, TOKEN_KEY,
};
#[cfg(feature = "keyring-storage")]
pub use credentials::KeyringCredentialStore;
pub use deep_link::{extract_code, spawn_callback_listener, DeepLinkRouter, DeepLinkSubscription};
pub use error::{AuthError, ErrorKind};
pub use gateway::{HttpIdentityGateway, IdentityGateway};
pub(crate) use gateway::USER_AGENT;
pub use launcher::{
    system_browser, BrowserOpener, LaunchOutcome, LoopbackLauncher, SystemBrowserLauncher,
    UserAgentLauncher,
};
pub use machine::{
    AlertSink, AttemptResult, AuthMachine, AuthPhase, AuthSnapshot, Collaborators,
    ErrorReporter, HandshakeConfig, TracingReporter,
};
