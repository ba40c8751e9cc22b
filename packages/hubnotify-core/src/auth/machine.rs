//! The sign-in state machine.
//!
//! ```text
//! Idle -> Launching -> AwaitingCallback -> Exchanging -> Persisting -> Authenticated
//!           |               |                  |             |
//!           +-> Idle        +------------------+-------------+-> Failed -> Idle
//!        (cancelled)
//! ```
//!
//! Two triggers can deliver the same authorization code: the launcher's own
//! success result and the deep-link listener. [`AuthMachine::resume`] claims
//! the `Exchanging` phase atomically, so only the first trigger runs the
//! exchange; later ones are ignored.
//!
//! Every attempt carries a number. `logout` and `abandon` start a new one, so
//! an exchange still in flight from the old attempt can no longer move the
//! machine; when it finishes it removes whatever it stored.

use crate::auth::credentials::{
    clear_session, load_session, save_session, CredentialStore, SessionCredentials, TOKEN_KEY,
};
use crate::auth::deep_link::extract_code;
use crate::auth::error::{AuthError, ErrorKind};
use crate::auth::gateway::IdentityGateway;
use crate::auth::launcher::{LaunchOutcome, UserAgentLauncher};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Idle,
    Launching,
    AwaitingCallback,
    Exchanging,
    Persisting,
    Authenticated,
    Failed,
}

impl AuthPhase {
    fn awaiting_code(self) -> bool {
        matches!(self, AuthPhase::Launching | AuthPhase::AwaitingCallback)
    }
}

/// Observable state for front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthSnapshot {
    pub phase: AuthPhase,
    pub loading: bool,
}

impl AuthSnapshot {
    const IDLE: AuthSnapshot = AuthSnapshot {
        phase: AuthPhase::Idle,
        loading: false,
    };
}

/// What a `login`/`resume` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// The call did nothing because the machine was in the wrong phase.
    Ignored,
    /// The user dismissed the authorization page, or the attempt was abandoned.
    Cancelled,
    /// Waiting for the callback to arrive through another trigger.
    Pending,
    /// A logout or a newer attempt took over while this one ran. Nothing it
    /// stored is kept and no alert was raised.
    Superseded,
    Authenticated(SessionCredentials),
    Failed(ErrorKind),
}

/// User-visible error reporting.
pub trait AlertSink: Send + Sync {
    fn alert(&self, kind: ErrorKind, message: &str);
}

/// Diagnostics sink. Must not block; its outcome never affects the machine.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &AuthError);
}

/// Reports errors as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &AuthError) {
        tracing::error!(kind = %error.kind(), "Sign-in error: {}", error);
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub authorize_url: String,
    pub callback_prefix: String,
}

pub struct Collaborators {
    pub store: Arc<dyn CredentialStore>,
    pub gateway: Arc<dyn IdentityGateway>,
    pub launcher: Arc<dyn UserAgentLauncher>,
    pub alerts: Arc<dyn AlertSink>,
    pub telemetry: Arc<dyn ErrorReporter>,
}

struct Inner {
    config: HandshakeConfig,
    deps: Collaborators,
    state: watch::Sender<AuthSnapshot>,
    // Only changed while the state lock is held.
    attempt: AtomicU64,
    // Result of the last attempt that settled through an exchange.
    outcome: Mutex<Option<AttemptResult>>,
}

/// Cheap to clone; clones share one state.
#[derive(Clone)]
pub struct AuthMachine {
    inner: Arc<Inner>,
}

impl AuthMachine {
    pub fn new(config: HandshakeConfig, deps: Collaborators) -> Self {
        let (state, _) = watch::channel(AuthSnapshot::IDLE);
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                state,
                attempt: AtomicU64::new(0),
                outcome: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        *self.inner.state.borrow()
    }

    pub fn loading(&self) -> bool {
        self.snapshot().loading
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.state.subscribe()
    }

    fn outcome(&self) -> MutexGuard<'_, Option<AttemptResult>> {
        self.inner
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically move to `phase` when `allowed(current_phase, current_attempt)`
    /// holds. With `new_attempt` the attempt number is bumped in the same step.
    ///
    /// Returns the attempt number the machine is on afterwards, or `None` if
    /// the move was refused.
    fn transition(
        &self,
        allowed: impl FnOnce(AuthPhase, u64) -> bool,
        phase: AuthPhase,
        loading: bool,
        new_attempt: bool,
    ) -> Option<u64> {
        let counter = &self.inner.attempt;
        let mut entered = None;
        let changed = self.inner.state.send_if_modified(|s| {
            let current = counter.load(Ordering::SeqCst);
            if !allowed(s.phase, current) {
                return false;
            }
            entered = Some(if new_attempt {
                counter.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                current
            });
            let changed = s.phase != phase || s.loading != loading;
            s.phase = phase;
            s.loading = loading;
            changed
        });
        if changed {
            tracing::debug!(?phase, loading, "Auth phase changed");
        }
        entered
    }

    /// Step within `attempt` from `from` to `phase`.
    fn advance(&self, attempt: u64, from: &[AuthPhase], phase: AuthPhase, loading: bool) -> bool {
        self.transition(
            |current, id| id == attempt && from.contains(&current),
            phase,
            loading,
            false,
        )
        .is_some()
    }

    /// Last step of an attempt: leave `from` for `phase` with `loading` off and
    /// publish `result` in the same step, so a waiter woken by the change
    /// always finds it.
    fn settle(&self, attempt: u64, from: AuthPhase, phase: AuthPhase, result: AttemptResult) -> bool {
        let counter = &self.inner.attempt;
        let settled = self.inner.state.send_if_modified(|s| {
            if counter.load(Ordering::SeqCst) != attempt || s.phase != from {
                return false;
            }
            *self.outcome() = Some(result);
            s.phase = phase;
            s.loading = false;
            true
        });
        if settled {
            tracing::debug!(?phase, loading = false, "Auth phase changed");
        }
        settled
    }

    /// Start a sign-in attempt. Does nothing unless the machine is idle.
    pub async fn login(&self) -> AttemptResult {
        let Some(attempt) = self.transition(
            |phase, _| phase == AuthPhase::Idle,
            AuthPhase::Launching,
            true,
            true,
        ) else {
            tracing::debug!("Login ignored, attempt already in progress");
            return AttemptResult::Ignored;
        };
        self.outcome().take();

        tracing::info!("Opening authorization page");
        let launched = self
            .inner
            .deps
            .launcher
            .open_authorization_page(
                &self.inner.config.authorize_url,
                &self.inner.config.callback_prefix,
            )
            .await;

        match launched {
            Ok(LaunchOutcome::Success { callback_url }) => {
                // A deep link may already have claimed this attempt.
                if !self.advance(attempt, &[AuthPhase::Launching], AuthPhase::AwaitingCallback, true) {
                    return AttemptResult::Pending;
                }
                let Some(code) = extract_code(&callback_url) else {
                    tracing::warn!("Launcher callback carried no authorization code");
                    return AttemptResult::Pending;
                };

                // The exchange runs as its own task: dropping this future
                // must never leave a half-finished exchange behind.
                let machine = self.clone();
                let exchange =
                    tokio::spawn(async move { machine.resume_attempt(Some(attempt), &code).await });
                match exchange.await {
                    Ok(AttemptResult::Ignored) => AttemptResult::Pending,
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!("Code exchange task failed: {}", e);
                        AttemptResult::Failed(ErrorKind::Exchange)
                    }
                }
            }
            Ok(LaunchOutcome::Cancelled) => {
                if self.advance(
                    attempt,
                    &[AuthPhase::Launching, AuthPhase::AwaitingCallback],
                    AuthPhase::Idle,
                    false,
                ) {
                    tracing::info!("Sign-in cancelled by user");
                    AttemptResult::Cancelled
                } else {
                    AttemptResult::Pending
                }
            }
            Ok(LaunchOutcome::Detached) => {
                self.advance(attempt, &[AuthPhase::Launching], AuthPhase::AwaitingCallback, true);
                AttemptResult::Pending
            }
            Err(error) => {
                let kind = error.kind();
                if self.fail(attempt, &[AuthPhase::Launching], error) {
                    AttemptResult::Failed(kind)
                } else {
                    AttemptResult::Pending
                }
            }
        }
    }

    /// Run [`login`](Self::login) until the attempt settles or `stop` resolves.
    ///
    /// On `stop`, an attempt still waiting for its code is abandoned and
    /// reported as `Cancelled`. One whose exchange already started is waited
    /// for. The launcher future is dropped either way.
    pub async fn login_until<F>(&self, stop: F) -> AttemptResult
    where
        F: Future<Output = ()>,
    {
        let mut state = self.subscribe();
        tokio::pin!(stop);

        let result = tokio::select! {
            biased;
            result = self.login() => result,
            _ = &mut stop => return self.stop_attempt(&mut state).await,
        };
        if result != AttemptResult::Pending {
            return result;
        }

        tokio::select! {
            biased;
            _ = async { let _ = state.wait_for(|s| !s.loading).await; } => self.settled_result(),
            _ = &mut stop => self.stop_attempt(&mut state).await,
        }
    }

    async fn stop_attempt(&self, state: &mut watch::Receiver<AuthSnapshot>) -> AttemptResult {
        if self.abandon() {
            return AttemptResult::Cancelled;
        }
        // The exchange is under way and always runs to the end.
        let _ = state.wait_for(|s| !s.loading).await;
        self.settled_result()
    }

    fn settled_result(&self) -> AttemptResult {
        let outcome = self.outcome().take();
        match outcome {
            Some(result) => result,
            None if self.snapshot().phase == AuthPhase::Idle => AttemptResult::Superseded,
            None => AttemptResult::Pending,
        }
    }

    /// Continue the attempt with an authorization code.
    ///
    /// Callable from any trigger. Only acts while launching or awaiting the
    /// callback; once it starts it runs to `Authenticated` or `Failed`, unless
    /// a logout or newer attempt supersedes it first.
    pub async fn resume(&self, code: &str) -> AttemptResult {
        self.resume_attempt(None, code).await
    }

    async fn resume_attempt(&self, expected: Option<u64>, code: &str) -> AttemptResult {
        let Some(attempt) = self.transition(
            |phase, id| phase.awaiting_code() && expected.is_none_or(|e| e == id),
            AuthPhase::Exchanging,
            true,
            false,
        ) else {
            tracing::debug!("Authorization code ignored in phase {:?}", self.snapshot().phase);
            return AttemptResult::Ignored;
        };

        match self.establish_session(attempt, code).await {
            Ok(Some(creds)) => {
                tracing::info!("Signed in as {}", creds.account_login);
                AttemptResult::Authenticated(creds)
            }
            Ok(None) => AttemptResult::Superseded,
            Err(error) => {
                let kind = error.kind();
                if self.fail(attempt, &[AuthPhase::Exchanging, AuthPhase::Persisting], error) {
                    AttemptResult::Failed(kind)
                } else {
                    AttemptResult::Superseded
                }
            }
        }
    }

    /// Exchange, look up, persist and register. `Ok(None)` when the attempt
    /// was superseded on the way.
    async fn establish_session(
        &self,
        attempt: u64,
        code: &str,
    ) -> Result<Option<SessionCredentials>, AuthError> {
        let deps = &self.inner.deps;

        // The code is spent from here on, whatever the outcome.
        let session_token = deps.gateway.exchange_code(code).await?;
        let account_login = deps.gateway.fetch_account_login(&session_token).await?;

        if !self.advance(attempt, &[AuthPhase::Exchanging], AuthPhase::Persisting, true) {
            tracing::info!("Sign-in reset during the code exchange, discarding its session");
            return Ok(None);
        }

        let creds = SessionCredentials {
            session_token,
            account_login,
        };
        let persisted: Result<(), AuthError> = async {
            save_session(deps.store.as_ref(), &creds).await?;
            deps.gateway
                .register_session(&creds.session_token, &creds.account_login)
                .await
        }
        .await;
        if let Err(error) = persisted {
            self.discard_session(&creds.session_token).await;
            return Err(error);
        }

        let result = AttemptResult::Authenticated(creds.clone());
        if !self.settle(attempt, AuthPhase::Persisting, AuthPhase::Authenticated, result) {
            tracing::info!("Sign-in reset while saving, removing its session");
            self.discard_session(&creds.session_token).await;
            return Ok(None);
        }
        Ok(Some(creds))
    }

    /// Remove both keys unless the stored token belongs to another session.
    async fn discard_session(&self, session_token: &str) {
        let store = self.inner.deps.store.as_ref();
        if let Ok(Some(stored)) = store.get(TOKEN_KEY).await {
            if stored != session_token {
                tracing::debug!("Stored session belongs to a newer sign-in, leaving it");
                return;
            }
        }
        if let Err(cleanup) = clear_session(store).await {
            tracing::warn!("Failed to roll back partial credentials: {}", cleanup);
        }
    }

    /// Surface `error` for `attempt` if it is still in one of `from`.
    /// Returns whether it was; a superseded attempt only reports telemetry.
    fn fail(&self, attempt: u64, from: &[AuthPhase], error: AuthError) -> bool {
        let deps = &self.inner.deps;
        if !self.advance(attempt, from, AuthPhase::Failed, true) {
            tracing::debug!("Error from a superseded sign-in attempt: {}", error);
            deps.telemetry.report(&error);
            return false;
        }

        deps.alerts.alert(error.kind(), error.user_message());
        deps.telemetry.report(&error);
        self.settle(
            attempt,
            AuthPhase::Failed,
            AuthPhase::Idle,
            AttemptResult::Failed(error.kind()),
        );
        true
    }

    /// Drop an unfinished attempt without alerting. Returns whether there
    /// was one to drop.
    pub fn abandon(&self) -> bool {
        let dropped = self
            .transition(|phase, _| phase.awaiting_code(), AuthPhase::Idle, false, true)
            .is_some();
        if dropped {
            tracing::info!("Sign-in attempt abandoned");
        }
        dropped
    }

    /// Sign out. Best-effort: always ends `Idle`, whatever fails on the way.
    ///
    /// An attempt still running is superseded: it can no longer reach
    /// `Authenticated` and removes anything it stores afterwards.
    pub async fn logout(&self) {
        let deps = &self.inner.deps;
        self.transition(|_, _| true, AuthPhase::Idle, false, true);

        match load_session(deps.store.as_ref()).await {
            Ok(Some(creds)) => {
                if let Err(e) = deps.gateway.sign_out(&creds.session_token).await {
                    tracing::warn!("Gateway sign-out failed: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read session before sign-out: {}", e),
        }

        if let Err(e) = clear_session(deps.store.as_ref()).await {
            tracing::warn!("Failed to remove stored credentials: {}", e);
            deps.telemetry.report(&e);
        }

        tracing::info!("Signed out");
    }

    /// Pick up a session persisted by an earlier run.
    pub async fn restore(&self) -> Option<SessionCredentials> {
        let creds = match load_session(self.inner.deps.store.as_ref()).await {
            Ok(creds) => creds?,
            Err(e) => {
                tracing::warn!("Could not read stored session: {}", e);
                self.inner.deps.telemetry.report(&e);
                return None;
            }
        };

        if self
            .transition(|phase, _| phase == AuthPhase::Idle, AuthPhase::Authenticated, false, false)
            .is_some()
        {
            tracing::info!("Restored session for {}", creds.account_login);
        }
        Some(creds)
    }
}
