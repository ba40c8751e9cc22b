//! Inbound URL routing.
//!
//! The application owns one [`DeepLinkRouter`] for its whole lifetime.
//! Features subscribe with the URL prefix they care about; the platform glue
//! (URL-scheme handler, pasted input, a second process instance) calls
//! [`DeepLinkRouter::dispatch`] for every URL it receives.

use crate::auth::machine::AuthMachine;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct DeepLinkRouter {
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Receiving end of one subscription. Yields `None` once the router is gone.
pub struct DeepLinkSubscription {
    prefix: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl DeepLinkSubscription {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl DeepLinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in URLs under `prefix`.
    pub fn subscribe(&self, prefix: impl Into<String>) -> DeepLinkSubscription {
        let prefix = prefix.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Subscriber {
            prefix: prefix.clone(),
            tx,
        });
        tracing::debug!("Deep link subscriber registered for {}", prefix);
        DeepLinkSubscription { prefix, rx }
    }

    /// Deliver `url` to every subscriber whose prefix matches.
    ///
    /// Returns how many subscribers received it. Subscribers whose receiving
    /// end was dropped are removed.
    pub fn dispatch(&self, url: &str) -> usize {
        let url = url.trim();
        let mut delivered = 0;
        self.lock().retain(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if matches_prefix(url, &sub.prefix) && sub.tx.send(url.to_string()).is_ok() {
                delivered += 1;
            }
            true
        });

        if delivered == 0 {
            tracing::debug!("No deep link subscriber for inbound URL");
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `hubnotify://auth` matches `hubnotify://auth?code=1` and
/// `hubnotify://auth/done`, but not `hubnotify://authority`.
fn matches_prefix(url: &str, prefix: &str) -> bool {
    match url.strip_prefix(prefix) {
        Some(rest) => {
            rest.is_empty()
                || prefix.ends_with(['/', '?'])
                || rest.starts_with(['?', '/', '#'])
        }
        None => false,
    }
}

/// Pull a non-empty `code` query parameter out of a callback URL.
pub fn extract_code(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
}

/// Forward authorization codes arriving under `prefix` into `machine`.
///
/// Runs until the router is dropped. URLs without a `code` are skipped: the
/// channel is shared and not every inbound URL belongs to sign-in.
pub fn spawn_callback_listener(
    router: &DeepLinkRouter,
    prefix: impl Into<String>,
    machine: AuthMachine,
) -> JoinHandle<()> {
    let mut subscription = router.subscribe(prefix);

    tokio::spawn(async move {
        while let Some(url) = subscription.recv().await {
            match extract_code(&url) {
                Some(code) => {
                    tracing::debug!("Authorization code received through deep link");
                    machine.resume(&code).await;
                }
                None => tracing::debug!("Deep link without authorization code ignored"),
            }
        }
        tracing::debug!("Deep link listener for {} stopped", subscription.prefix());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_code() {
        assert_eq!(extract_code("app://auth?code=abc123").as_deref(), Some("abc123"));
        assert_eq!(
            extract_code("http://127.0.0.1:8765/callback?state=x&code=a%2Fb").as_deref(),
            Some("a/b")
        );
        assert_eq!(extract_code("app://auth?code="), None);
        assert_eq!(extract_code("app://auth?error=access_denied"), None);
        assert_eq!(extract_code("not a url"), None);
    }

    #[test]
    fn test_prefix_matching() {
        assert!(matches_prefix("hubnotify://auth?code=1", "hubnotify://auth"));
        assert!(matches_prefix("hubnotify://auth", "hubnotify://auth"));
        assert!(matches_prefix("hubnotify://auth/done", "hubnotify://auth"));
        assert!(!matches_prefix("hubnotify://authority?code=1", "hubnotify://auth"));
        assert!(!matches_prefix("other://auth?code=1", "hubnotify://auth"));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_matching_subscribers() {
        let router = DeepLinkRouter::new();
        let mut auth = router.subscribe("hubnotify://auth");
        let mut share = router.subscribe("hubnotify://share");

        assert_eq!(router.dispatch("hubnotify://auth?code=abc"), 1);
        assert_eq!(router.dispatch("hubnotify://share?repo=x"), 1);
        assert_eq!(router.dispatch("https://example.com"), 0);

        assert_eq!(auth.recv().await.as_deref(), Some("hubnotify://auth?code=abc"));
        assert_eq!(share.recv().await.as_deref(), Some("hubnotify://share?repo=x"));
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let router = DeepLinkRouter::new();
        let first = router.subscribe("hubnotify://auth");
        let _second = router.subscribe("hubnotify://auth");
        drop(first);

        assert_eq!(router.dispatch("hubnotify://auth?code=abc"), 1);
        assert_eq!(router.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_ends_with_router() {
        let router = DeepLinkRouter::new();
        let mut sub = router.subscribe("hubnotify://auth");
        router.dispatch("hubnotify://auth?code=abc");
        drop(router);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
