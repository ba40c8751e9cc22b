//! Opening the provider's authorization page in an external browser.
//!
//! Two launchers are provided:
//! - [`LoopbackLauncher`] serves the redirect itself on `127.0.0.1`, so it
//!   sees both the callback URL and the user's dismissal.
//! - [`SystemBrowserLauncher`] hands the page to the browser and returns
//!   immediately; the redirect comes back through the deep-link router.

use crate::auth::error::AuthError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

/// How long a connected client gets to send its request line.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of showing the authorization page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The browsing context redirected to a URL under the callback prefix.
    Success { callback_url: String },
    /// The user dismissed the page. Only reported where dismissal is observable.
    Cancelled,
    /// The page was handed off; any redirect arrives as a deep link.
    Detached,
}

#[async_trait]
pub trait UserAgentLauncher: Send + Sync {
    async fn open_authorization_page(
        &self,
        authorize_url: &str,
        callback_prefix: &str,
    ) -> Result<LaunchOutcome, AuthError>;
}

/// Opens a URL in some browsing context.
pub type BrowserOpener = Arc<dyn Fn(&str) -> Result<(), AuthError> + Send + Sync>;

/// Opener backed by the platform's default browser.
pub fn system_browser() -> BrowserOpener {
    Arc::new(|url: &str| {
        #[cfg(feature = "browser")]
        {
            webbrowser::open(url).map_err(|e| AuthError::Launch(e.to_string()))
        }

        #[cfg(not(feature = "browser"))]
        {
            tracing::info!("Browser support disabled; open this URL manually: {}", url);
            Ok(())
        }
    })
}

// ============================================================================
// System browser, deep link callback
// ============================================================================

pub struct SystemBrowserLauncher {
    opener: BrowserOpener,
}

impl SystemBrowserLauncher {
    pub fn new() -> Self {
        Self::with_opener(system_browser())
    }

    pub fn with_opener(opener: BrowserOpener) -> Self {
        Self { opener }
    }
}

impl Default for SystemBrowserLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserAgentLauncher for SystemBrowserLauncher {
    async fn open_authorization_page(
        &self,
        authorize_url: &str,
        callback_prefix: &str,
    ) -> Result<LaunchOutcome, AuthError> {
        (self.opener)(authorize_url)?;
        tracing::info!(
            "Authorization page opened, waiting for deep link under {}",
            callback_prefix
        );
        Ok(LaunchOutcome::Detached)
    }
}

// ============================================================================
// Loopback redirect
// ============================================================================

/// Serves the OAuth redirect on the loopback address named by the callback
/// prefix (e.g. `http://127.0.0.1:8765/callback`).
pub struct LoopbackLauncher {
    opener: BrowserOpener,
}

impl LoopbackLauncher {
    pub fn new() -> Self {
        Self::with_opener(system_browser())
    }

    pub fn with_opener(opener: BrowserOpener) -> Self {
        Self { opener }
    }
}

impl Default for LoopbackLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserAgentLauncher for LoopbackLauncher {
    async fn open_authorization_page(
        &self,
        authorize_url: &str,
        callback_prefix: &str,
    ) -> Result<LaunchOutcome, AuthError> {
        let callback = Url::parse(callback_prefix)
            .map_err(|e| AuthError::Launch(format!("Invalid callback URL {callback_prefix}: {e}")))?;
        let host = callback
            .host_str()
            .ok_or_else(|| AuthError::Launch(format!("Callback URL has no host: {callback_prefix}")))?;
        let port = callback
            .port_or_known_default()
            .ok_or_else(|| AuthError::Launch(format!("Callback URL has no port: {callback_prefix}")))?;

        let listener = TcpListener::bind((host.trim_matches(|c| c == '[' || c == ']'), port))
            .await
            .map_err(|e| AuthError::Launch(format!("Failed to listen on {host}:{port}: {e}")))?;
        tracing::debug!("Callback listener bound on {}:{}", host, port);

        (self.opener)(authorize_url)?;

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| AuthError::Launch(format!("Callback listener failed: {e}")))?;
            match handle_connection(stream, &callback).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(e) => tracing::debug!("Ignoring bad callback request from {}: {}", peer, e),
            }
        }
    }
}

/// Answer one HTTP request. Returns an outcome once the callback path is hit.
async fn handle_connection(
    mut stream: TcpStream,
    callback: &Url,
) -> std::io::Result<Option<LaunchOutcome>> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
    let mut request_line = String::new();

    tokio::time::timeout(REQUEST_READ_TIMEOUT, reader.read_line(&mut request_line))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request line timed out"))??;

    // "GET /callback?code=... HTTP/1.1"
    let target = request_line.split_whitespace().nth(1).unwrap_or_default();
    let Ok(url) = callback.join(target) else {
        respond(&mut write_half, "400 Bad Request", "Malformed request.").await?;
        return Ok(None);
    };

    if url.path() != callback.path() {
        respond(&mut write_half, "404 Not Found", "Not found.").await?;
        return Ok(None);
    }

    let mut code = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if code.is_some() {
        respond(
            &mut write_half,
            "200 OK",
            "Signed in to GitHub. You can close this window and return to hubnotify.",
        )
        .await?;
        return Ok(Some(LaunchOutcome::Success {
            callback_url: url.to_string(),
        }));
    }

    if let Some(error) = error {
        if error != "access_denied" {
            tracing::warn!("Provider redirected with error: {}", error);
        }
        respond(&mut write_half, "200 OK", "Sign-in cancelled. You can close this window.").await?;
        return Ok(Some(LaunchOutcome::Cancelled));
    }

    respond(&mut write_half, "400 Bad Request", "Missing authorization code.").await?;
    Ok(None)
}

async fn respond<W>(writer: &mut W, status: &str, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!(
        "<!DOCTYPE html><html><head><title>hubnotify</title></head><body><p>{message}</p></body></html>"
    );
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Opener that plays the browser: visits each path in order.
    fn scripted_browser(port: u16, paths: &'static [&'static str]) -> (BrowserOpener, Arc<Mutex<Vec<String>>>) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let seen = opened.clone();
        let opener: BrowserOpener = Arc::new(move |url: &str| {
            seen.lock().unwrap().push(url.to_string());
            tokio::spawn(async move {
                let client = reqwest::Client::new();
                for path in paths {
                    let _ = client
                        .get(format!("http://127.0.0.1:{port}{path}"))
                        .send()
                        .await;
                }
            });
            Ok(())
        });
        (opener, opened)
    }

    #[tokio::test]
    async fn test_loopback_success_returns_callback_url() {
        let port = free_port();
        let (opener, opened) = scripted_browser(port, &["/favicon.ico", "/callback?code=abc123"]);
        let launcher = LoopbackLauncher::with_opener(opener);

        let outcome = launcher
            .open_authorization_page(
                "https://github.com/login/oauth/authorize?client_id=x",
                &format!("http://127.0.0.1:{port}/callback"),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LaunchOutcome::Success {
                callback_url: format!("http://127.0.0.1:{port}/callback?code=abc123")
            }
        );
        assert_eq!(opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loopback_access_denied_is_cancelled() {
        let port = free_port();
        let (opener, _) = scripted_browser(port, &["/callback?error=access_denied"]);
        let launcher = LoopbackLauncher::with_opener(opener);

        let outcome = launcher
            .open_authorization_page("https://github.com/", &format!("http://127.0.0.1:{port}/callback"))
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_opener_failure_is_launch_error() {
        let port = free_port();
        let launcher = LoopbackLauncher::with_opener(Arc::new(|_: &str| {
            Err(AuthError::Launch("no browser".to_string()))
        }));

        let err = launcher
            .open_authorization_page("https://github.com/", &format!("http://127.0.0.1:{port}/callback"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Launch(_)));
    }

    #[tokio::test]
    async fn test_system_browser_launcher_is_detached() {
        let launcher = SystemBrowserLauncher::with_opener(Arc::new(|_: &str| Ok(())));
        let outcome = launcher
            .open_authorization_page("https://github.com/", "hubnotify://auth")
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::Detached);
    }
}
