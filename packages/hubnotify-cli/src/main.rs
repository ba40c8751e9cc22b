//! hubnotify CLI - GitHub notifications in the terminal
//!
//! This binary can:
//! - Sign in with GitHub through the browser (loopback or deep link callback)
//! - Show and clear the stored session
//! - Fetch notifications once, or watch for new ones

mod watch;

use anyhow::{bail, Result};
use hubnotify_core::api::{Notification, NotificationsClient, SessionRejected};
use hubnotify_core::auth::{self, AttemptResult, AuthMachine, CredentialStore};
use hubnotify_core::config::{self, Settings};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "hubnotify")]
#[command(author = "hubnotify contributors")]
#[command(version)]
#[command(about = "GitHub notifications from the terminal")]
#[command(long_about = "
hubnotify signs in to GitHub through your browser and reads your
notifications.

Quick start:
  1. Configure your OAuth app:  hubnotify config
  2. Sign in:                   hubnotify login
  3. Read notifications:        hubnotify notifications
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LauncherKind {
    /// Serve the redirect on the loopback callback URL
    Loopback,
    /// Open the default browser and accept the deep link on stdin
    System,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in with GitHub
    #[command(alias = "connect")]
    Login {
        /// How to receive the OAuth redirect (default: from the callback URL)
        #[arg(short, long)]
        launcher: Option<LauncherKind>,

        /// Give up waiting for the redirect after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show sign-in status
    Status,

    /// Sign out and remove stored credentials
    #[command(alias = "disconnect")]
    Logout,

    /// Fetch notifications
    Notifications {
        /// Include notifications already marked as read
        #[arg(short, long)]
        all: bool,
    },

    /// Poll for new unread notifications
    Watch {
        /// Poll interval in minutes
        #[arg(short, long, default_value = "5")]
        interval: u64,
    },

    /// Show configuration paths and settings
    Config,
}

/// Prints sign-in failures for the user.
struct CliAlerts;

impl auth::AlertSink for CliAlerts {
    fn alert(&self, kind: auth::ErrorKind, message: &str) {
        tracing::debug!("Alert raised for {} error", kind);
        eprintln!("Error: {}", message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hubnotify={},hubnotify_core={}", log_level, log_level).into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Login { launcher, timeout } => cmd_login(&cli, launcher, timeout).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Logout => cmd_logout(&cli).await,
        Commands::Notifications { all } => cmd_notifications(&cli, all).await,
        Commands::Watch { interval } => watch::run_watch(interval).await,
        Commands::Config => cmd_config(&cli).await,
    }
}

fn open_store() -> Result<Arc<dyn CredentialStore>> {
    Ok(Arc::from(auth::default_store()?))
}

fn build_machine(
    settings: &Settings,
    authorize_url: String,
    store: Arc<dyn CredentialStore>,
    launcher: Arc<dyn auth::UserAgentLauncher>,
) -> Result<AuthMachine> {
    Ok(AuthMachine::new(
        auth::HandshakeConfig {
            authorize_url,
            callback_prefix: settings.callback_url.value.clone(),
        },
        auth::Collaborators {
            store,
            gateway: Arc::new(auth::HttpIdentityGateway::from_settings(settings)?),
            launcher,
            alerts: Arc::new(CliAlerts),
            telemetry: Arc::new(auth::TracingReporter),
        },
    ))
}

async fn cmd_login(cli: &Cli, launcher: Option<LauncherKind>, timeout: Option<u64>) -> Result<()> {
    let store = open_store()?;

    // Check if already signed in
    if let Ok(status) = auth::auth_status(store.as_ref()).await {
        if status.authenticated {
            match cli.format {
                OutputFormat::Text => {
                    println!("Already signed in as {}", status.account_login.unwrap_or_default());
                    println!("Use 'hubnotify logout' to sign out first.");
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({
                        "status": "already_signed_in",
                        "account_login": status.account_login,
                    }));
                }
            }
            return Ok(());
        }
    }

    let settings = config::load_settings();
    let authorize_url = settings.authorize_url()?;
    let kind = launcher.unwrap_or(if settings.uses_loopback_callback() {
        LauncherKind::Loopback
    } else {
        LauncherKind::System
    });
    if kind == LauncherKind::Loopback && !settings.uses_loopback_callback() {
        bail!(
            "Callback URL {} is not a loopback address; use --launcher system",
            settings.callback_url.value
        );
    }

    let launcher: Arc<dyn auth::UserAgentLauncher> = match kind {
        LauncherKind::Loopback => Arc::new(auth::LoopbackLauncher::new()),
        LauncherKind::System => Arc::new(auth::SystemBrowserLauncher::new()),
    };
    let machine = build_machine(&settings, authorize_url.to_string(), store, launcher)?;

    // Inbound URLs for the lifetime of this command
    let router = Arc::new(auth::DeepLinkRouter::new());
    let listener = auth::spawn_callback_listener(&router, settings.callback_url.value.clone(), machine.clone());
    let paste_reader = (kind == LauncherKind::System).then(|| spawn_paste_reader(router.clone()));

    match cli.format {
        OutputFormat::Text => {
            println!("Opening GitHub in your browser. If it does not open, visit:\n\n{}\n", authorize_url);
            if kind == LauncherKind::System {
                println!("After approving, paste the {} URL here if the app does not pick it up.", settings.callback_url.value);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "awaiting_authorization",
                "authorize_url": authorize_url.as_str(),
                "callback_url": settings.callback_url.value,
            }));
        }
    }

    // Timeout and Ctrl+C apply while the browser is still open, too.
    let stop = async {
        let limit = async {
            match timeout {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = limit => eprintln!("Timed out waiting for GitHub to redirect back."),
            _ = tokio::signal::ctrl_c() => eprintln!("Sign-in interrupted."),
        }
    };
    let result = machine.login_until(stop).await;

    // The attempt is settled; nothing is left for the listener to deliver.
    listener.abort();
    drop(paste_reader);

    match (result, cli.format) {
        (AttemptResult::Authenticated(creds), OutputFormat::Text) => {
            println!("Signed in as {}", creds.account_login);
            println!();
            println!("Read your notifications with: hubnotify notifications");
            Ok(())
        }
        (AttemptResult::Authenticated(creds), OutputFormat::Json) => {
            println!("{}", serde_json::json!({
                "status": "signed_in",
                "account_login": creds.account_login,
            }));
            Ok(())
        }
        (AttemptResult::Cancelled, OutputFormat::Text) => {
            println!("Sign-in cancelled.");
            Ok(())
        }
        (AttemptResult::Cancelled, OutputFormat::Json) => {
            println!("{}", serde_json::json!({ "status": "cancelled" }));
            Ok(())
        }
        // The alert has already been shown.
        (AttemptResult::Failed(kind), _) => bail!("Sign-in failed ({})", kind),
        (AttemptResult::Superseded, _) => bail!("Sign-in was reset before it completed"),
        (other, _) => bail!("Sign-in did not complete: {:?}", other),
    }
}

/// Feed pasted callback URLs into the router, one per line.
///
/// A plain thread rather than `tokio::io::stdin`, whose blocking read would
/// hold up runtime shutdown until the user presses enter.
fn spawn_paste_reader(router: Arc<auth::DeepLinkRouter>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if !line.trim().is_empty() && router.dispatch(&line) == 0 {
                eprintln!("That URL does not match the configured callback.");
            }
        }
    })
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let store = open_store()?;
    let auth_status = auth::auth_status(store.as_ref()).await?;

    match cli.format {
        OutputFormat::Text => {
            if auth_status.authenticated {
                println!("Status:  Signed in");
                println!("Account: {}", auth_status.account_login.unwrap_or_else(|| "-".to_string()));
                println!();
                println!("Storage: {}", auth::get_credential_storage_info());
            } else {
                println!("Status: Not signed in");
                println!();
                println!("Run 'hubnotify login' to authenticate.");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "authenticated": auth_status.authenticated,
                "account_login": auth_status.account_login,
                "storage_info": auth::get_credential_storage_info(),
            }));
        }
    }

    Ok(())
}

async fn cmd_logout(cli: &Cli) -> Result<()> {
    let store = open_store()?;
    let auth_status = auth::auth_status(store.as_ref()).await.ok();

    let settings = config::load_settings();
    // Logout never opens the authorization page, so a missing client id is fine here.
    let authorize_url = settings
        .authorize_url()
        .map(|u| u.to_string())
        .unwrap_or_default();
    let machine = build_machine(
        &settings,
        authorize_url,
        store,
        Arc::new(auth::SystemBrowserLauncher::new()),
    )?;
    machine.logout().await;

    let account_login = auth_status.and_then(|s| s.account_login);
    match cli.format {
        OutputFormat::Text => match &account_login {
            Some(login) => println!("Signed out {}", login),
            None => println!("Not signed in. Stored credentials cleared."),
        },
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "signed_out",
                "account_login": account_login,
            }));
        }
    }

    Ok(())
}

async fn cmd_notifications(cli: &Cli, all: bool) -> Result<()> {
    let store = open_store()?;
    let settings = config::load_settings();
    let client = NotificationsClient::from_settings(&settings)?;

    let notifications = match client.fetch_for_stored_session(store.as_ref(), all).await {
        Ok(n) => n,
        Err(e) if e.downcast_ref::<SessionRejected>().is_some() => {
            bail!("{}. Run 'hubnotify logout' then 'hubnotify login'.", e)
        }
        Err(e) => return Err(e),
    };

    match cli.format {
        OutputFormat::Text => {
            if notifications.is_empty() {
                println!("No notifications.");
            }
            for notification in &notifications {
                print_notification(notification);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&notifications)?);
        }
    }

    Ok(())
}

pub(crate) fn print_notification(notification: &Notification) {
    let marker = if notification.unread { "*" } else { " " };
    let updated = notification
        .updated_at
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M");
    println!(
        "{} {:30} {}  ({}, {})  {}",
        marker,
        notification.repository.full_name,
        notification.subject.title,
        notification.subject.kind,
        notification.reason,
        updated
    );
}

async fn cmd_config(cli: &Cli) -> Result<()> {
    let settings = config::load_settings();
    let config_path = config::get_config_file_path_string();
    let client_id = settings
        .client_id
        .as_ref()
        .map(|c| format!("{} (from {})", c.value, c.source))
        .unwrap_or_else(|| "<not set>".to_string());

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("Client id:        {}", client_id);
            println!("Scope:            {} (from {})", settings.scope.value, settings.scope.source);
            println!("Callback URL:     {} (from {})", settings.callback_url.value, settings.callback_url.source);
            println!("Provider:         {} (from {})", settings.provider_url.value, settings.provider_url.source);
            println!("Identity gateway: {} (from {})", settings.gateway_url.value, settings.gateway_url.source);
            println!("API endpoint:     {} (from {})", settings.api_url.value, settings.api_url.source);
            println!("Credential store: {}", auth::get_credential_storage_info());
            println!();
            println!("Environment variables:");
            println!("  HUBNOTIFY_CLIENT_ID, HUBNOTIFY_SCOPE, HUBNOTIFY_CALLBACK_URL");
            println!("  HUBNOTIFY_PROVIDER_URL, HUBNOTIFY_GATEWAY_URL, HUBNOTIFY_API_URL");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "client_id": settings.client_id.as_ref().map(|c| c.value.clone()),
                "scope": settings.scope.value,
                "callback_url": settings.callback_url.value,
                "provider_url": settings.provider_url.value,
                "gateway_url": settings.gateway_url.value,
                "gateway_source": format!("{}", settings.gateway_url.source),
                "api_url": settings.api_url.value,
                "api_source": format!("{}", settings.api_url.source),
                "credential_storage": auth::get_credential_storage_info(),
            }));
        }
    }

    Ok(())
}
