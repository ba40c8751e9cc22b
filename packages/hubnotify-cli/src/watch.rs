//! Watch mode: poll for unread notifications until interrupted.
//!
//! Each poll prints notifications not seen earlier in this run. The loop
//! stops on Ctrl+C, SIGTERM, or when GitHub rejects the stored session.

use anyhow::Result;
use hubnotify_core::api::{NotificationsClient, SessionRejected};
use hubnotify_core::{auth, config};
use std::collections::HashSet;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub async fn run_watch(interval_minutes: u64) -> Result<()> {
    let store = auth::default_store()?;

    let auth_status = auth::auth_status(store.as_ref()).await?;
    if !auth_status.authenticated {
        eprintln!("Error: Not signed in.");
        eprintln!("Run 'hubnotify login' first to authenticate.");
        std::process::exit(1);
    }

    let settings = config::load_settings();
    let client = NotificationsClient::from_settings(&settings)?;
    let interval_minutes = interval_minutes.max(1);

    tracing::info!(
        "Watching notifications for {} every {} minutes",
        auth_status.account_login.as_deref().unwrap_or("-"),
        interval_minutes
    );

    let mut seen = HashSet::new();
    let mut poll_interval = interval(Duration::from_secs(interval_minutes * 60));
    poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // The first tick completes immediately, so the initial poll runs right away.
            _ = poll_interval.tick() => {
                match poll(&client, store.as_ref(), &mut seen).await {
                    Ok(fresh) => tracing::debug!("Poll complete: {} new notifications", fresh),
                    Err(e) if e.downcast_ref::<SessionRejected>().is_some() => {
                        tracing::warn!("Session rejected, stopping watch");
                        eprintln!("{}. Run 'hubnotify logout' then 'hubnotify login'.", e);
                        break;
                    }
                    Err(e) => {
                        // Keep going; the next poll may succeed.
                        tracing::error!("Poll failed: {:#}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping watch");
                break;
            }
        }
    }

    tracing::info!("Watch stopped");
    Ok(())
}

/// Fetch unread notifications and print the ones not in `seen`.
async fn poll(
    client: &NotificationsClient,
    store: &dyn auth::CredentialStore,
    seen: &mut HashSet<String>,
) -> Result<usize> {
    let notifications = client.fetch_for_stored_session(store, false).await?;

    let mut fresh = 0;
    for notification in notifications.iter().filter(|n| n.unread) {
        if seen.insert(notification.id.clone()) {
            crate::print_notification(notification);
            fresh += 1;
        }
    }
    Ok(fresh)
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C");
    }
}
