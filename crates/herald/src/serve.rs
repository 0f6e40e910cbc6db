// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `herald serve` command implementation.
//!
//! Builds the session registry over the subprocess bridge and the webhook
//! sender, restores persisted sessions, runs the expiry and orphan sweeps in
//! the background, and drains every session on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use herald_config::model::HeraldConfig;
use herald_core::{EngineFactory, HeraldError, StatusEvent};
use herald_session::shutdown;
use herald_session::{DiskIdentityStore, SessionRegistry};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeEngineFactory;
use crate::webhook;

/// Upper bound on the shutdown drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the `herald serve` command until a shutdown signal arrives.
pub async fn run_serve(config: HeraldConfig) -> Result<(), HeraldError> {
    init_tracing(&config.service.log_level);

    info!(
        name = %config.service.name,
        auth_dir = %config.service.auth_dir.display(),
        max_sessions = config.service.max_sessions,
        "starting herald"
    );
    if config.engine.bridge.command.is_none() {
        warn!("engine.bridge.command is not set, sessions cannot bind an engine");
    }

    let sender = webhook::sender_from_config(&config.webhook)?;
    let identities = DiskIdentityStore::new(&config.service.auth_dir);
    let factory: Arc<dyn EngineFactory> = Arc::new(BridgeEngineFactory::new(
        config.engine.bridge.clone(),
        identities.clone(),
    ));
    let registry = Arc::new(SessionRegistry::new(&config, factory, sender));

    let cancel = shutdown::install_signal_handler();

    tokio::spawn(log_status_updates(
        registry.fanout().subscribe(),
        cancel.clone(),
    ));

    if config.restore.enabled {
        let registry = Arc::clone(&registry);
        let wait_timeout = Duration::from_secs(config.restore.wait_timeout_secs);
        let restore_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = registry.restore_all(&identities, wait_timeout) => match result {
                    Ok(summary) => info!(
                        total = summary.total(),
                        succeeded = summary.succeeded.len(),
                        failed = summary.failed.len(),
                        "boot restore finished"
                    ),
                    Err(e) => error!(error = %e, "boot restore could not list sessions"),
                },
                _ = restore_cancel.cancelled() => {
                    info!("boot restore interrupted by shutdown");
                }
            }
        });
    } else {
        info!("boot restore disabled");
    }

    if config.sweeper.enabled {
        tokio::spawn(expiry_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(config.sweeper.interval_secs),
            cancel.clone(),
        ));
        info!(interval_secs = config.sweeper.interval_secs, "expiry sweeper started");
    } else {
        info!("expiry sweeper disabled");
    }

    tokio::spawn(orphan_sweeper(
        Arc::clone(&registry),
        Duration::from_secs(config.restore.orphan_sweep_interval_secs),
        Duration::from_secs(config.restore.orphan_max_age_secs),
        cancel.clone(),
    ));

    cancel.cancelled().await;

    match shutdown::drain_sessions(&registry, DRAIN_TIMEOUT).await {
        Some(count) => info!(count, "herald serve shutdown complete"),
        None => warn!("herald serve shutdown timed out, some sessions were not released"),
    }
    Ok(())
}

/// Periodically tears down expired sessions.
async fn expiry_sweeper(
    registry: Arc<SessionRegistry>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = registry.cleanup_expired(false).await;
                if report.expired.is_empty() && report.errors.is_empty() {
                    debug!(inactive = report.inactive.len(), "expiry sweep found nothing to clean");
                } else {
                    info!(
                        expired = report.expired.len(),
                        cleaned = report.cleaned.len(),
                        inactive = report.inactive.len(),
                        errors = report.errors.len(),
                        "expiry sweep complete"
                    );
                }
            }
            _ = cancel.cancelled() => {
                info!("expiry sweeper shutting down");
                break;
            }
        }
    }
}

/// Periodically rejects restoration handles older than `max_age`.
async fn orphan_sweeper(
    registry: Arc<SessionRegistry>,
    every: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                registry.sweep_orphans(max_age);
            }
            _ = cancel.cancelled() => {
                debug!("orphan sweeper shutting down");
                break;
            }
        }
    }
}

/// Mirrors the status fanout into the log.
async fn log_status_updates(
    mut rx: broadcast::Receiver<herald_core::StatusUpdate>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(update) => match &update.event {
                    StatusEvent::QrReady { .. } => {
                        info!(session_id = %update.session_id, "scan the QR code to pair this session");
                    }
                    event => {
                        info!(session_id = %update.session_id, event = event.name(), "session status");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
}

/// Initializes the tracing subscriber with the given log level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("herald={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_test_utils::{MockEngineFactory, MockSender};

    fn registry(config: &HeraldConfig) -> (Arc<SessionRegistry>, Arc<MockEngineFactory>) {
        let factory = Arc::new(MockEngineFactory::new());
        let engines: Arc<dyn EngineFactory> = factory.clone();
        let sender: Arc<dyn herald_core::DownstreamSender> = Arc::new(MockSender::new());
        (Arc::new(SessionRegistry::new(config, engines, sender)), factory)
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweeper_removes_idle_sessions_and_stops_on_cancel() {
        let mut config = HeraldConfig::default();
        config.sweeper.inactive_after_secs = 60;
        let (registry, factory) = registry(&config);

        registry
            .create("s1", herald_session::CreateOptions::default())
            .await
            .unwrap();
        // A permanent disconnect releases the engine, so the session expires once idle.
        factory.wait_for_engines("s1", 1).await.disconnect("LOGOUT");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(expiry_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(120),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(250)).await;
        assert!(!registry.contains("s1"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn orphan_sweeper_stops_on_cancel() {
        let (registry, _factory) = registry(&HeraldConfig::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(orphan_sweeper(
            registry,
            Duration::from_secs(60),
            Duration::from_secs(300),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
