// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Graceful shutdown coordination with signal handling.
//!
//! Installs handlers for SIGTERM and SIGINT (Ctrl+C), triggering a
//! [`CancellationToken`] that the service loop monitors. Sessions are then
//! drained through [`drain_sessions`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;

/// Installs signal handlers for SIGTERM and SIGINT.
///
/// Returns a [`CancellationToken`] that is cancelled when either signal is received.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            info!("received SIGINT (Ctrl+C), initiating shutdown");
                        }
                        _ = sigterm.recv() => {
                            info!("received SIGTERM, initiating shutdown");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler, only Ctrl+C will stop the service");
                    let _ = ctrl_c.await;
                    info!("received SIGINT (Ctrl+C), initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl+C, initiating shutdown");
        }

        token_clone.cancel();
        debug!("shutdown signal handler completed");
    });

    token
}

/// Destroys every session, waiting up to `timeout` for forced flushes and engine release.
///
/// Returns the number of sessions torn down, or `None` if the timeout elapsed first.
pub async fn drain_sessions(registry: &SessionRegistry, timeout: Duration) -> Option<usize> {
    if registry.is_empty() {
        info!("no active sessions to drain");
        let _ = registry.restorations().reject_all("service shutting down");
        return Some(0);
    }

    info!(count = registry.len(), "draining sessions");
    match tokio::time::timeout(timeout, registry.shutdown()).await {
        Ok(reports) => {
            let released: usize = reports.iter().map(|(_, r)| r.released).sum();
            if released > 0 {
                warn!(released, "undelivered messages released at shutdown");
            }
            info!(count = reports.len(), "all sessions drained");
            Some(reports.len())
        }
        Err(_) => {
            warn!(
                remaining = registry.len(),
                "drain timeout reached, some sessions interrupted"
            );
            None
        }
    }
}
