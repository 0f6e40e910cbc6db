// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion handles for sessions restored from disk.
//!
//! A handle exists from the moment a restore is requested until the session's
//! first `ready`, failure, or orphan expiry. Waiters observe the outcome
//! through a `watch` channel, so a waiter that times out leaves the
//! restoration itself untouched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use herald_core::{HeraldError, SessionId, SessionState};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Successful restoration result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreSuccess {
    pub session_id: SessionId,
    pub state: SessionState,
    pub ready_at: DateTime<Utc>,
}

type Outcome = Option<Result<RestoreSuccess, String>>;

struct Handle {
    created_at: Instant,
    tx: watch::Sender<Outcome>,
}

/// Observer of a single restoration handle.
#[derive(Debug, Clone)]
pub struct RestorationWaiter {
    session_id: SessionId,
    rx: watch::Receiver<Outcome>,
}

impl RestorationWaiter {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Waits for the handle to settle, giving up after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<RestoreSuccess, HeraldError> {
        let settled = tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some))
            .await
            .map_err(|_| HeraldError::Timeout { duration: timeout })?;

        let outcome = match settled {
            Ok(value) => (*value).clone(),
            // Sender dropped without an outcome.
            Err(_) => None,
        };

        match outcome {
            Some(Ok(success)) => Ok(success),
            Some(Err(reason)) => Err(HeraldError::Restoration {
                session_id: self.session_id.to_string(),
                reason,
            }),
            None => Err(HeraldError::Restoration {
                session_id: self.session_id.to_string(),
                reason: "restoration handle dropped".to_string(),
            }),
        }
    }
}

/// One pending restoration handle per session id.
#[derive(Default)]
pub struct RestorationRegistry {
    handles: DashMap<SessionId, Handle>,
}

impl RestorationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the handle for `id`, or joins the live one.
    pub fn begin(&self, id: &SessionId) -> RestorationWaiter {
        let entry = self.handles.entry(id.clone()).or_insert_with(|| {
            debug!(session_id = %id, "restoration handle created");
            let (tx, _rx) = watch::channel(None);
            Handle {
                created_at: Instant::now(),
                tx,
            }
        });
        RestorationWaiter {
            session_id: id.clone(),
            rx: entry.tx.subscribe(),
        }
    }

    /// A waiter on the live handle for `id`, if any.
    pub fn waiter(&self, id: &str) -> Option<RestorationWaiter> {
        self.handles.get(id).map(|handle| RestorationWaiter {
            session_id: handle.key().clone(),
            rx: handle.tx.subscribe(),
        })
    }

    pub fn is_restoring(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Settles and removes the handle with a success. Returns false when none was live.
    pub fn resolve(&self, success: RestoreSuccess) -> bool {
        match self.handles.remove(success.session_id.as_str()) {
            Some((id, handle)) => {
                info!(session_id = %id, "restoration resolved");
                handle.tx.send_replace(Some(Ok(success)));
                true
            }
            None => false,
        }
    }

    /// Settles and removes the handle with a failure. Returns false when none was live.
    pub fn reject(&self, id: &str, reason: impl Into<String>) -> bool {
        match self.handles.remove(id) {
            Some((id, handle)) => {
                let reason = reason.into();
                info!(session_id = %id, reason = %reason, "restoration rejected");
                handle.tx.send_replace(Some(Err(reason)));
                true
            }
            None => false,
        }
    }

    /// Rejects and removes every handle older than `max_age`.
    pub fn sweep_orphans(&self, max_age: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .handles
            .iter()
            .filter(|entry| entry.created_at.elapsed() >= max_age)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            self.reject(id.as_str(), format!("restoration orphaned after {max_age:?}"));
        }
        expired
    }

    /// Rejects every live handle.
    pub fn reject_all(&self, reason: &str) -> usize {
        let ids: Vec<SessionId> = self.handles.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.reject(id.as_str(), reason))
            .count()
    }
}
