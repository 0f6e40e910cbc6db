// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The map of live sessions and every operation exposed to adapters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use herald_config::HeraldConfig;
use herald_core::{
    ChatSummary, DownstreamSender, EngineFactory, HeraldError, SessionId, SessionIdentityStore,
    SessionState,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::fanout::StatusFanout;
use crate::filter::MessageFilter;
use crate::pipeline::{DeliverySettings, FlushReport};
use crate::reconnect::ReconnectPolicy;
use crate::restoration::{RestorationRegistry, RestorationWaiter, RestoreSuccess};
use crate::session::{
    ListenOutcome, ReconnectOutcome, Session, SessionContext, SessionInfo, SessionTable,
    StopOutcome, TeardownReport,
};

/// Options for [`SessionRegistry::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Caller tag checked against `max_sessions_per_owner`.
    pub owner: Option<String>,
    /// Restore from persisted credentials; allocates a restoration handle.
    pub from_disk: bool,
}

impl CreateOptions {
    pub fn restore() -> Self {
        Self {
            owner: None,
            from_disk: true,
        }
    }

    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            from_disk: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStatus {
    Initializing,
    AlreadyExists,
}

/// Result of [`SessionRegistry::create`].
#[derive(Debug)]
pub struct CreateOutcome {
    pub status: CreateStatus,
    pub session_id: SessionId,
    /// Present for `from_disk` creations while the restore is pending.
    pub restoration: Option<RestorationWaiter>,
}

/// Thresholds applied by [`SessionRegistry::cleanup_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub inactive_after: Duration,
    pub max_session_age: Option<Duration>,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            inactive_after: Duration::from_secs(3600),
            max_session_age: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    Forced,
    InactiveWithoutEngine,
    MaxAgeExceeded,
    AttemptsExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiredSession {
    pub session_id: SessionId,
    pub reason: ExpiryReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepError {
    pub session_id: SessionId,
    pub error: String,
}

/// Structured result of an expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions that met an expiry criterion.
    pub expired: Vec<ExpiredSession>,
    /// Sessions idle past the threshold that still hold an engine.
    pub inactive: Vec<SessionId>,
    /// Sessions actually torn down.
    pub cleaned: Vec<SessionId>,
    pub errors: Vec<SweepError>,
}

/// Aggregate counters plus per-session detail, most recently active first.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub connected: usize,
    pub listening: usize,
    pub restoring: usize,
    pub inactive: usize,
    pub with_errors: usize,
    pub problematic: usize,
    pub pending_messages: usize,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreFailure {
    pub session_id: SessionId,
    pub reason: String,
}

/// Result of a bulk boot restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreSummary {
    pub succeeded: Vec<RestoreSuccess>,
    pub failed: Vec<RestoreFailure>,
}

impl RestoreSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Owns every live [`Session`]. All mutation goes through these methods.
pub struct SessionRegistry {
    sessions: Arc<SessionTable>,
    ctx: Arc<SessionContext>,
    max_sessions: usize,
    max_sessions_per_owner: Option<usize>,
    sweep: SweepSettings,
    /// Serializes the quota check with the insert.
    admission: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(
        config: &HeraldConfig,
        factory: Arc<dyn EngineFactory>,
        sender: Arc<dyn DownstreamSender>,
    ) -> Self {
        Self::with_fanout(config, factory, sender, Arc::new(StatusFanout::default()))
    }

    pub fn with_fanout(
        config: &HeraldConfig,
        factory: Arc<dyn EngineFactory>,
        sender: Arc<dyn DownstreamSender>,
        fanout: Arc<StatusFanout>,
    ) -> Self {
        let ctx = SessionContext {
            factory,
            sender,
            fanout,
            restorations: Arc::new(RestorationRegistry::new()),
            policy: ReconnectPolicy::from_config(&config.reconnect),
            filter: MessageFilter::from_config(&config.filters),
            delivery: DeliverySettings::from_config(&config.delivery),
            enrichment: config.enrichment.clone(),
            init_timeout: config.engine.init_timeout(),
        };
        Self {
            sessions: Arc::new(DashMap::new()),
            ctx: Arc::new(ctx),
            max_sessions: config.service.max_sessions,
            max_sessions_per_owner: config.service.max_sessions_per_owner,
            sweep: SweepSettings {
                inactive_after: Duration::from_secs(config.sweeper.inactive_after_secs),
                max_session_age: config.sweeper.max_session_age_secs.map(Duration::from_secs),
            },
            admission: Mutex::new(()),
        }
    }

    pub fn fanout(&self) -> &Arc<StatusFanout> {
        &self.ctx.fanout
    }

    pub fn restorations(&self) -> &RestorationRegistry {
        &self.ctx.restorations
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    fn get(&self, id: &str) -> Result<Arc<Session>, HeraldError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HeraldError::SessionNotFound(id.to_string()))
    }

    /// Snapshot of the current sessions; the map is never iterated while awaiting.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Validates the id and quotas, registers the session, and binds its engine.
    ///
    /// Returns once the engine has been initialized; authentication and
    /// readiness arrive later as status events. Bind failures tear the
    /// session down and are returned as `EngineBindError`/`EngineBindTimeout`.
    pub async fn create(
        &self,
        raw_id: &str,
        options: CreateOptions,
    ) -> Result<CreateOutcome, HeraldError> {
        let id = SessionId::parse(raw_id)?;

        let (session, restoration) = {
            let _admission = self.admission.lock().await;

            if let Some(existing) = self.sessions.get(id.as_str()) {
                debug!(session_id = %id, "session already exists");
                return Ok(CreateOutcome {
                    status: CreateStatus::AlreadyExists,
                    session_id: existing.id().clone(),
                    restoration: self.ctx.restorations.waiter(id.as_str()),
                });
            }
            self.check_quota(options.owner.as_deref())?;

            // The handle must exist before the bind starts.
            let restoration = options
                .from_disk
                .then(|| self.ctx.restorations.begin(&id));

            let session = Session::new(
                id.clone(),
                options.owner.clone(),
                options.from_disk,
                Arc::clone(&self.ctx),
                Arc::downgrade(&self.sessions),
            );
            self.sessions.insert(id.clone(), Arc::clone(&session));
            (session, restoration)
        };

        info!(
            session_id = %id,
            owner = options.owner.as_deref().unwrap_or("-"),
            from_disk = options.from_disk,
            "session created"
        );
        session.start().await?;

        Ok(CreateOutcome {
            status: CreateStatus::Initializing,
            session_id: id,
            restoration,
        })
    }

    fn check_quota(&self, owner: Option<&str>) -> Result<(), HeraldError> {
        if self.sessions.len() >= self.max_sessions {
            warn!(limit = self.max_sessions, "global session quota reached");
            return Err(HeraldError::QuotaExceeded {
                scope: "global".to_string(),
                limit: self.max_sessions,
            });
        }
        if let (Some(owner), Some(limit)) = (owner, self.max_sessions_per_owner) {
            let owned = self
                .sessions
                .iter()
                .filter(|entry| entry.value().owner() == Some(owner))
                .count();
            if owned >= limit {
                warn!(owner, limit, "owner session quota reached");
                return Err(HeraldError::QuotaExceeded {
                    scope: format!("owner {owner}"),
                    limit,
                });
            }
        }
        Ok(())
    }

    pub async fn start_listening(&self, id: &str) -> Result<ListenOutcome, HeraldError> {
        self.get(id)?.start_listening().await
    }

    pub async fn stop_listening(&self, id: &str) -> Result<StopOutcome, HeraldError> {
        self.get(id)?.stop_listening().await
    }

    pub async fn set_chat_listening(
        &self,
        id: &str,
        chat_id: &str,
        listen: bool,
    ) -> Result<(), HeraldError> {
        self.get(id)?.set_chat_listening(chat_id, listen).await
    }

    pub async fn info(&self, id: &str) -> Result<SessionInfo, HeraldError> {
        Ok(self.get(id)?.info().await)
    }

    /// Every live session, sorted by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = join_all(self.snapshot().iter().map(|s| s.info())).await;
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn destroy(&self, id: &str) -> Result<TeardownReport, HeraldError> {
        self.get(id)?.destroy().await
    }

    pub async fn reconnect(&self, id: &str) -> Result<ReconnectOutcome, HeraldError> {
        self.get(id)?.reconnect().await
    }

    /// Forces every chat buffer of the session out, awaiting each send.
    pub async fn flush_session(&self, id: &str) -> Result<FlushReport, HeraldError> {
        self.get(id)?.flush().await
    }

    pub async fn list_chats(&self, id: &str) -> Result<Vec<ChatSummary>, HeraldError> {
        self.get(id)?.chats().await
    }

    /// Waits for the session's restoration handle to settle.
    ///
    /// A session that is already connected with no live handle resolves
    /// immediately. Timing out leaves the restoration running.
    pub async fn await_restoration(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<RestoreSuccess, HeraldError> {
        if let Some(waiter) = self.ctx.restorations.waiter(id) {
            return waiter.wait(timeout).await;
        }
        let info = self.info(id).await?;
        match (info.state.is_connected(), info.ready_at) {
            (true, Some(ready_at)) => Ok(RestoreSuccess {
                session_id: info.id,
                state: info.state,
                ready_at,
            }),
            _ => Err(HeraldError::Restoration {
                session_id: id.to_string(),
                reason: format!("no restoration pending (state {})", info.state),
            }),
        }
    }

    pub fn sweep_orphans(&self, max_age: Duration) -> Vec<SessionId> {
        let swept = self.ctx.restorations.sweep_orphans(max_age);
        if !swept.is_empty() {
            info!(count = swept.len(), "orphaned restorations rejected");
        }
        swept
    }

    /// Creates every persisted session concurrently and waits for all of them.
    ///
    /// One failure never aborts the batch.
    pub async fn restore_all(
        &self,
        store: &dyn SessionIdentityStore,
        wait_timeout: Duration,
    ) -> Result<RestoreSummary, HeraldError> {
        let ids = store.list().await?;
        info!(count = ids.len(), "restoring persisted sessions");

        let results = join_all(ids.iter().map(|id| async move {
            (id.clone(), self.restore_one(id, wait_timeout).await)
        }))
        .await;

        let mut summary = RestoreSummary::default();
        for (session_id, outcome) in results {
            match outcome {
                Ok(success) => summary.succeeded.push(success),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "session restore failed");
                    summary.failed.push(RestoreFailure {
                        session_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "restore complete"
        );
        Ok(summary)
    }

    async fn restore_one(
        &self,
        id: &SessionId,
        wait_timeout: Duration,
    ) -> Result<RestoreSuccess, HeraldError> {
        let created = self.create(id.as_str(), CreateOptions::restore()).await?;
        match created.restoration {
            Some(waiter) => waiter.wait(wait_timeout).await,
            None => self.await_restoration(id.as_str(), wait_timeout).await,
        }
    }

    fn expiry_reason(&self, info: &SessionInfo, force: bool) -> Option<ExpiryReason> {
        if force {
            return Some(ExpiryReason::Forced);
        }
        if !info.has_engine && info.idle_for >= self.sweep.inactive_after {
            return Some(ExpiryReason::InactiveWithoutEngine);
        }
        if self.sweep.max_session_age.is_some_and(|max| info.age >= max) {
            return Some(ExpiryReason::MaxAgeExceeded);
        }
        if self.ctx.policy.is_exhausted(info.reconnection_attempts) {
            return Some(ExpiryReason::AttemptsExhausted);
        }
        None
    }

    /// Tears down every session meeting an expiry criterion, or all of them when `force`.
    pub async fn cleanup_expired(&self, force: bool) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.snapshot() {
            let info = session.info().await;
            let Some(reason) = self.expiry_reason(&info, force) else {
                if info.idle_for >= self.sweep.inactive_after {
                    report.inactive.push(info.id);
                }
                continue;
            };

            debug!(session_id = %info.id, reason = ?reason, "session expired");
            report.expired.push(ExpiredSession {
                session_id: info.id.clone(),
                reason,
            });
            match session.destroy().await {
                Ok(teardown) => {
                    if let Some(engine_error) = teardown.engine_error {
                        report.errors.push(SweepError {
                            session_id: info.id.clone(),
                            error: engine_error,
                        });
                    }
                    report.cleaned.push(info.id);
                }
                // Destroyed concurrently.
                Err(HeraldError::SessionNotFound(_)) => {}
                Err(e) => {
                    error!(session_id = %info.id, error = %e, "session cleanup failed");
                    report.errors.push(SweepError {
                        session_id: info.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            expired = report.expired.len(),
            cleaned = report.cleaned.len(),
            inactive = report.inactive.len(),
            errors = report.errors.len(),
            "expiry sweep finished"
        );
        report
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut sessions = join_all(self.snapshot().iter().map(|s| s.info())).await;
        sessions.sort_by_key(|s| s.idle_for);

        let inactive_after = self.sweep.inactive_after;
        RegistryStats {
            total: sessions.len(),
            connected: sessions.iter().filter(|s| s.is_connected).count(),
            listening: sessions.iter().filter(|s| s.is_listening).count(),
            restoring: sessions.iter().filter(|s| s.restoring).count(),
            inactive: sessions
                .iter()
                .filter(|s| s.idle_for >= inactive_after)
                .count(),
            with_errors: sessions
                .iter()
                .filter(|s| s.last_error.is_some() || s.state == SessionState::Failed)
                .count(),
            problematic: sessions
                .iter()
                .filter(|s| self.ctx.policy.is_exhausted(s.reconnection_attempts))
                .count(),
            pending_messages: sessions
                .iter()
                .map(|s| s.delivery.pending_messages)
                .sum(),
            sessions,
        }
    }

    /// Destroys every session (forced flush included) and rejects leftover restorations.
    pub async fn shutdown(&self) -> Vec<(SessionId, TeardownReport)> {
        let sessions = self.snapshot();
        info!(count = sessions.len(), "shutting down sessions");

        let results = join_all(sessions.iter().map(|session| async move {
            (session.id().clone(), session.destroy().await)
        }))
        .await;

        let mut reports = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(report) => reports.push((id, report)),
                Err(e) => debug!(session_id = %id, error = %e, "session already gone at shutdown"),
            }
        }
        let rejected = self.ctx.restorations.reject_all("service shutting down");
        if rejected > 0 {
            info!(rejected, "pending restorations rejected at shutdown");
        }
        reports
    }
}

