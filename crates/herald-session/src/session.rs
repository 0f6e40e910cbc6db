// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session state machine.
//!
//! A [`Session`] owns one client engine binding at a time. Engine events
//! arrive on an unbounded channel drained by a pump task; each binding gets a
//! new generation number so events from a replaced engine are ignored.
//! Inbound messages go through a separate listener task that applies filters
//! and enrichment before handing them to the [`DeliveryPipeline`].
//!
//! The session lock is never held across an engine call or a downstream send.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use herald_config::model::EnrichmentConfig;
use herald_core::{
    ChatSummary, ClientEngine, ConnectionState, DownstreamSender, EngineEvent, EngineFactory,
    HeraldError, InboundMessage, SessionId, SessionState, StatusEvent,
};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::fanout::StatusFanout;
use crate::filter::MessageFilter;
use crate::pipeline::{DeliveryPipeline, DeliverySettings, DeliveryStats, FlushReport};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::restoration::{RestorationRegistry, RestoreSuccess};

/// Disconnect reason recorded when a scheduled rebind itself fails.
pub const RECONNECT_FAILED_REASON: &str = "RECONNECT_FAILED";

pub(crate) type SessionTable = DashMap<SessionId, Arc<Session>>;

/// Collaborators shared by every session of a registry.
pub(crate) struct SessionContext {
    pub factory: Arc<dyn EngineFactory>,
    pub sender: Arc<dyn DownstreamSender>,
    pub fanout: Arc<StatusFanout>,
    pub restorations: Arc<RestorationRegistry>,
    pub policy: ReconnectPolicy,
    pub filter: MessageFilter,
    pub delivery: DeliverySettings,
    pub enrichment: EnrichmentConfig,
    pub init_timeout: Duration,
}

/// Result of `start_listening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenOutcome {
    Started,
    AlreadyListening,
}

/// Result of `stop_listening`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The listener was detached after a forced flush.
    Stopped { flushed: FlushReport },
    NotListening,
}

/// Result of a reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectOutcome {
    AlreadyConnected,
    /// The engine still reported a live connection.
    Resumed,
    /// The existing engine was initialized again.
    Reinitialized,
    /// The engine was destroyed and replaced.
    Recreated,
}

/// What a teardown released.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub flushed: FlushReport,
    /// Buffered messages released without delivery.
    pub released: usize,
    /// Engine `destroy()` failure, logged and not propagated.
    pub engine_error: Option<String>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub owner: Option<String>,
    pub state: SessionState,
    pub is_listening: bool,
    pub is_connected: bool,
    pub has_engine: bool,
    pub restoring: bool,
    pub from_disk: bool,
    pub reconnect_pending: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub reconnection_attempts: u32,
    pub last_disconnect_reason: Option<String>,
    pub last_error: Option<String>,
    pub chat_filters: BTreeMap<String, bool>,
    pub delivery: DeliveryStats,
    #[serde(skip)]
    pub idle_for: Duration,
    #[serde(skip)]
    pub age: Duration,
}

struct Listener {
    tx: mpsc::UnboundedSender<InboundMessage>,
    task: JoinHandle<()>,
}

struct SessionInner {
    state: SessionState,
    listening: bool,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    ready_at: Option<DateTime<Utc>>,
    reconnection_attempts: u32,
    last_disconnect_reason: Option<String>,
    last_error: Option<String>,
    chat_filters: HashMap<String, bool>,
    engine: Option<Arc<dyn ClientEngine>>,
    generation: u64,
    pump: Option<JoinHandle<()>>,
    listener: Option<Listener>,
    reconnect: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_activity = Instant::now();
    }

    fn connected_state(&self) -> SessionState {
        if self.listening {
            SessionState::Listening
        } else {
            SessionState::Connected
        }
    }

    /// Drops the current binding without destroying it; its pump exits on the next event.
    fn detach_engine(&mut self) -> Option<Arc<dyn ClientEngine>> {
        self.generation += 1;
        self.pump.take();
        self.engine.take()
    }
}

/// One managed chat identity.
pub struct Session {
    id: SessionId,
    owner: Option<String>,
    from_disk: bool,
    created_at: DateTime<Utc>,
    created: Instant,
    ctx: Arc<SessionContext>,
    table: Weak<SessionTable>,
    pipeline: Arc<DeliveryPipeline>,
    inner: Mutex<SessionInner>,
    this: Weak<Session>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        owner: Option<String>,
        from_disk: bool,
        ctx: Arc<SessionContext>,
        table: Weak<SessionTable>,
    ) -> Arc<Self> {
        let pipeline = DeliveryPipeline::new(id.clone(), ctx.delivery, Arc::clone(&ctx.sender));
        let now = Utc::now();
        Arc::new_cyclic(|this| Self {
            id,
            owner,
            from_disk,
            created_at: now,
            created: Instant::now(),
            ctx,
            table,
            pipeline,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                listening: false,
                last_activity_at: now,
                last_activity: Instant::now(),
                ready_at: None,
                reconnection_attempts: 0,
                last_disconnect_reason: None,
                last_error: None,
                chat_filters: HashMap::new(),
                engine: None,
                generation: 0,
                pump: None,
                listener: None,
                reconnect: None,
            }),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn info(&self) -> SessionInfo {
        let delivery = self.pipeline.stats().await;
        let restoring = self.ctx.restorations.is_restoring(self.id.as_str());
        let inner = self.inner.lock().await;
        SessionInfo {
            id: self.id.clone(),
            owner: self.owner.clone(),
            state: inner.state,
            is_listening: inner.listening,
            is_connected: inner.state.is_connected(),
            has_engine: inner.engine.is_some(),
            restoring,
            from_disk: self.from_disk,
            reconnect_pending: inner.reconnect.is_some(),
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
            ready_at: inner.ready_at,
            reconnection_attempts: inner.reconnection_attempts,
            last_disconnect_reason: inner.last_disconnect_reason.clone(),
            last_error: inner.last_error.clone(),
            chat_filters: inner
                .chat_filters
                .iter()
                .map(|(chat, listen)| (chat.clone(), *listen))
                .collect(),
            delivery,
            idle_for: inner.last_activity.elapsed(),
            age: self.created.elapsed(),
        }
    }

    // --- binding -----------------------------------------------------------

    /// CREATED -> INITIALIZING: binds a fresh engine and initializes it.
    ///
    /// On failure the session is marked FAILED, torn down, and removed from
    /// the registry before the error is returned.
    pub(crate) async fn start(&self) -> Result<(), HeraldError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            inner.state = SessionState::Initializing;
            inner.touch();
        }
        self.publish_state(SessionState::Initializing);

        let engine = match self.attach_engine().await {
            Ok(engine) => engine,
            Err(e) => return Err(self.fail_bind(e).await),
        };
        if let Err(e) = self.initialize(&engine).await {
            return Err(self.fail_bind(e).await);
        }

        if self.state().await == SessionState::Destroyed {
            return Err(self.not_found());
        }
        debug!(session_id = %self.id, "engine initialized");
        Ok(())
    }

    /// Creates an engine and starts pumping its events.
    async fn attach_engine(&self) -> Result<Arc<dyn ClientEngine>, HeraldError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = self
            .ctx
            .factory
            .create(&self.id, events_tx)
            .await
            .map_err(|e| self.bind_error(e))?;

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Destroyed {
            drop(inner);
            let _ = self.destroy_engine(engine).await;
            return Err(self.not_found());
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.engine = Some(Arc::clone(&engine));
        inner.pump = Some(self.spawn_pump(generation, events_rx));
        Ok(engine)
    }

    async fn initialize(&self, engine: &Arc<dyn ClientEngine>) -> Result<(), HeraldError> {
        let timeout = self.ctx.init_timeout;
        match tokio::time::timeout(timeout, engine.initialize()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.bind_error(e)),
            Err(_) => Err(HeraldError::EngineBindTimeout {
                session_id: self.id.to_string(),
                timeout,
            }),
        }
    }

    fn bind_error(&self, error: HeraldError) -> HeraldError {
        match error {
            HeraldError::EngineBindError { .. } | HeraldError::EngineBindTimeout { .. } => error,
            other => HeraldError::EngineBindError {
                session_id: self.id.to_string(),
                source: Box::new(other),
            },
        }
    }

    async fn fail_bind(&self, error: HeraldError) -> HeraldError {
        warn!(session_id = %self.id, error = %error, "engine bind failed");
        let (engine, pump) = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return error;
            }
            inner.state = SessionState::Failed;
            inner.last_error = Some(error.to_string());
            let pump = inner.pump.take();
            (inner.detach_engine(), pump)
        };
        if let Some(pump) = pump {
            pump.abort();
        }

        self.ctx
            .restorations
            .reject(self.id.as_str(), error.to_string());
        self.ctx.fanout.publish(
            &self.id,
            StatusEvent::ClientError {
                message: error.to_string(),
            },
        );
        self.publish_state(SessionState::Failed);

        if let Some(engine) = engine {
            let _ = self.destroy_engine(engine).await;
        }
        self.pipeline.close().await;
        self.ctx.fanout.clear_qr(self.id.as_str());
        self.remove_from_table();
        error
    }

    fn spawn_pump(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let session = self.this.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                if !session.handle_event(generation, event).await {
                    break;
                }
            }
            trace!(generation, "engine event pump stopped");
        })
    }

    // --- engine events -----------------------------------------------------

    /// Applies one engine event. Returns false once the binding is stale.
    async fn handle_event(&self, generation: u64, event: EngineEvent) -> bool {
        {
            let inner = self.inner.lock().await;
            if inner.generation != generation || inner.state == SessionState::Destroyed {
                return false;
            }
        }

        match event {
            EngineEvent::Qr(qr) => self.on_qr(qr).await,
            EngineEvent::Authenticated => self.on_authenticated().await,
            EngineEvent::Ready => self.on_ready().await,
            EngineEvent::ChangeState(state) => {
                debug!(session_id = %self.id, state = %state, "engine state changed");
                self.ctx.fanout.publish(
                    &self.id,
                    StatusEvent::StateChange {
                        state: state.to_string(),
                    },
                );
            }
            EngineEvent::AuthFailure(message) => self.on_auth_failure(message).await,
            EngineEvent::Disconnected(reason) => self.on_disconnected(reason).await,
            EngineEvent::Error(message) => {
                warn!(session_id = %self.id, error = %message, "engine reported an error");
                self.inner.lock().await.last_error = Some(message.clone());
                self.ctx
                    .fanout
                    .publish(&self.id, StatusEvent::ClientError { message });
            }
            EngineEvent::Message(message) => self.on_message(message).await,
        }
        true
    }

    async fn on_qr(&self, qr: String) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::AwaitingAuth;
            inner.touch();
        }
        info!(session_id = %self.id, "qr code received, awaiting authentication");
        self.ctx.fanout.publish(&self.id, StatusEvent::QrReady { qr });
    }

    async fn on_authenticated(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Authenticated;
            inner.reconnection_attempts = 0;
            inner.touch();
        }
        info!(session_id = %self.id, "session authenticated");
        self.ctx.fanout.clear_qr(self.id.as_str());
        self.publish_state(SessionState::Authenticated);
    }

    async fn on_ready(&self) {
        let now = Utc::now();
        let state = {
            let mut inner = self.inner.lock().await;
            inner.state = inner.connected_state();
            inner.ready_at = Some(now);
            inner.reconnection_attempts = 0;
            inner.last_error = None;
            inner.touch();
            inner.state
        };
        info!(session_id = %self.id, state = %state, "session ready");
        self.mark_connected(state, now);
    }

    fn mark_connected(&self, state: SessionState, ready_at: DateTime<Utc>) {
        self.ctx.restorations.resolve(RestoreSuccess {
            session_id: self.id.clone(),
            state,
            ready_at,
        });
        self.ctx
            .fanout
            .publish(&self.id, StatusEvent::Connected { ready_at });
    }

    async fn on_auth_failure(&self, message: String) {
        let (engine, reconnect) = {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Failed;
            inner.reconnection_attempts += 1;
            inner.last_error = Some(message.clone());
            inner.touch();
            (inner.detach_engine(), inner.reconnect.take())
        };
        if let Some(reconnect) = reconnect {
            reconnect.abort();
        }
        warn!(session_id = %self.id, error = %message, "authentication failed");

        self.ctx
            .restorations
            .reject(self.id.as_str(), format!("auth failure: {message}"));
        self.ctx
            .fanout
            .publish(&self.id, StatusEvent::AuthFailure { message });
        if let Some(engine) = engine {
            let _ = self.destroy_engine(engine).await;
        }
    }

    async fn on_disconnected(&self, reason: String) {
        let attempts = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return;
            }
            inner.reconnection_attempts += 1;
            inner.last_disconnect_reason = Some(reason.clone());
            inner.state = SessionState::Disconnected;
            inner.touch();
            inner.reconnection_attempts
        };
        warn!(session_id = %self.id, reason = %reason, attempts, "session disconnected");

        self.ctx
            .restorations
            .reject(self.id.as_str(), format!("disconnected: {reason}"));
        self.ctx.fanout.publish(
            &self.id,
            StatusEvent::Disconnected {
                reason: reason.clone(),
            },
        );
        self.apply_reconnect_policy(&reason, attempts).await;
    }

    async fn apply_reconnect_policy(&self, reason: &str, attempts: u32) {
        match self.ctx.policy.evaluate(reason, attempts) {
            ReconnectDecision::Abandon(class) => {
                info!(
                    session_id = %self.id,
                    reason,
                    class = ?class,
                    "disconnect not retried, releasing engine"
                );
                let engine = self.inner.lock().await.detach_engine();
                if let Some(engine) = engine {
                    let _ = self.destroy_engine(engine).await;
                }
            }
            ReconnectDecision::Exhausted {
                attempts,
                max_attempts,
            } => {
                warn!(
                    session_id = %self.id,
                    attempts,
                    max_attempts,
                    "reconnection attempts exhausted"
                );
                let engine = {
                    let mut inner = self.inner.lock().await;
                    if inner.state == SessionState::Destroyed {
                        return;
                    }
                    inner.state = SessionState::Failed;
                    inner.last_error = Some(format!(
                        "reconnection attempts exhausted ({attempts}/{max_attempts})"
                    ));
                    inner.detach_engine()
                };
                self.publish_state(SessionState::Failed);
                if let Some(engine) = engine {
                    let _ = self.destroy_engine(engine).await;
                }
            }
            ReconnectDecision::Retry { delay } => self.schedule_reconnect(delay).await,
        }
    }

    async fn on_message(&self, message: InboundMessage) {
        let mut inner = self.inner.lock().await;
        inner.touch();
        match (&inner.listener, inner.listening) {
            (Some(listener), true) => {
                if listener.tx.send(message).is_err() {
                    debug!(session_id = %self.id, "listener gone, message dropped");
                }
            }
            _ => trace!(session_id = %self.id, "not listening, message ignored"),
        }
    }

    // --- reconnection ------------------------------------------------------

    async fn schedule_reconnect(&self, delay: Duration) {
        let session = self.this.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = session.upgrade() {
                session.run_scheduled_reconnect().await;
            }
        });

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Destroyed {
            handle.abort();
            return;
        }
        if let Some(previous) = inner.reconnect.replace(handle) {
            previous.abort();
        }
        info!(session_id = %self.id, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    /// Body of a scheduled reconnect. Boxed because it re-enters the
    /// disconnect path that scheduled it.
    fn run_scheduled_reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            {
                let mut inner = self.inner.lock().await;
                // Detach our own handle so a reschedule cannot abort this task.
                inner.reconnect.take();
                if inner.state != SessionState::Disconnected {
                    debug!(
                        session_id = %self.id,
                        state = %inner.state,
                        "scheduled reconnect skipped"
                    );
                    return;
                }
            }
            match self.reconnect_now().await {
                Ok(outcome) => {
                    info!(session_id = %self.id, outcome = ?outcome, "scheduled reconnect succeeded");
                }
                Err(HeraldError::SessionNotFound(_)) => {}
                Err(e) => self.on_reconnect_failed(&e).await,
            }
        })
    }

    /// Operator-triggered reconnect. Cancels any pending scheduled attempt.
    pub(crate) async fn reconnect(&self) -> Result<ReconnectOutcome, HeraldError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            if inner.state.is_connected() {
                return Ok(ReconnectOutcome::AlreadyConnected);
            }
            if let Some(pending) = inner.reconnect.take() {
                pending.abort();
            }
        }
        match self.reconnect_now().await {
            Ok(outcome) => Ok(outcome),
            Err(e @ HeraldError::SessionNotFound(_)) => Err(e),
            Err(e) => {
                self.on_reconnect_failed(&e).await;
                Err(e)
            }
        }
    }

    async fn on_reconnect_failed(&self, error: &HeraldError) {
        warn!(session_id = %self.id, error = %error, "reconnect attempt failed");
        self.inner.lock().await.last_error = Some(error.to_string());
        self.on_disconnected(RECONNECT_FAILED_REASON.to_string())
            .await;
    }

    /// DISCONNECTED -> RECONNECTING, then resume, re-initialize, or recreate
    /// depending on what the engine reports.
    async fn reconnect_now(&self) -> Result<ReconnectOutcome, HeraldError> {
        let engine = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            inner.state = SessionState::Reconnecting;
            inner.touch();
            inner.engine.clone()
        };
        self.publish_state(SessionState::Reconnecting);

        let Some(engine) = engine else {
            return self.recreate_engine().await;
        };

        let probe = tokio::time::timeout(self.ctx.init_timeout, engine.state()).await;
        match probe {
            Ok(Ok(ConnectionState::Connected)) => {
                self.resume().await?;
                Ok(ReconnectOutcome::Resumed)
            }
            Ok(Ok(state)) if state.needs_pairing() => {
                info!(session_id = %self.id, state = %state, "stored pairing invalid, new qr required");
                self.ctx.fanout.clear_qr(self.id.as_str());
                self.ctx.fanout.publish(&self.id, StatusEvent::QrExpired);
                self.initialize(&engine).await?;
                Ok(ReconnectOutcome::Reinitialized)
            }
            Ok(Ok(state)) if !state.is_unrecoverable_conflict() => {
                debug!(session_id = %self.id, state = %state, "re-initializing engine");
                self.initialize(&engine).await?;
                Ok(ReconnectOutcome::Reinitialized)
            }
            probe => {
                match probe {
                    Ok(Ok(state)) => {
                        info!(session_id = %self.id, state = %state, "engine wedged, recreating")
                    }
                    Ok(Err(e)) => {
                        info!(session_id = %self.id, error = %e, "engine state query failed, recreating")
                    }
                    Err(_) => info!(session_id = %self.id, "engine state query timed out, recreating"),
                }
                let stale = self.inner.lock().await.detach_engine();
                if let Some(stale) = stale {
                    let _ = self.destroy_engine(stale).await;
                }
                self.recreate_engine().await
            }
        }
    }

    async fn recreate_engine(&self) -> Result<ReconnectOutcome, HeraldError> {
        let engine = self.attach_engine().await?;
        self.initialize(&engine).await?;
        if self.state().await == SessionState::Destroyed {
            return Err(self.not_found());
        }
        Ok(ReconnectOutcome::Recreated)
    }

    async fn resume(&self) -> Result<(), HeraldError> {
        let now = Utc::now();
        let (state, ready_at) = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            inner.state = inner.connected_state();
            inner.reconnection_attempts = 0;
            inner.last_error = None;
            inner.touch();
            let ready_at = *inner.ready_at.get_or_insert(now);
            (inner.state, ready_at)
        };
        info!(session_id = %self.id, "engine still connected, session resumed");
        self.mark_connected(state, ready_at);
        Ok(())
    }

    // --- listening ---------------------------------------------------------

    pub(crate) async fn start_listening(&self) -> Result<ListenOutcome, HeraldError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            if inner.listening {
                return Ok(ListenOutcome::AlreadyListening);
            }
            if let Some(stale) = inner.listener.take() {
                stale.task.abort();
            }
            let (tx, rx) = mpsc::unbounded_channel();
            inner.listener = Some(Listener {
                tx,
                task: self.spawn_listener(rx),
            });
            inner.listening = true;
            if inner.state == SessionState::Connected {
                inner.state = SessionState::Listening;
            }
            inner.touch();
        }
        info!(session_id = %self.id, "listening started");
        self.ctx
            .fanout
            .publish(&self.id, StatusEvent::ListeningStatus { listening: true });
        Ok(ListenOutcome::Started)
    }

    /// Detaches the listener, drains what it already accepted, then force-flushes.
    pub(crate) async fn stop_listening(&self) -> Result<StopOutcome, HeraldError> {
        let listener = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            if !inner.listening {
                return Ok(StopOutcome::NotListening);
            }
            inner.listening = false;
            if inner.state == SessionState::Listening {
                inner.state = SessionState::Connected;
            }
            inner.touch();
            inner.listener.take()
        };

        if let Some(listener) = listener {
            self.drain_listener(listener).await;
        }
        let flushed = self.pipeline.flush_all().await;
        info!(
            session_id = %self.id,
            delivered = flushed.delivered,
            requeued = flushed.requeued,
            "listening stopped"
        );
        self.ctx
            .fanout
            .publish(&self.id, StatusEvent::ListeningStatus { listening: false });
        Ok(StopOutcome::Stopped { flushed })
    }

    async fn drain_listener(&self, listener: Listener) {
        let Listener { tx, task } = listener;
        drop(tx);
        match task.await {
            Err(e) if !e.is_cancelled() => {
                warn!(session_id = %self.id, error = %e, "listener task failed");
            }
            _ => {}
        }
    }

    fn spawn_listener(&self, mut messages: mpsc::UnboundedReceiver<InboundMessage>) -> JoinHandle<()> {
        let session = self.this.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.ingest(message).await;
            }
        })
    }

    /// Global filters, then the chat filter, then enrichment, then the pipeline.
    async fn ingest(&self, mut message: InboundMessage) {
        if let Some(rule) = self.ctx.filter.rejection(&message) {
            trace!(session_id = %self.id, chat_id = %message.chat_id, rule, "message filtered");
            return;
        }

        let engine = {
            let inner = self.inner.lock().await;
            if inner.chat_filters.get(&message.chat_id) == Some(&false) {
                trace!(session_id = %self.id, chat_id = %message.chat_id, "chat muted");
                return;
            }
            inner.engine.clone()
        };

        if let Some(engine) = engine {
            self.enrich(engine.as_ref(), &mut message).await;
        }
        let outcome = self.pipeline.enqueue(message).await;
        trace!(session_id = %self.id, outcome = ?outcome, "message enqueued");
    }

    async fn enrich(&self, engine: &dyn ClientEngine, message: &mut InboundMessage) {
        if self.ctx.enrichment.contacts && message.contact.is_none() {
            match engine.contact(&message.sender_id).await {
                Ok(contact) => message.contact = contact,
                Err(e) => {
                    warn!(session_id = %self.id, sender = %message.sender_id, error = %e, "contact lookup failed")
                }
            }
        }
        if self.ctx.enrichment.media && message.has_media && message.media.is_none() {
            match engine.download_media(message).await {
                Ok(media) => message.media = media,
                Err(e) => {
                    warn!(session_id = %self.id, message_id = %message.id, error = %e, "media download failed")
                }
            }
        }
    }

    pub(crate) async fn set_chat_listening(
        &self,
        chat_id: &str,
        listen: bool,
    ) -> Result<(), HeraldError> {
        if chat_id.trim().is_empty() {
            return Err(HeraldError::InvalidInput(
                "chat id must not be empty".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Destroyed {
            return Err(self.not_found());
        }
        inner.chat_filters.insert(chat_id.to_string(), listen);
        debug!(session_id = %self.id, chat_id, listen, "chat filter updated");
        Ok(())
    }

    // --- passthroughs ------------------------------------------------------

    pub(crate) async fn flush(&self) -> Result<FlushReport, HeraldError> {
        if self.state().await == SessionState::Destroyed {
            return Err(self.not_found());
        }
        Ok(self.pipeline.flush_all().await)
    }

    pub(crate) async fn chats(&self) -> Result<Vec<ChatSummary>, HeraldError> {
        let engine = {
            let inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            inner.engine.clone()
        };
        match engine {
            Some(engine) => engine.chats().await,
            None => Err(HeraldError::engine(
                format!("session {} has no engine bound", self.id),
                None,
            )),
        }
    }

    // --- teardown ----------------------------------------------------------

    /// Any state -> DESTROYED. Engine failures are logged and reported, never returned.
    pub(crate) async fn destroy(&self) -> Result<TeardownReport, HeraldError> {
        let (engine, listener, reconnect, pump, was_listening) = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Destroyed {
                return Err(self.not_found());
            }
            inner.state = SessionState::Destroyed;
            let was_listening = std::mem::replace(&mut inner.listening, false);
            let pump = inner.pump.take();
            (
                inner.detach_engine(),
                inner.listener.take(),
                inner.reconnect.take(),
                pump,
                was_listening,
            )
        };
        if let Some(reconnect) = reconnect {
            reconnect.abort();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(listener) = listener {
            self.drain_listener(listener).await;
        }

        let flushed = self.pipeline.flush_all().await;
        let released = self.pipeline.close().await;
        let engine_error = match engine {
            Some(engine) => self.destroy_engine(engine).await.err().map(|e| e.to_string()),
            None => None,
        };

        self.ctx
            .restorations
            .reject(self.id.as_str(), "session destroyed");
        self.ctx.fanout.clear_qr(self.id.as_str());
        if was_listening {
            self.ctx
                .fanout
                .publish(&self.id, StatusEvent::ListeningStatus { listening: false });
        }
        self.publish_state(SessionState::Destroyed);
        self.remove_from_table();

        info!(session_id = %self.id, released, "session destroyed");
        Ok(TeardownReport {
            flushed,
            released,
            engine_error,
        })
    }

    /// Best-effort engine release, bounded by the init timeout.
    async fn destroy_engine(&self, engine: Arc<dyn ClientEngine>) -> Result<(), HeraldError> {
        let timeout = self.ctx.init_timeout;
        let result = match tokio::time::timeout(timeout, engine.destroy()).await {
            Ok(result) => result,
            Err(_) => Err(HeraldError::Timeout { duration: timeout }),
        };
        if let Err(e) = &result {
            warn!(session_id = %self.id, error = %e, "engine destroy failed");
        }
        result.map_err(|e| HeraldError::Cleanup {
            session_id: self.id.to_string(),
            message: e.to_string(),
        })
    }

    fn remove_from_table(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove_if(self.id.as_str(), |_, session| {
                std::ptr::eq(Arc::as_ptr(session), self)
            });
        }
    }

    fn publish_state(&self, state: SessionState) {
        self.ctx.fanout.publish(
            &self.id,
            StatusEvent::StateChange {
                state: state.to_string(),
            },
        );
    }

    fn not_found(&self) -> HeraldError {
        HeraldError::SessionNotFound(self.id.to_string())
    }
}
