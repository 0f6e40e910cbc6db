// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scriptable client engine for deterministic session tests.
//!
//! A `MockEngine` never emits anything on its own: tests push protocol
//! events through [`MockEngine::emit`] and friends, and script the
//! responses of `initialize`, `state`, and `destroy` via [`EngineScript`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use herald_core::{
    ChatSummary, ClientEngine, ConnectionState, ContactInfo, EngineEvent, EngineEventSender,
    EngineFactory, HeraldError, InboundMessage, MediaAttachment, SessionId,
};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted behavior of a mock engine.
#[derive(Debug, Clone)]
pub struct EngineScript {
    /// `initialize()` fails with this message.
    pub fail_initialize: Option<String>,
    /// `initialize()` sleeps this long first.
    pub initialize_delay: Option<Duration>,
    /// Events emitted as soon as `initialize()` succeeds.
    pub emit_on_initialize: Vec<EngineEvent>,
    /// Answer of `state()` until changed with [`MockEngine::set_state`].
    pub state: ConnectionState,
    pub fail_state_query: bool,
    pub fail_destroy: bool,
    pub chats: Vec<ChatSummary>,
    pub contacts: HashMap<String, ContactInfo>,
    pub media: Option<MediaAttachment>,
    pub fail_contact_lookup: bool,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            fail_initialize: None,
            initialize_delay: None,
            emit_on_initialize: Vec::new(),
            state: ConnectionState::Connected,
            fail_state_query: false,
            fail_destroy: false,
            chats: Vec::new(),
            contacts: HashMap::new(),
            media: None,
            fail_contact_lookup: false,
        }
    }
}

impl EngineScript {
    /// Pairs with stored credentials: authenticated then ready right after initialize.
    pub fn auto_ready() -> Self {
        Self {
            emit_on_initialize: vec![EngineEvent::Authenticated, EngineEvent::Ready],
            ..Self::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_initialize: Some(message.into()),
            ..Self::default()
        }
    }
}

/// A client engine double bound to one session.
pub struct MockEngine {
    session_id: SessionId,
    events: Mutex<Option<EngineEventSender>>,
    script: Mutex<EngineScript>,
    initialize_calls: AtomicUsize,
    state_queries: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl MockEngine {
    pub fn new(session_id: SessionId, events: EngineEventSender, script: EngineScript) -> Self {
        Self {
            session_id,
            events: Mutex::new(Some(events)),
            script: Mutex::new(script),
            initialize_calls: AtomicUsize::new(0),
            state_queries: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Pushes a protocol event. Returns false once the engine was destroyed
    /// or the session stopped listening to it.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match lock(&self.events).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn qr(&self, code: &str) -> bool {
        self.emit(EngineEvent::Qr(code.to_string()))
    }

    /// Emits `authenticated` followed by `ready`.
    pub fn connect(&self) -> bool {
        self.emit(EngineEvent::Authenticated) && self.emit(EngineEvent::Ready)
    }

    pub fn disconnect(&self, reason: &str) -> bool {
        self.emit(EngineEvent::Disconnected(reason.to_string()))
    }

    pub fn message(&self, message: InboundMessage) -> bool {
        self.emit(EngineEvent::Message(message))
    }

    pub fn set_state(&self, state: ConnectionState) {
        lock(&self.script).state = state;
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn state_queries(&self) -> usize {
        self.state_queries.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroy_calls() > 0
    }
}

#[async_trait]
impl ClientEngine for MockEngine {
    async fn initialize(&self) -> Result<(), HeraldError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        let script = lock(&self.script).clone();
        if let Some(delay) = script.initialize_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = script.fail_initialize {
            return Err(HeraldError::engine(message, None));
        }
        for event in script.emit_on_initialize {
            self.emit(event);
        }
        Ok(())
    }

    async fn state(&self) -> Result<ConnectionState, HeraldError> {
        self.state_queries.fetch_add(1, Ordering::SeqCst);
        let script = lock(&self.script);
        if script.fail_state_query {
            return Err(HeraldError::engine("state query failed", None));
        }
        Ok(script.state)
    }

    async fn chats(&self) -> Result<Vec<ChatSummary>, HeraldError> {
        Ok(lock(&self.script).chats.clone())
    }

    async fn contact(&self, contact_id: &str) -> Result<Option<ContactInfo>, HeraldError> {
        let script = lock(&self.script);
        if script.fail_contact_lookup {
            return Err(HeraldError::engine("contact lookup failed", None));
        }
        Ok(script.contacts.get(contact_id).cloned())
    }

    async fn download_media(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<MediaAttachment>, HeraldError> {
        if !message.has_media {
            return Ok(None);
        }
        Ok(lock(&self.script).media.clone())
    }

    async fn destroy(&self) -> Result<(), HeraldError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.events).take();
        if lock(&self.script).fail_destroy {
            return Err(HeraldError::engine("engine destroy failed", None));
        }
        Ok(())
    }
}

/// Hands out [`MockEngine`]s and keeps every one it created.
pub struct MockEngineFactory {
    default_script: Mutex<EngineScript>,
    scripts: Mutex<HashMap<String, EngineScript>>,
    fail_create: Mutex<HashMap<String, String>>,
    engines: Mutex<Vec<Arc<MockEngine>>>,
    created: Notify,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::with_script(EngineScript::default())
    }

    pub fn with_script(script: EngineScript) -> Self {
        Self {
            default_script: Mutex::new(script),
            scripts: Mutex::new(HashMap::new()),
            fail_create: Mutex::new(HashMap::new()),
            engines: Mutex::new(Vec::new()),
            created: Notify::new(),
        }
    }

    /// Overrides the script for engines created for `session_id`.
    pub fn script_for(&self, session_id: &str, script: EngineScript) {
        lock(&self.scripts).insert(session_id.to_string(), script);
    }

    pub fn set_default_script(&self, script: EngineScript) {
        *lock(&self.default_script) = script;
    }

    /// Makes `create()` fail for `session_id` until cleared.
    pub fn fail_create(&self, session_id: &str, message: &str) {
        lock(&self.fail_create).insert(session_id.to_string(), message.to_string());
    }

    pub fn clear_create_failure(&self, session_id: &str) {
        lock(&self.fail_create).remove(session_id);
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        lock(&self.engines).clone()
    }

    pub fn engines_for(&self, session_id: &str) -> Vec<Arc<MockEngine>> {
        lock(&self.engines)
            .iter()
            .filter(|engine| engine.session_id().as_str() == session_id)
            .cloned()
            .collect()
    }

    /// The most recent engine created for `session_id`.
    pub fn latest(&self, session_id: &str) -> Option<Arc<MockEngine>> {
        self.engines_for(session_id).pop()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.engines).len()
    }

    /// Waits until at least `count` engines exist for `session_id`.
    pub async fn wait_for_engines(&self, session_id: &str, count: usize) -> Arc<MockEngine> {
        loop {
            let notified = self.created.notified();
            let engines = self.engines_for(session_id);
            if engines.len() >= count {
                if let Some(engine) = engines.last() {
                    return Arc::clone(engine);
                }
            }
            notified.await;
        }
    }
}

impl Default for MockEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        session_id: &SessionId,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ClientEngine>, HeraldError> {
        if let Some(message) = lock(&self.fail_create).get(session_id.as_str()) {
            return Err(HeraldError::engine(message.clone(), None));
        }
        let script = lock(&self.scripts)
            .get(session_id.as_str())
            .cloned()
            .unwrap_or_else(|| lock(&self.default_script).clone());

        let engine = Arc::new(MockEngine::new(session_id.clone(), events, script));
        lock(&self.engines).push(Arc::clone(&engine));
        self.created.notify_waiters();
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn emitted_events_reach_the_session_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = MockEngine::new(id("s1"), tx, EngineScript::default());
        assert!(engine.qr("code-1"));
        assert!(engine.connect());
        assert_eq!(rx.recv().await, Some(EngineEvent::Qr("code-1".into())));
        assert_eq!(rx.recv().await, Some(EngineEvent::Authenticated));
        assert_eq!(rx.recv().await, Some(EngineEvent::Ready));
    }

    #[tokio::test]
    async fn destroy_closes_the_event_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = MockEngine::new(id("s1"), tx, EngineScript::default());
        engine.destroy().await.unwrap();
        assert!(engine.is_destroyed());
        assert!(!engine.disconnect("LOGOUT"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn auto_ready_emits_after_initialize() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = MockEngine::new(id("s1"), tx, EngineScript::auto_ready());
        engine.initialize().await.unwrap();
        assert_eq!(rx.recv().await, Some(EngineEvent::Authenticated));
        assert_eq!(rx.recv().await, Some(EngineEvent::Ready));
    }

    #[tokio::test]
    async fn factory_applies_per_session_scripts_and_failures() {
        let factory = MockEngineFactory::new();
        factory.script_for("bad", EngineScript::failing("boom"));
        factory.fail_create("gone", "no engine");

        let (tx, _rx) = mpsc::unbounded_channel();
        let bad = factory.create(&id("bad"), tx).await.unwrap();
        assert!(bad.initialize().await.is_err());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(factory.create(&id("gone"), tx).await.is_err());
        assert_eq!(factory.created_count(), 1);
        assert!(factory.latest("bad").is_some());
    }
}
