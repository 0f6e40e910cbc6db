// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test harness for session-level integration testing.
//!
//! `TestHarness` assembles a [`SessionRegistry`] over a [`MockEngineFactory`]
//! and a [`MockSender`], so tests can create sessions, push engine events,
//! and assert on delivered batches and published status updates.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_config::HeraldConfig;
use herald_core::{DownstreamSender, EngineFactory, HeraldError, InboundMessage, SessionState};
use herald_session::{CreateOptions, SessionInfo, SessionRegistry};

use crate::mock_engine::{EngineScript, MockEngine, MockEngineFactory};
use crate::mock_sender::MockSender;

/// Upper bound on scheduler yields while waiting for background tasks.
const SETTLE_YIELDS: usize = 10_000;

/// Builder for creating test environments with configurable options.
pub struct TestHarnessBuilder {
    config: HeraldConfig,
    script: EngineScript,
    sender: Option<MockSender>,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        let mut config = HeraldConfig::default();
        // Deterministic backoff unless a test opts in.
        config.reconnect.jitter_ratio = 0.0;
        Self {
            config,
            script: EngineScript::default(),
            sender: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: HeraldConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.delivery.chunk_size = chunk_size;
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.config.delivery.chunk_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_buffered(mut self, max: Option<usize>) -> Self {
        self.config.delivery.max_buffered_per_chat = max;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.config.service.max_sessions = max;
        self
    }

    pub fn with_max_sessions_per_owner(mut self, max: usize) -> Self {
        self.config.service.max_sessions_per_owner = Some(max);
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.config.reconnect.max_attempts = max;
        self
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.config.reconnect.jitter_ratio = ratio;
        self
    }

    pub fn with_init_timeout(mut self, secs: u64) -> Self {
        self.config.engine.init_timeout_secs = secs;
        self
    }

    /// Adjust any other setting.
    pub fn configure(mut self, f: impl FnOnce(&mut HeraldConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Default script for every engine the factory creates.
    pub fn with_engine_script(mut self, script: EngineScript) -> Self {
        self.script = script;
        self
    }

    pub fn with_sender(mut self, sender: MockSender) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Build the test harness.
    pub fn build(self) -> TestHarness {
        let factory = Arc::new(MockEngineFactory::with_script(self.script));
        let sender = Arc::new(self.sender.unwrap_or_default());
        let engines: Arc<dyn EngineFactory> = factory.clone();
        let downstream: Arc<dyn DownstreamSender> = sender.clone();
        let registry = Arc::new(SessionRegistry::new(&self.config, engines, downstream));
        TestHarness {
            registry,
            factory,
            sender,
            config: self.config,
        }
    }
}

/// A registry wired to mock collaborators.
pub struct TestHarness {
    pub registry: Arc<SessionRegistry>,
    pub factory: Arc<MockEngineFactory>,
    pub sender: Arc<MockSender>,
    pub config: HeraldConfig,
}

impl TestHarness {
    /// Create a new builder for configuring the test harness.
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    /// Creates a session and returns the engine bound to it.
    pub async fn create(&self, id: &str) -> Result<Arc<MockEngine>, HeraldError> {
        self.registry.create(id, CreateOptions::default()).await?;
        self.factory
            .latest(id)
            .ok_or_else(|| HeraldError::Internal(format!("no engine created for {id}")))
    }

    /// Creates a session and drives it to CONNECTED.
    pub async fn create_connected(&self, id: &str) -> Result<Arc<MockEngine>, HeraldError> {
        let engine = self.create(id).await?;
        engine.connect();
        self.wait_for_state(id, SessionState::Connected).await?;
        Ok(engine)
    }

    /// Creates, connects, and starts listening.
    pub async fn create_listening(&self, id: &str) -> Result<Arc<MockEngine>, HeraldError> {
        let engine = self.create_connected(id).await?;
        self.registry.start_listening(id).await?;
        Ok(engine)
    }

    /// Lets background tasks (event pumps, listeners) run without advancing time.
    pub async fn settle(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    /// Waits until the session reports `state`, without advancing time.
    pub async fn wait_for_state(
        &self,
        id: &str,
        state: SessionState,
    ) -> Result<SessionInfo, HeraldError> {
        let mut last = None;
        for _ in 0..SETTLE_YIELDS {
            let info = self.registry.info(id).await?;
            if info.state == state {
                return Ok(info);
            }
            last = Some(info.state);
            tokio::task::yield_now().await;
        }
        Err(HeraldError::Internal(format!(
            "session {id} never reached {state} (last {last:?})"
        )))
    }

    /// Waits until the session is gone from the registry.
    pub async fn wait_for_removal(&self, id: &str) -> Result<(), HeraldError> {
        for _ in 0..SETTLE_YIELDS {
            if !self.registry.contains(id) {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        Err(HeraldError::Internal(format!("session {id} still registered")))
    }
}

/// A plain text message; chats ending in `@g.us` are groups.
pub fn text_message(chat_id: &str, id: &str) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        sender_id: if chat_id.ends_with("@g.us") {
            "111@c.us".to_string()
        } else {
            chat_id.to_string()
        },
        body: format!("message {id}"),
        timestamp: Utc::now(),
        is_group: chat_id.ends_with("@g.us"),
        from_me: false,
        has_media: false,
        media: None,
        contact: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn harness_connects_a_session() {
        let harness = TestHarness::builder().build();
        let engine = harness.create_connected("s1").await.unwrap();
        assert_eq!(engine.initialize_calls(), 1);
        let info = harness.registry.info("s1").await.unwrap();
        assert!(info.is_connected);
        assert!(info.ready_at.is_some());
    }

    #[test]
    fn builder_overrides_delivery_settings() {
        let harness = TestHarness::builder()
            .with_chunk_size(2)
            .with_chunk_interval(Duration::from_secs(10))
            .build();
        assert_eq!(harness.config.delivery.chunk_size, 2);
        assert_eq!(harness.config.delivery.chunk_interval_ms, 10_000);
        assert_eq!(harness.config.reconnect.jitter_ratio, 0.0);
    }
}
