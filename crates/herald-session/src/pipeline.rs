// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-chat buffering with size/time-triggered chunk flushes.
//!
//! Each chat owns a FIFO buffer and at most one armed [`ChunkTimer`]. A flush
//! swaps the buffer for an empty one under the chat lock and cancels the
//! timer in the same critical section, so a message enqueued during the send
//! lands in the next batch. A failed batch is prepended back in front of
//! whatever arrived meanwhile and a fresh timer is armed.
//!
//! Sends for one chat are serialized by a per-chat send lock, which keeps
//! batches for a chat in enqueue order. Chats flush independently.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use herald_config::model::DeliveryConfig;
use herald_core::{DownstreamSender, InboundMessage, MessageBatch, SessionId};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Flush thresholds for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    pub chunk_size: usize,
    pub chunk_interval: Duration,
    pub max_buffered_per_chat: Option<usize>,
}

impl DeliverySettings {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            chunk_interval: config.chunk_interval(),
            max_buffered_per_chat: config.max_buffered_per_chat,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

/// Result of a single chat flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// The sender accepted the batch.
    Delivered { count: usize },
    /// The sender failed; the batch is back at the head of the buffer.
    Requeued { count: usize, error: String },
    /// The sender failed after the pipeline was closed; the batch is gone.
    Discarded { count: usize, error: String },
}

/// Result of [`DeliveryPipeline::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Buffered below the chunk threshold; a timer is armed.
    Buffered { pending: usize },
    /// The chunk threshold was reached and a flush ran.
    Flushed(FlushOutcome),
    /// The pipeline is closed.
    Rejected,
}

/// Aggregate of a forced flush across all chats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub chats: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub discarded: usize,
}

impl FlushReport {
    fn record(&mut self, outcome: &FlushOutcome) {
        match outcome {
            FlushOutcome::Empty => return,
            FlushOutcome::Delivered { count } => self.delivered += count,
            FlushOutcome::Requeued { count, .. } => self.requeued += count,
            FlushOutcome::Discarded { count, .. } => self.discarded += count,
        }
        self.chats += 1;
    }
}

/// Delivery counters exposed through session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub pending_messages: usize,
    pub buffered_chats: usize,
    pub armed_timers: usize,
    pub delivered_batches: u64,
    pub delivered_messages: u64,
    pub failed_sends: u64,
    pub dropped_messages: u64,
}

struct ChunkTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ChatSlot {
    buffer: VecDeque<InboundMessage>,
    timer: Option<ChunkTimer>,
    send_lock: Arc<Mutex<()>>,
}

/// The buffered, chunked delivery pipeline of one session.
pub struct DeliveryPipeline {
    session_id: SessionId,
    settings: DeliverySettings,
    sender: Arc<dyn DownstreamSender>,
    chats: Mutex<HashMap<String, ChatSlot>>,
    next_timer_id: AtomicU64,
    closed: AtomicBool,
    delivered_batches: AtomicU64,
    delivered_messages: AtomicU64,
    failed_sends: AtomicU64,
    dropped_messages: AtomicU64,
    this: Weak<DeliveryPipeline>,
}

impl DeliveryPipeline {
    pub fn new(
        session_id: SessionId,
        settings: DeliverySettings,
        sender: Arc<dyn DownstreamSender>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            session_id,
            settings,
            sender,
            chats: Mutex::new(HashMap::new()),
            next_timer_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            delivered_batches: AtomicU64::new(0),
            delivered_messages: AtomicU64::new(0),
            failed_sends: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> DeliverySettings {
        self.settings
    }

    /// Appends `message` to its chat buffer, flushing once the chunk size is reached.
    pub async fn enqueue(&self, message: InboundMessage) -> EnqueueOutcome {
        if self.closed.load(Ordering::Acquire) {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %self.session_id, "enqueue on closed pipeline");
            return EnqueueOutcome::Rejected;
        }

        let chat_id = message.chat_id.clone();
        {
            let mut chats = self.chats.lock().await;
            let slot = chats.entry(chat_id.clone()).or_default();
            slot.buffer.push_back(message);
            self.enforce_cap(&chat_id, slot);

            if slot.buffer.len() < self.settings.chunk_size {
                if slot.timer.is_none() {
                    slot.timer = Some(self.arm_timer(&chat_id));
                }
                return EnqueueOutcome::Buffered {
                    pending: slot.buffer.len(),
                };
            }
        }

        EnqueueOutcome::Flushed(self.flush(&chat_id).await)
    }

    /// Sends everything buffered for `chat_id` as one batch.
    pub async fn flush(&self, chat_id: &str) -> FlushOutcome {
        let send_lock = {
            let chats = self.chats.lock().await;
            match chats.get(chat_id) {
                Some(slot) => Arc::clone(&slot.send_lock),
                None => return FlushOutcome::Empty,
            }
        };
        let _sending = send_lock.lock().await;

        let messages = {
            let mut chats = self.chats.lock().await;
            let Some(slot) = chats.get_mut(chat_id) else {
                return FlushOutcome::Empty;
            };
            if let Some(timer) = slot.timer.take() {
                timer.handle.abort();
            }
            if slot.buffer.is_empty() {
                return FlushOutcome::Empty;
            }
            Vec::from(std::mem::take(&mut slot.buffer))
        };

        self.deliver(chat_id, messages).await
    }

    /// Flushes every chat, waiting for each send attempt.
    pub async fn flush_all(&self) -> FlushReport {
        let chat_ids: Vec<String> = self.chats.lock().await.keys().cloned().collect();
        let mut report = FlushReport::default();
        for chat_id in chat_ids {
            let outcome = self.flush(&chat_id).await;
            report.record(&outcome);
        }
        report
    }

    /// Cancels every timer and releases every buffer.
    ///
    /// Later enqueues are rejected and later send failures are not requeued.
    pub async fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut chats = self.chats.lock().await;
        let mut released = 0;
        for (chat_id, slot) in chats.drain() {
            if let Some(timer) = slot.timer {
                timer.handle.abort();
            }
            if !slot.buffer.is_empty() {
                warn!(
                    session_id = %self.session_id,
                    chat_id = %chat_id,
                    count = slot.buffer.len(),
                    "releasing undelivered messages"
                );
                released += slot.buffer.len();
            }
        }
        self.dropped_messages
            .fetch_add(released as u64, Ordering::Relaxed);
        released
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffered message count for one chat.
    pub async fn pending(&self, chat_id: &str) -> usize {
        self.chats
            .lock()
            .await
            .get(chat_id)
            .map_or(0, |slot| slot.buffer.len())
    }

    /// Whether a flush timer is armed for one chat.
    pub async fn has_timer(&self, chat_id: &str) -> bool {
        self.chats
            .lock()
            .await
            .get(chat_id)
            .is_some_and(|slot| slot.timer.is_some())
    }

    pub async fn stats(&self) -> DeliveryStats {
        let chats = self.chats.lock().await;
        DeliveryStats {
            pending_messages: chats.values().map(|s| s.buffer.len()).sum(),
            buffered_chats: chats.values().filter(|s| !s.buffer.is_empty()).count(),
            armed_timers: chats.values().filter(|s| s.timer.is_some()).count(),
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            delivered_messages: self.delivered_messages.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }

    async fn deliver(&self, chat_id: &str, messages: Vec<InboundMessage>) -> FlushOutcome {
        let count = messages.len();
        let batch = MessageBatch::new(&self.session_id, chat_id, messages);

        match self.sender.send(&batch).await {
            Ok(()) => {
                self.delivered_batches.fetch_add(1, Ordering::Relaxed);
                self.delivered_messages
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(
                    session_id = %self.session_id,
                    chat_id = %chat_id,
                    count,
                    sender = self.sender.name(),
                    "batch delivered"
                );
                FlushOutcome::Delivered { count }
            }
            Err(e) => {
                self.failed_sends.fetch_add(1, Ordering::Relaxed);
                let error = e.to_string();
                if self.requeue(chat_id, batch.messages).await {
                    warn!(
                        session_id = %self.session_id,
                        chat_id = %chat_id,
                        count,
                        error = %error,
                        "downstream send failed, batch requeued"
                    );
                    FlushOutcome::Requeued { count, error }
                } else {
                    warn!(
                        session_id = %self.session_id,
                        chat_id = %chat_id,
                        count,
                        error = %error,
                        "downstream send failed after close, batch discarded"
                    );
                    FlushOutcome::Discarded { count, error }
                }
            }
        }
    }

    /// Puts a failed batch back ahead of newer messages. Returns false once closed.
    async fn requeue(&self, chat_id: &str, messages: Vec<InboundMessage>) -> bool {
        let mut chats = self.chats.lock().await;
        if self.closed.load(Ordering::Acquire) {
            self.dropped_messages
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
            return false;
        }

        let slot = chats.entry(chat_id.to_string()).or_default();
        let mut restored = VecDeque::from(messages);
        restored.append(&mut slot.buffer);
        slot.buffer = restored;
        self.enforce_cap(chat_id, slot);

        if slot.timer.is_none() {
            slot.timer = Some(self.arm_timer(chat_id));
        }
        true
    }

    /// Drops the oldest messages beyond `max_buffered_per_chat`.
    fn enforce_cap(&self, chat_id: &str, slot: &mut ChatSlot) {
        let Some(cap) = self.settings.max_buffered_per_chat else {
            return;
        };
        if slot.buffer.len() <= cap {
            return;
        }
        let overflow = slot.buffer.len() - cap;
        slot.buffer.drain(..overflow);
        self.dropped_messages
            .fetch_add(overflow as u64, Ordering::Relaxed);
        warn!(
            session_id = %self.session_id,
            chat_id = %chat_id,
            dropped = overflow,
            cap,
            "chat buffer full, oldest messages dropped"
        );
    }

    fn arm_timer(&self, chat_id: &str) -> ChunkTimer {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let pipeline = self.this.clone();
        let chat = chat_id.to_string();
        let interval = self.settings.chunk_interval;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(pipeline) = pipeline.upgrade() {
                pipeline.flush_due(&chat, id).await;
            }
        });
        ChunkTimer { id, handle }
    }

    /// Timer-triggered flush. The timer detaches itself first so a concurrent
    /// flush cannot abort the task while it is sending.
    async fn flush_due(&self, chat_id: &str, timer_id: u64) {
        {
            let mut chats = self.chats.lock().await;
            let Some(slot) = chats.get_mut(chat_id) else {
                return;
            };
            match &slot.timer {
                Some(timer) if timer.id == timer_id => slot.timer = None,
                // Superseded by a flush that already cancelled this timer.
                _ => return,
            }
        }

        let outcome = self.flush(chat_id).await;
        if let FlushOutcome::Delivered { count } = outcome {
            info!(
                session_id = %self.session_id,
                chat_id = %chat_id,
                count,
                "chunk interval elapsed, batch delivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use herald_core::HeraldError;
    use proptest::prelude::*;

    use super::*;

    /// Records batches and fails the calls whose 0-based index is scripted.
    #[derive(Default)]
    struct ScriptedSender {
        batches: StdMutex<Vec<MessageBatch>>,
        failures: StdMutex<Vec<usize>>,
        calls: AtomicU64,
    }

    impl ScriptedSender {
        fn failing_on(calls: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                failures: StdMutex::new(calls.to_vec()),
                ..Self::default()
            })
        }

        fn batches(&self) -> Vec<MessageBatch> {
            self.batches.lock().unwrap().clone()
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DownstreamSender for ScriptedSender {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, batch: &MessageBatch) -> Result<(), HeraldError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if self.failures.lock().unwrap().contains(&call) {
                return Err(HeraldError::downstream("scripted failure", None));
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    fn msg(chat: &str, n: usize) -> InboundMessage {
        InboundMessage {
            id: format!("{chat}-{n}"),
            chat_id: chat.to_string(),
            sender_id: "u1".to_string(),
            body: format!("message {n}"),
            timestamp: Utc::now(),
            is_group: false,
            from_me: false,
            has_media: false,
            media: None,
            contact: None,
        }
    }

    fn pipeline(
        chunk_size: usize,
        cap: Option<usize>,
        sender: Arc<ScriptedSender>,
    ) -> Arc<DeliveryPipeline> {
        DeliveryPipeline::new(
            SessionId::parse("s1").unwrap(),
            DeliverySettings {
                chunk_size,
                chunk_interval: Duration::from_secs(30),
                max_buffered_per_chat: cap,
            },
            sender,
        )
    }

    fn ids(batches: &[MessageBatch]) -> Vec<String> {
        batches
            .iter()
            .flat_map(|b| b.messages.iter().map(|m| m.id.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn partial_chunk_flushes_after_interval() {
        let sender = ScriptedSender::failing_on(&[]);
        let pipeline = pipeline(5, None, sender.clone());
        for n in 0..3 {
            pipeline.enqueue(msg("c1", n)).await;
        }
        assert_eq!(sender.calls(), 0);

        tokio::time::sleep(Duration::from_millis(29_999)).await;
        assert_eq!(sender.calls(), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;

        let batches = sender.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].count, 3);
        assert_eq!(ids(&batches), vec!["c1-0", "c1-1", "c1-2"]);
        assert!(!pipeline.has_timer("c1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn exact_chunk_size_flushes_immediately_without_timer() {
        let sender = ScriptedSender::failing_on(&[]);
        let pipeline = pipeline(5, None, sender.clone());
        for n in 0..4 {
            let outcome = pipeline.enqueue(msg("c1", n)).await;
            assert!(matches!(outcome, EnqueueOutcome::Buffered { .. }));
        }
        assert!(pipeline.has_timer("c1").await);
        assert_eq!(pipeline.stats().await.armed_timers, 1);

        let outcome = pipeline.enqueue(msg("c1", 4)).await;
        assert_eq!(
            outcome,
            EnqueueOutcome::Flushed(FlushOutcome::Delivered { count: 5 })
        );
        assert!(!pipeline.has_timer("c1").await);
        assert_eq!(pipeline.pending("c1").await, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_precedes_newer_messages() {
        let sender = ScriptedSender::failing_on(&[0]);
        let pipeline = pipeline(5, None, sender.clone());
        pipeline.enqueue(msg("c1", 0)).await;
        pipeline.enqueue(msg("c1", 1)).await;

        let outcome = pipeline.flush("c1").await;
        assert!(matches!(outcome, FlushOutcome::Requeued { count: 2, .. }));
        assert!(pipeline.has_timer("c1").await);

        pipeline.enqueue(msg("c1", 2)).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        let batches = sender.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(ids(&batches), vec!["c1-0", "c1-1", "c1-2"]);
        assert_eq!(pipeline.stats().await.failed_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chats_flush_independently() {
        let sender = ScriptedSender::failing_on(&[]);
        let pipeline = pipeline(2, None, sender.clone());
        pipeline.enqueue(msg("a", 0)).await;
        pipeline.enqueue(msg("b", 0)).await;
        pipeline.enqueue(msg("a", 1)).await;

        let batches = sender.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].chat_id, "a");
        assert_eq!(pipeline.pending("b").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_reports_every_chat() {
        let sender = ScriptedSender::failing_on(&[1]);
        let pipeline = pipeline(10, None, sender.clone());
        pipeline.enqueue(msg("a", 0)).await;
        pipeline.enqueue(msg("a", 1)).await;
        pipeline.enqueue(msg("b", 0)).await;

        let report = pipeline.flush_all().await;
        assert_eq!(report.chats, 2);
        assert_eq!(report.delivered + report.requeued, 3);
        assert_eq!(report.requeued, if sender.batches()[0].chat_id == "a" { 1 } else { 2 });
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn overflow_drops_oldest_and_warns() {
        let sender = ScriptedSender::failing_on(&[0, 1, 2, 3]);
        let pipeline = pipeline(2, Some(3), sender.clone());
        for n in 0..5 {
            pipeline.enqueue(msg("c1", n)).await;
        }
        assert_eq!(pipeline.pending("c1").await, 3);
        assert!(pipeline.stats().await.dropped_messages >= 2);
        assert!(logs_contain("oldest messages dropped"));
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_timers_and_rejects() {
        let sender = ScriptedSender::failing_on(&[]);
        let pipeline = pipeline(5, None, sender.clone());
        pipeline.enqueue(msg("c1", 0)).await;

        assert_eq!(pipeline.close().await, 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sender.calls(), 0);
        assert_eq!(pipeline.enqueue(msg("c1", 1)).await, EnqueueOutcome::Rejected);
        assert_eq!(pipeline.stats().await.armed_timers, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Concatenated delivered batches equal the enqueue order,
        /// across any pattern of failed sends.
        #[test]
        fn delivered_order_matches_enqueue_order(
            count in 1usize..40,
            chunk_size in 1usize..6,
            failures in proptest::collection::vec(0usize..30, 0..8),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            let delivered = runtime.block_on(async {
                let sender = ScriptedSender::failing_on(&failures);
                let pipeline = pipeline(chunk_size, None, sender.clone());
                for n in 0..count {
                    pipeline.enqueue(msg("c1", n)).await;
                }
                // Timers retry failed batches until the script runs out.
                for _ in 0..40 {
                    if pipeline.pending("c1").await == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(31)).await;
                }
                pipeline.flush("c1").await;
                ids(&sender.batches())
            });

            let expected: Vec<String> = (0..count).map(|n| format!("c1-{n}")).collect();
            prop_assert_eq!(delivered, expected);
        }
    }
}
