// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock downstream sender for deterministic testing.
//!
//! `MockSender` captures every successfully delivered batch and can be
//! scripted to fail specific calls so requeue behavior can be asserted.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use herald_core::{DownstreamSender, HeraldError, MessageBatch};
use tokio::sync::{Mutex, Notify};

/// A downstream sender double.
///
/// Calls are numbered from zero in arrival order; scripted failures refer
/// to those numbers.
pub struct MockSender {
    delivered: Arc<Mutex<Vec<MessageBatch>>>,
    attempts: Arc<Mutex<usize>>,
    failing_calls: Arc<Mutex<HashSet<usize>>>,
    fail_all: Arc<Mutex<bool>>,
    notify: Arc<Notify>,
}

impl MockSender {
    pub fn new() -> Self {
        Self {
            delivered: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(Mutex::new(0)),
            failing_calls: Arc::new(Mutex::new(HashSet::new())),
            fail_all: Arc::new(Mutex::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A sender whose calls with the given indices fail.
    pub fn failing_on(calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            failing_calls: Arc::new(Mutex::new(calls.into_iter().collect())),
            ..Self::new()
        }
    }

    /// Fails the next `count` calls.
    pub async fn fail_next(&self, count: usize) {
        let next = *self.attempts.lock().await;
        self.failing_calls.lock().await.extend(next..next + count);
    }

    /// Fails every call until switched back.
    pub async fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock().await = fail;
    }

    /// Batches the sender accepted, in delivery order.
    pub async fn batches(&self) -> Vec<MessageBatch> {
        self.delivered.lock().await.clone()
    }

    /// Total send attempts, failed ones included.
    pub async fn attempts(&self) -> usize {
        *self.attempts.lock().await
    }

    /// Ids of delivered messages for one chat, concatenated across batches.
    pub async fn delivered_ids(&self, chat_id: &str) -> Vec<String> {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|batch| batch.chat_id == chat_id)
            .flat_map(|batch| batch.messages.iter().map(|m| m.id.clone()))
            .collect()
    }

    /// Waits until at least `count` batches were delivered.
    pub async fn wait_for_batches(&self, count: usize) -> Vec<MessageBatch> {
        loop {
            let notified = self.notify.notified();
            {
                let delivered = self.delivered.lock().await;
                if delivered.len() >= count {
                    return delivered.clone();
                }
            }
            notified.await;
        }
    }
}

impl Default for MockSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownstreamSender for MockSender {
    fn name(&self) -> &str {
        "mock-sender"
    }

    async fn send(&self, batch: &MessageBatch) -> Result<(), HeraldError> {
        let call = {
            let mut attempts = self.attempts.lock().await;
            let call = *attempts;
            *attempts += 1;
            call
        };
        let fail = *self.fail_all.lock().await || self.failing_calls.lock().await.contains(&call);
        if fail {
            return Err(HeraldError::downstream(
                format!("scripted failure on call {call}"),
                None,
            ));
        }
        self.delivered.lock().await.push(batch.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::SessionId;

    fn batch(chat: &str) -> MessageBatch {
        MessageBatch::new(&SessionId::parse("s1").unwrap(), chat, Vec::new())
    }

    #[tokio::test]
    async fn scripted_calls_fail_and_are_not_captured() {
        let sender = MockSender::failing_on([1]);
        assert!(sender.send(&batch("a")).await.is_ok());
        assert!(sender.send(&batch("b")).await.is_err());
        assert!(sender.send(&batch("c")).await.is_ok());

        let chats: Vec<String> = sender.batches().await.into_iter().map(|b| b.chat_id).collect();
        assert_eq!(chats, vec!["a", "c"]);
        assert_eq!(sender.attempts().await, 3);
    }

    #[tokio::test]
    async fn fail_next_counts_from_current_call() {
        let sender = MockSender::new();
        assert!(sender.send(&batch("a")).await.is_ok());
        sender.fail_next(2).await;
        assert!(sender.send(&batch("a")).await.is_err());
        assert!(sender.send(&batch("a")).await.is_err());
        assert!(sender.send(&batch("a")).await.is_ok());
    }
}
