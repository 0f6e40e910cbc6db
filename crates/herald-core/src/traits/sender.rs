// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Downstream sender seam: the consumer that receives flushed message batches.

use async_trait::async_trait;

use crate::error::HeraldError;
use crate::types::MessageBatch;

/// Receives message batches flushed by the delivery pipeline.
///
/// Retried batches may overlap previously attempted content; deduplication
/// is the receiver's job. An `Err` means the batch was not delivered and
/// will be requeued.
#[async_trait]
pub trait DownstreamSender: Send + Sync + 'static {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Delivers one batch.
    async fn send(&self, batch: &MessageBatch) -> Result<(), HeraldError>;
}
