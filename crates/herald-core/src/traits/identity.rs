// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session identity persistence seam used for boot-time restoration.

use async_trait::async_trait;

use crate::error::HeraldError;
use crate::types::SessionId;

/// Lists the sessions whose credentials survive a restart.
///
/// Only the listing is a contract here; the credential format is owned by
/// the client engine.
#[async_trait]
pub trait SessionIdentityStore: Send + Sync + 'static {
    /// Returns every persisted session id.
    async fn list(&self) -> Result<Vec<SessionId>, HeraldError>;
}
