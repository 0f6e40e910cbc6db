// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client engine seam: the external chat client that pairs, connects, and
//! emits protocol events for one session.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::HeraldError;
use crate::types::{ChatSummary, ConnectionState, ContactInfo, InboundMessage, MediaAttachment, SessionId};

/// Protocol events emitted by a client engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A pairing QR code is available. Repeats until the code is scanned.
    Qr(String),
    /// Pairing succeeded or stored credentials were accepted.
    Authenticated,
    /// The connection is fully usable.
    Ready,
    /// The engine's connection state changed.
    ChangeState(ConnectionState),
    /// Stored credentials were rejected.
    AuthFailure(String),
    /// The connection dropped, with the engine's reason string.
    Disconnected(String),
    /// A non-fatal engine error.
    Error(String),
    /// An inbound chat message.
    Message(InboundMessage),
}

/// Sending half handed to an engine for its event stream.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// A live client engine bound to a single session.
///
/// Handles are never mutated across reconnects: a session destroys the old
/// handle and asks its [`EngineFactory`] for a new one.
#[async_trait]
pub trait ClientEngine: Send + Sync + 'static {
    /// Begins authentication and connection. Events follow on the event stream.
    async fn initialize(&self) -> Result<(), HeraldError>;

    /// Queries the current connection state.
    async fn state(&self) -> Result<ConnectionState, HeraldError>;

    /// Lists the chats known to the engine.
    async fn chats(&self) -> Result<Vec<ChatSummary>, HeraldError>;

    /// Looks up a contact by id.
    async fn contact(&self, contact_id: &str) -> Result<Option<ContactInfo>, HeraldError>;

    /// Downloads the media attached to a message, if any.
    async fn download_media(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<MediaAttachment>, HeraldError>;

    /// Releases all engine resources.
    async fn destroy(&self) -> Result<(), HeraldError>;
}

/// Creates engine handles for sessions.
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    /// Creates a fresh, uninitialized engine for `session_id` that reports
    /// its events on `events`.
    async fn create(
        &self,
        session_id: &SessionId,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ClientEngine>, HeraldError>;
}
