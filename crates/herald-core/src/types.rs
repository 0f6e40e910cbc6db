// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared by the session core, its adapters, and the engine seam.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::HeraldError;

/// Maximum length of a session id.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Ids that collide with adapter routes or bulk operations.
pub const RESERVED_SESSION_IDS: &[&str] = &[
    "all", "stats", "status", "sessions", "cleanup", "health", "restore", "new",
];

/// Stable external key of a managed session.
///
/// Construction goes through [`SessionId::parse`], so a value of this type is
/// always 1..=64 characters of `[A-Za-z0-9_-]` and never a reserved word.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validates and wraps a raw session id.
    pub fn parse(raw: &str) -> Result<Self, HeraldError> {
        if raw.is_empty() {
            return Err(HeraldError::InvalidInput(
                "session id must not be empty".to_string(),
            ));
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(HeraldError::InvalidInput(format!(
                "session id must be at most {MAX_SESSION_ID_LEN} characters, got {}",
                raw.len()
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(HeraldError::InvalidInput(format!(
                "session id `{raw}` contains invalid character `{bad}`"
            )));
        }
        if RESERVED_SESSION_IDS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(raw))
        {
            return Err(HeraldError::InvalidInput(format!(
                "session id `{raw}` is reserved"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = HeraldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SessionId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a managed session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Initializing,
    AwaitingAuth,
    Authenticated,
    Connected,
    Listening,
    Disconnected,
    Reconnecting,
    Failed,
    Destroyed,
}

impl SessionState {
    /// True while the engine reports a usable connection.
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Listening)
    }

    /// True for states that no engine event can leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Destroyed)
    }
}

/// Connection state as reported by the client engine's state query.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Opening,
    Pairing,
    Unpaired,
    UnpairedIdle,
    Conflict,
    Timeout,
    Unlaunched,
    DeprecatedVersion,
    Proxyblock,
    TosBlock,
    SmbTosBlock,
    #[serde(other)]
    Unknown,
}

impl ConnectionState {
    /// Parses an engine-reported state, mapping anything unrecognized to `Unknown`.
    pub fn parse_lossy(raw: &str) -> Self {
        raw.trim().parse().unwrap_or(ConnectionState::Unknown)
    }

    /// The stored pairing is gone and a fresh QR scan is required.
    pub fn needs_pairing(self) -> bool {
        matches!(self, ConnectionState::Unpaired | ConnectionState::UnpairedIdle)
    }

    /// The engine is wedged in a way that resuming cannot fix.
    pub fn is_unrecoverable_conflict(self) -> bool {
        matches!(
            self,
            ConnectionState::Conflict | ConnectionState::Timeout | ConnectionState::Unlaunched
        )
    }
}

/// Downloaded media attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub mimetype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Base64-encoded payload.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Contact details resolved through the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default)]
    pub is_business: bool,
}

/// A chat as listed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub unread_count: u32,
}

/// An inbound chat message.
///
/// Immutable once buffered; ordering inside a chat buffer is arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactInfo>,
}

impl InboundMessage {
    /// Broadcast lists and status updates share the `@broadcast` suffix.
    pub fn is_broadcast(&self) -> bool {
        self.chat_id.ends_with("@broadcast")
    }
}

/// A chunk of buffered messages for one chat, handed to the downstream sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageBatch {
    pub session_id: String,
    pub chat_id: String,
    pub messages: Vec<InboundMessage>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

impl MessageBatch {
    /// Builds a batch stamped with the current time.
    pub fn new(session_id: &SessionId, chat_id: &str, messages: Vec<InboundMessage>) -> Self {
        Self {
            session_id: session_id.to_string(),
            chat_id: chat_id.to_string(),
            count: messages.len(),
            messages,
            timestamp: Utc::now(),
        }
    }
}

/// A status change published to fanout subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    QrReady { qr: String },
    Connected { ready_at: DateTime<Utc> },
    Disconnected { reason: String },
    QrExpired,
    StateChange { state: String },
    AuthFailure { message: String },
    ClientError { message: String },
    ListeningStatus { listening: bool },
}

impl StatusEvent {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::QrReady { .. } => "qr_ready",
            StatusEvent::Connected { .. } => "connected",
            StatusEvent::Disconnected { .. } => "disconnected",
            StatusEvent::QrExpired => "qr_expired",
            StatusEvent::StateChange { .. } => "state_change",
            StatusEvent::AuthFailure { .. } => "auth_failure",
            StatusEvent::ClientError { .. } => "client_error",
            StatusEvent::ListeningStatus { .. } => "listening_status",
        }
    }
}

/// A [`StatusEvent`] addressed to one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub event: StatusEvent,
    pub at: DateTime<Utc>,
}
