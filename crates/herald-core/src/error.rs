// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Herald session multiplexer.

use std::time::Duration;

use strum::{Display, EnumString};
use thiserror::Error;

/// Boxed source error carried by wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The primary error type used across all Herald traits and core operations.
#[derive(Debug, Error)]
pub enum HeraldError {
    /// Malformed caller input (bad session id, bad flags). Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Session creation would exceed a configured quota.
    #[error("quota exceeded: {scope} limit of {limit} sessions reached")]
    QuotaExceeded { scope: String, limit: usize },

    /// The session does not exist (or has already been destroyed).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The client engine did not finish initializing within the bind timeout.
    #[error("engine bind for session {session_id} timed out after {timeout:?}")]
    EngineBindTimeout {
        session_id: String,
        timeout: Duration,
    },

    /// The client engine could not be created or initialized.
    #[error("engine bind for session {session_id} failed: {source}")]
    EngineBindError {
        session_id: String,
        source: BoxError,
    },

    /// A query or command against a bound engine failed.
    #[error("engine error: {message}")]
    Engine {
        message: String,
        source: Option<BoxError>,
    },

    /// The downstream consumer rejected or failed to receive a batch.
    #[error("downstream send failed: {message}")]
    DownstreamSend {
        message: String,
        source: Option<BoxError>,
    },

    /// A restoration handle was rejected before the session became ready.
    #[error("restoration of session {session_id} failed: {reason}")]
    Restoration { session_id: String, reason: String },

    /// A caller-side wait elapsed.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Releasing session resources failed during teardown or a sweep.
    #[error("cleanup of session {session_id} failed: {message}")]
    Cleanup { session_id: String, message: String },

    /// Configuration errors surfaced at runtime.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of [`HeraldError`] for adapters mapping errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    QuotaExceeded,
    SessionNotFound,
    EngineBindTimeout,
    EngineBindError,
    Engine,
    DownstreamSend,
    Restoration,
    Timeout,
    Cleanup,
    Config,
    Internal,
}

impl HeraldError {
    /// Wraps an engine-side failure with an optional source.
    pub fn engine(message: impl Into<String>, source: Option<BoxError>) -> Self {
        HeraldError::Engine {
            message: message.into(),
            source,
        }
    }

    /// Wraps a downstream delivery failure with an optional source.
    pub fn downstream(message: impl Into<String>, source: Option<BoxError>) -> Self {
        HeraldError::DownstreamSend {
            message: message.into(),
            source,
        }
    }

    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeraldError::InvalidInput(_) => ErrorKind::InvalidInput,
            HeraldError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            HeraldError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            HeraldError::EngineBindTimeout { .. } => ErrorKind::EngineBindTimeout,
            HeraldError::EngineBindError { .. } => ErrorKind::EngineBindError,
            HeraldError::Engine { .. } => ErrorKind::Engine,
            HeraldError::DownstreamSend { .. } => ErrorKind::DownstreamSend,
            HeraldError::Restoration { .. } => ErrorKind::Restoration,
            HeraldError::Timeout { .. } => ErrorKind::Timeout,
            HeraldError::Cleanup { .. } => ErrorKind::Cleanup,
            HeraldError::Config(_) => ErrorKind::Config,
            HeraldError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Validation and quota rejections are final; engine and downstream
    /// failures are transient from the caller's point of view.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HeraldError::EngineBindTimeout { .. }
                | HeraldError::EngineBindError { .. }
                | HeraldError::Engine { .. }
                | HeraldError::DownstreamSend { .. }
                | HeraldError::Timeout { .. }
        )
    }
}
