// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Herald session multiplexer.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Herald configuration.
///
/// Loaded from TOML files following the XDG hierarchy, with environment
/// variable overrides. Every section is optional and defaults sensibly.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeraldConfig {
    /// Process identity, quotas, and the credential directory.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Client engine binding.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-chat buffering and chunked delivery.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Disconnect classification and backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Boot-time restoration of persisted sessions.
    #[serde(default)]
    pub restore: RestoreConfig,

    /// Periodic expiry sweep.
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Process-wide inbound message filters.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Optional contact and media enrichment.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Webhook downstream sender.
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Service identity and session quotas.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Display name used in logs.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding one `session-<id>` credential directory per session.
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,

    /// Global cap on live sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Optional cap on live sessions per owner.
    #[serde(default)]
    pub max_sessions_per_owner: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            auth_dir: default_auth_dir(),
            max_sessions: default_max_sessions(),
            max_sessions_per_owner: None,
        }
    }
}

fn default_service_name() -> String {
    "herald".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_auth_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("herald").join("auth"))
        .unwrap_or_else(|| PathBuf::from("./.herald_auth"))
}

fn default_max_sessions() -> usize {
    50
}

/// Client engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Bound on `initialize()` during a bind, in seconds.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,

    /// Subprocess bridge that hosts the real client.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout_secs(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

fn default_init_timeout_secs() -> u64 {
    60
}

/// Helper process spawned once per session.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Executable to spawn. Unset means no engine can be bound.
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments placed before the session arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the helper.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Bound on each query sent to the helper, in seconds.
    #[serde(default = "default_bridge_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            request_timeout_secs: default_bridge_request_timeout_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_bridge_request_timeout_secs() -> u64 {
    30
}

/// Chunked delivery thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    /// Buffer length that triggers an immediate flush.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Delay before a partially filled buffer is flushed, in milliseconds.
    #[serde(default = "default_chunk_interval_ms")]
    pub chunk_interval_ms: u64,

    /// Cap on pending messages per chat; the oldest are dropped on overflow.
    #[serde(default = "default_max_buffered_per_chat")]
    pub max_buffered_per_chat: Option<usize>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_interval_ms: default_chunk_interval_ms(),
            max_buffered_per_chat: default_max_buffered_per_chat(),
        }
    }
}

impl DeliveryConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }
}

fn default_chunk_size() -> usize {
    5
}

fn default_chunk_interval_ms() -> u64 {
    30_000
}

fn default_max_buffered_per_chat() -> Option<usize> {
    Some(1000)
}

/// Reconnection policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    /// Attempt ceiling; past it no retry is scheduled.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Symmetric jitter applied to each delay, as a fraction of it.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Reasons that never schedule a retry (case-insensitive).
    #[serde(default = "default_permanent_reasons")]
    pub permanent_reasons: Vec<String>,

    /// Reasons that always schedule a retry (case-insensitive).
    #[serde(default = "default_transient_reasons")]
    pub transient_reasons: Vec<String>,

    /// Whether reasons in neither list are retried.
    #[serde(default = "default_true")]
    pub retry_unclassified: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            permanent_reasons: default_permanent_reasons(),
            transient_reasons: default_transient_reasons(),
            retry_unclassified: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_permanent_reasons() -> Vec<String> {
    ["LOGOUT", "BANNED", "DEPRECATED_VERSION", "UNPAIRED"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_transient_reasons() -> Vec<String> {
    ["NAVIGATION", "CONFLICT", "TIMEOUT", "SYNC_LOST", "UNLAUNCHED"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_true() -> bool {
    true
}

/// Boot-time restoration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreConfig {
    /// Restore persisted sessions when `serve` starts.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long the boot restore waits on each restoration handle.
    #[serde(default = "default_restore_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    /// Age past which an unresolved handle is rejected by the orphan sweep.
    #[serde(default = "default_orphan_max_age_secs")]
    pub orphan_max_age_secs: u64,

    #[serde(default = "default_orphan_sweep_interval_secs")]
    pub orphan_sweep_interval_secs: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_timeout_secs: default_restore_wait_timeout_secs(),
            orphan_max_age_secs: default_orphan_max_age_secs(),
            orphan_sweep_interval_secs: default_orphan_sweep_interval_secs(),
        }
    }
}

fn default_restore_wait_timeout_secs() -> u64 {
    120
}

fn default_orphan_max_age_secs() -> u64 {
    300
}

fn default_orphan_sweep_interval_secs() -> u64 {
    60
}

/// Periodic expiry sweep.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,

    /// A session without an engine and idle this long is expired.
    #[serde(default = "default_inactive_after_secs")]
    pub inactive_after_secs: u64,

    /// Optional absolute lifetime for any session.
    #[serde(default)]
    pub max_session_age_secs: Option<u64>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            inactive_after_secs: default_inactive_after_secs(),
            max_session_age_secs: None,
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    900
}

fn default_inactive_after_secs() -> u64 {
    3600
}

/// Global inbound message filters, evaluated before per-chat filters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub ignore_groups: bool,

    #[serde(default = "default_true")]
    pub ignore_broadcast: bool,

    #[serde(default)]
    pub ignore_non_groups: bool,

    #[serde(default = "default_true")]
    pub ignore_own_messages: bool,

    /// When non-empty, only these group chats pass.
    #[serde(default)]
    pub allowed_groups: Vec<String>,

    /// When non-empty, only these direct-chat contacts pass.
    #[serde(default)]
    pub allowed_contacts: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ignore_groups: false,
            ignore_broadcast: true,
            ignore_non_groups: false,
            ignore_own_messages: true,
            allowed_groups: Vec::new(),
            allowed_contacts: Vec::new(),
        }
    }
}

/// Optional per-message enrichment through the engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentConfig {
    /// Resolve the sender's contact details.
    #[serde(default)]
    pub contacts: bool,

    /// Download media for messages that carry it.
    #[serde(default)]
    pub media: bool,
}

/// Webhook downstream sender.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Target URL. Unset means batches are only logged.
    #[serde(default)]
    pub url: Option<String>,

    /// HMAC-SHA256 signing secret.
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HeraldConfig::default();
        assert_eq!(config.delivery.chunk_size, 5);
        assert_eq!(config.delivery.chunk_interval(), Duration::from_secs(30));
        assert_eq!(config.delivery.max_buffered_per_chat, Some(1000));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay_ms, 5_000);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert!(config.reconnect.retry_unclassified);
        assert!(config.filters.ignore_broadcast);
        assert!(!config.enrichment.contacts);
    }

    #[test]
    fn default_serializes_to_toml() {
        let rendered = toml::to_string(&HeraldConfig::default()).unwrap();
        assert!(rendered.contains("[delivery]"));
        assert!(rendered.contains("chunk_size = 5"));
    }
}
