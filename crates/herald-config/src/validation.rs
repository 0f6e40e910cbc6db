// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.
//!
//! Checks constraints serde attributes cannot express: positive thresholds,
//! delay ordering, disjoint reason lists, and contradictory filters.

use std::collections::HashSet;

use crate::diagnostic::ConfigError;
use crate::model::HeraldConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration for semantic correctness.
///
/// Collects every violation instead of stopping at the first.
pub fn validate_config(config: &HeraldConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if !LOG_LEVELS.contains(&config.service.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ConfigError::validation(format!(
            "service.log_level must be one of {}, got `{}`",
            LOG_LEVELS.join(", "),
            config.service.log_level
        )));
    }

    if config.service.max_sessions == 0 {
        errors.push(ConfigError::validation(
            "service.max_sessions must be at least 1",
        ));
    }

    if config.service.max_sessions_per_owner == Some(0) {
        errors.push(ConfigError::validation(
            "service.max_sessions_per_owner must be at least 1 when set",
        ));
    }

    if config.engine.init_timeout_secs == 0 {
        errors.push(ConfigError::validation(
            "engine.init_timeout_secs must be at least 1",
        ));
    }

    if let Some(command) = &config.engine.bridge.command
        && command.trim().is_empty()
    {
        errors.push(ConfigError::validation(
            "engine.bridge.command must not be empty when set",
        ));
    }

    if config.engine.bridge.request_timeout_secs == 0 {
        errors.push(ConfigError::validation(
            "engine.bridge.request_timeout_secs must be at least 1",
        ));
    }

    validate_delivery(config, &mut errors);
    validate_reconnect(config, &mut errors);

    if config.filters.ignore_groups && config.filters.ignore_non_groups {
        errors.push(ConfigError::validation(
            "filters.ignore_groups and filters.ignore_non_groups cannot both be true; every message would be dropped",
        ));
    }

    if config.restore.orphan_sweep_interval_secs == 0 {
        errors.push(ConfigError::validation(
            "restore.orphan_sweep_interval_secs must be at least 1",
        ));
    }

    if config.sweeper.interval_secs == 0 {
        errors.push(ConfigError::validation(
            "sweeper.interval_secs must be at least 1",
        ));
    }

    if let Some(url) = &config.webhook.url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        errors.push(ConfigError::validation(format!(
            "webhook.url must start with http:// or https://, got `{url}`"
        )));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_delivery(config: &HeraldConfig, errors: &mut Vec<ConfigError>) {
    let delivery = &config.delivery;

    if delivery.chunk_size == 0 {
        errors.push(ConfigError::validation(
            "delivery.chunk_size must be at least 1",
        ));
    }

    if delivery.chunk_interval_ms == 0 {
        errors.push(ConfigError::validation(
            "delivery.chunk_interval_ms must be at least 1",
        ));
    }

    if let Some(cap) = delivery.max_buffered_per_chat
        && cap < delivery.chunk_size
    {
        errors.push(ConfigError::validation(format!(
            "delivery.max_buffered_per_chat ({cap}) must be at least delivery.chunk_size ({})",
            delivery.chunk_size
        )));
    }
}

fn validate_reconnect(config: &HeraldConfig, errors: &mut Vec<ConfigError>) {
    let reconnect = &config.reconnect;

    if !reconnect.factor.is_finite() || reconnect.factor < 1.0 {
        errors.push(ConfigError::validation(format!(
            "reconnect.factor must be a finite number >= 1.0, got {}",
            reconnect.factor
        )));
    }

    if reconnect.base_delay_ms > reconnect.max_delay_ms {
        errors.push(ConfigError::validation(format!(
            "reconnect.base_delay_ms ({}) must not exceed reconnect.max_delay_ms ({})",
            reconnect.base_delay_ms, reconnect.max_delay_ms
        )));
    }

    if !(0.0..1.0).contains(&reconnect.jitter_ratio) {
        errors.push(ConfigError::validation(format!(
            "reconnect.jitter_ratio must be in [0, 1), got {}",
            reconnect.jitter_ratio
        )));
    }

    let permanent: HashSet<String> = reconnect
        .permanent_reasons
        .iter()
        .map(|r| r.to_ascii_uppercase())
        .collect();
    let mut overlap: Vec<&String> = reconnect
        .transient_reasons
        .iter()
        .filter(|r| permanent.contains(&r.to_ascii_uppercase()))
        .collect();
    overlap.sort();
    overlap.dedup();
    for reason in overlap {
        errors.push(ConfigError::validation(format!(
            "reconnect reason `{reason}` is listed as both permanent and transient"
        )));
    }
}
