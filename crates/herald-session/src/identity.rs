// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lists persisted session identities under the configured auth directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use herald_core::{HeraldError, SessionId, SessionIdentityStore};
use tracing::{debug, warn};

/// Directory-name prefix of one session's credential directory.
pub const SESSION_DIR_PREFIX: &str = "session-";

/// Reads `session-<id>` directories beneath `auth_dir`.
#[derive(Debug, Clone)]
pub struct DiskIdentityStore {
    auth_dir: PathBuf,
}

impl DiskIdentityStore {
    pub fn new(auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            auth_dir: auth_dir.into(),
        }
    }

    pub fn auth_dir(&self) -> &Path {
        &self.auth_dir
    }

    /// Credential directory for `id`. The engine owns its contents.
    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.auth_dir.join(format!("{SESSION_DIR_PREFIX}{id}"))
    }
}

#[async_trait]
impl SessionIdentityStore for DiskIdentityStore {
    async fn list(&self) -> Result<Vec<SessionId>, HeraldError> {
        let mut entries = match tokio::fs::read_dir(&self.auth_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(auth_dir = %self.auth_dir.display(), "auth directory missing, nothing to restore");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(HeraldError::Internal(format!(
                    "failed to read auth directory {}: {e}",
                    self.auth_dir.display()
                )));
            }
        };

        let mut ids = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(HeraldError::Internal(format!(
                        "failed to list auth directory {}: {e}",
                        self.auth_dir.display()
                    )));
                }
            };
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name();
            let Some(raw) = name.to_str().and_then(|n| n.strip_prefix(SESSION_DIR_PREFIX)) else {
                continue;
            };
            match SessionId::parse(raw) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(entry = raw, error = %e, "skipping invalid persisted session id"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
