// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Publish/subscribe distribution of session status changes.

use chrono::Utc;
use dashmap::DashMap;
use herald_core::{SessionId, StatusEvent, StatusUpdate};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

/// Broadcasts [`StatusUpdate`]s and remembers the latest QR per session.
pub struct StatusFanout {
    tx: broadcast::Sender<StatusUpdate>,
    latest_qr: DashMap<SessionId, String>,
}

impl StatusFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest_qr: DashMap::new(),
        }
    }

    /// Publishes `event` for `session_id`. Having no subscribers is not an error.
    pub fn publish(&self, session_id: &SessionId, event: StatusEvent) {
        match &event {
            StatusEvent::QrReady { qr } => {
                self.latest_qr.insert(session_id.clone(), qr.clone());
            }
            StatusEvent::Connected { .. } | StatusEvent::AuthFailure { .. } => {
                self.latest_qr.remove(session_id.as_str());
            }
            _ => {}
        }

        debug!(session_id = %session_id, event = event.name(), "status published");
        let _ = self.tx.send(StatusUpdate {
            session_id: session_id.clone(),
            event,
            at: Utc::now(),
        });
    }

    /// Receives every update for every session.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }

    /// Receives updates for one session only.
    pub fn subscribe_session(&self, session_id: &SessionId) -> SessionSubscription {
        SessionSubscription {
            session_id: session_id.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// The most recent QR code published for `session_id`, until it authenticates.
    pub fn latest_qr(&self, session_id: &str) -> Option<String> {
        self.latest_qr.get(session_id).map(|qr| qr.value().clone())
    }

    pub fn clear_qr(&self, session_id: &str) {
        self.latest_qr.remove(session_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusFanout {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A [`broadcast::Receiver`] filtered to one session.
pub struct SessionSubscription {
    session_id: SessionId,
    rx: broadcast::Receiver<StatusUpdate>,
}

impl SessionSubscription {
    /// Next update for this session; `None` once the fanout is gone.
    pub async fn recv(&mut self) -> Option<StatusUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) if update.session_id == self.session_id => return Some(update),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %self.session_id,
                        skipped,
                        "status subscriber lagged, updates dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn subscribers_receive_published_updates() {
        let fanout = StatusFanout::default();
        let mut rx = fanout.subscribe();
        fanout.publish(&id("s1"), StatusEvent::QrExpired);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.session_id, id("s1"));
        assert_eq!(update.event, StatusEvent::QrExpired);
    }

    #[tokio::test]
    async fn session_subscription_filters_other_sessions() {
        let fanout = StatusFanout::default();
        let mut sub = fanout.subscribe_session(&id("s2"));
        fanout.publish(&id("s1"), StatusEvent::QrExpired);
        fanout.publish(
            &id("s2"),
            StatusEvent::ListeningStatus { listening: true },
        );
        let update = sub.recv().await.unwrap();
        assert_eq!(update.session_id, id("s2"));
        assert_eq!(update.event.name(), "listening_status");
    }

    #[test]
    fn latest_qr_is_overwritten_then_cleared_on_connect() {
        let fanout = StatusFanout::default();
        fanout.publish(&id("s1"), StatusEvent::QrReady { qr: "one".into() });
        fanout.publish(&id("s1"), StatusEvent::QrReady { qr: "two".into() });
        assert_eq!(fanout.latest_qr("s1").as_deref(), Some("two"));

        fanout.publish(
            &id("s1"),
            StatusEvent::Connected {
                ready_at: Utc::now(),
            },
        );
        assert!(fanout.latest_qr("s1").is_none());
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let fanout = StatusFanout::default();
        assert_eq!(fanout.subscriber_count(), 0);
        fanout.publish(&id("s1"), StatusEvent::QrExpired);
    }
}
