// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Herald session multiplexer.
//!
//! This crate provides the error taxonomy, the shared types, and the seam
//! traits the session core consumes: the client engine, the downstream
//! sender, and the persisted identity listing.

pub mod error;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::{ErrorKind, HeraldError};
pub use types::{
    ChatSummary, ConnectionState, ContactInfo, InboundMessage, MediaAttachment, MessageBatch,
    SessionId, SessionState, StatusEvent, StatusUpdate,
};

pub use traits::{
    ClientEngine, DownstreamSender, EngineEvent, EngineEventSender, EngineFactory,
    SessionIdentityStore,
};

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::types::RESERVED_SESSION_IDS;

    #[test]
    fn session_id_accepts_valid_ids() {
        let longest = "a".repeat(64);
        for raw in ["s1", "support-bot", "team_42", longest.as_str()] {
            let id = SessionId::parse(raw).expect("should be valid");
            assert_eq!(id.as_str(), raw);
        }
    }

    #[test]
    fn session_id_rejects_empty_and_long_ids() {
        assert!(matches!(
            SessionId::parse(""),
            Err(HeraldError::InvalidInput(_))
        ));
        assert!(matches!(
            SessionId::parse(&"a".repeat(65)),
            Err(HeraldError::InvalidInput(_))
        ));
    }

    #[test]
    fn session_id_rejects_bad_characters() {
        for raw in ["has space", "slash/id", "dot.id", "emoji😀"] {
            let err = SessionId::parse(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{raw} should be rejected");
        }
    }

    #[test]
    fn session_id_rejects_reserved_words_case_insensitively() {
        assert!(SessionId::parse("stats").is_err());
        assert!(SessionId::parse("ALL").is_err());
        assert!(SessionId::parse("Cleanup").is_err());
        assert!(SessionId::parse("statsbot").is_ok());
    }

    #[test]
    fn session_id_deserialization_validates() {
        let ok: SessionId = serde_json::from_str("\"s1\"").unwrap();
        assert_eq!(ok.as_str(), "s1");
        assert!(serde_json::from_str::<SessionId>("\"bad id\"").is_err());
    }

    #[test]
    fn session_state_display_round_trips() {
        let states = [
            SessionState::Created,
            SessionState::Initializing,
            SessionState::AwaitingAuth,
            SessionState::Authenticated,
            SessionState::Connected,
            SessionState::Listening,
            SessionState::Disconnected,
            SessionState::Reconnecting,
            SessionState::Failed,
            SessionState::Destroyed,
        ];
        for state in states {
            let parsed = SessionState::from_str(&state.to_string()).unwrap();
            assert_eq!(parsed, state);
        }
        assert_eq!(SessionState::AwaitingAuth.to_string(), "AWAITING_AUTH");
    }

    #[test]
    fn session_state_predicates() {
        assert!(SessionState::Connected.is_connected());
        assert!(SessionState::Listening.is_connected());
        assert!(!SessionState::Reconnecting.is_connected());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Destroyed.is_terminal());
        assert!(!SessionState::Disconnected.is_terminal());
    }

    #[test]
    fn connection_state_parses_engine_strings() {
        assert_eq!(ConnectionState::parse_lossy("CONNECTED"), ConnectionState::Connected);
        assert_eq!(ConnectionState::parse_lossy("conflict"), ConnectionState::Conflict);
        assert_eq!(
            ConnectionState::parse_lossy("UNPAIRED_IDLE"),
            ConnectionState::UnpairedIdle
        );
        assert_eq!(ConnectionState::parse_lossy("???"), ConnectionState::Unknown);
        assert!(ConnectionState::Unpaired.needs_pairing());
        assert!(ConnectionState::Conflict.is_unrecoverable_conflict());
        assert!(!ConnectionState::Opening.is_unrecoverable_conflict());
    }

    #[test]
    fn connection_state_serde_falls_back_to_unknown() {
        let state: ConnectionState = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(state, ConnectionState::Unknown);
    }

    #[test]
    fn status_update_serializes_flat_with_type_tag() {
        let update = StatusUpdate {
            session_id: SessionId::parse("s1").unwrap(),
            event: StatusEvent::QrReady {
                qr: "2@abc".to_string(),
            },
            at: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["type"], "qr_ready");
        assert_eq!(json["qr"], "2@abc");
        assert_eq!(update.event.name(), "qr_ready");
    }

    #[test]
    fn message_batch_counts_messages() {
        let id = SessionId::parse("s1").unwrap();
        let msg = InboundMessage {
            id: "m1".to_string(),
            chat_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            body: "hi".to_string(),
            timestamp: chrono::Utc::now(),
            is_group: false,
            from_me: false,
            has_media: false,
            media: None,
            contact: None,
        };
        let batch = MessageBatch::new(&id, "c1", vec![msg.clone(), msg]);
        assert_eq!(batch.count, 2);
        assert_eq!(batch.session_id, "s1");
    }

    #[test]
    fn error_kinds_and_retryability() {
        let quota = HeraldError::QuotaExceeded {
            scope: "global".into(),
            limit: 3,
        };
        assert_eq!(quota.kind(), ErrorKind::QuotaExceeded);
        assert!(!quota.is_retryable());

        let timeout = HeraldError::EngineBindTimeout {
            session_id: "s1".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.to_string().contains("s1"));

        assert!(HeraldError::downstream("503", None).is_retryable());
        assert_eq!(ErrorKind::SessionNotFound.to_string(), "session_not_found");
    }

    #[test]
    fn all_trait_seams_are_exported() {
        fn _assert_engine<T: ClientEngine>() {}
        fn _assert_factory<T: EngineFactory>() {}
        fn _assert_sender<T: DownstreamSender>() {}
        fn _assert_identity<T: SessionIdentityStore>() {}
    }

    proptest! {
        #[test]
        fn parsed_session_ids_only_contain_allowed_characters(raw in "[A-Za-z0-9_-]{1,64}") {
            match SessionId::parse(&raw) {
                Ok(id) => prop_assert_eq!(id.as_str(), raw.as_str()),
                Err(_) => prop_assert!(RESERVED_SESSION_IDS
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(&raw))),
            }
        }
    }
}
