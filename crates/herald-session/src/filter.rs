// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide inbound message filters.

use std::collections::HashSet;

use herald_config::model::FilterConfig;
use herald_core::InboundMessage;

/// Static filters from `[filters]`, evaluated before per-chat filters.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    ignore_groups: bool,
    ignore_broadcast: bool,
    ignore_non_groups: bool,
    ignore_own_messages: bool,
    allowed_groups: HashSet<String>,
    allowed_contacts: HashSet<String>,
}

impl MessageFilter {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            ignore_groups: config.ignore_groups,
            ignore_broadcast: config.ignore_broadcast,
            ignore_non_groups: config.ignore_non_groups,
            ignore_own_messages: config.ignore_own_messages,
            allowed_groups: config.allowed_groups.iter().cloned().collect(),
            allowed_contacts: config.allowed_contacts.iter().cloned().collect(),
        }
    }

    /// The first rule that drops `message`, or `None` if it passes.
    pub fn rejection(&self, message: &InboundMessage) -> Option<&'static str> {
        if self.ignore_own_messages && message.from_me {
            return Some("own message");
        }
        if self.ignore_broadcast && message.is_broadcast() {
            return Some("broadcast");
        }
        if message.is_group {
            if self.ignore_groups {
                return Some("group message");
            }
            if !self.allowed_groups.is_empty() && !self.allowed_groups.contains(&message.chat_id) {
                return Some("group not allowed");
            }
        } else {
            if self.ignore_non_groups {
                return Some("direct message");
            }
            if !self.allowed_contacts.is_empty()
                && !self.allowed_contacts.contains(&message.chat_id)
                && !self.allowed_contacts.contains(&message.sender_id)
            {
                return Some("contact not allowed");
            }
        }
        None
    }

    pub fn accepts(&self, message: &InboundMessage) -> bool {
        self.rejection(message).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(chat_id: &str, is_group: bool) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            chat_id: chat_id.into(),
            sender_id: "111@c.us".into(),
            body: "hello".into(),
            timestamp: chrono::Utc::now(),
            is_group,
            from_me: false,
            has_media: false,
            media: None,
            contact: None,
        }
    }

    #[test]
    fn defaults_drop_broadcast_and_own_messages() {
        let filter = MessageFilter::from_config(&FilterConfig::default());
        assert_eq!(
            filter.rejection(&message("status@broadcast", false)),
            Some("broadcast")
        );
        let mut own = message("111@c.us", false);
        own.from_me = true;
        assert!(!filter.accepts(&own));
        assert!(filter.accepts(&message("111@c.us", false)));
        assert!(filter.accepts(&message("team@g.us", true)));
    }

    #[test]
    fn group_switches() {
        let filter = MessageFilter::from_config(&FilterConfig {
            ignore_groups: true,
            ..FilterConfig::default()
        });
        assert!(!filter.accepts(&message("team@g.us", true)));
        assert!(filter.accepts(&message("111@c.us", false)));

        let filter = MessageFilter::from_config(&FilterConfig {
            ignore_non_groups: true,
            ..FilterConfig::default()
        });
        assert!(filter.accepts(&message("team@g.us", true)));
        assert!(!filter.accepts(&message("111@c.us", false)));
    }

    #[test]
    fn allow_lists_only_restrict_their_own_kind() {
        let filter = MessageFilter::from_config(&FilterConfig {
            allowed_groups: vec!["team@g.us".into()],
            ..FilterConfig::default()
        });
        assert!(filter.accepts(&message("team@g.us", true)));
        assert_eq!(
            filter.rejection(&message("other@g.us", true)),
            Some("group not allowed")
        );
        assert!(filter.accepts(&message("222@c.us", false)));

        let filter = MessageFilter::from_config(&FilterConfig {
            allowed_contacts: vec!["111@c.us".into()],
            ..FilterConfig::default()
        });
        assert!(filter.accepts(&message("111@c.us", false)));
        let mut stranger = message("333@c.us", false);
        stranger.sender_id = "333@c.us".into();
        assert!(!filter.accepts(&stranger));
    }
}
