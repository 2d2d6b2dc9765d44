//! Stateless structural validity filters.
//!
//! Spam floods routinely fake stanza shapes a real client never produces;
//! these checks reject the two cheapest tells without keeping any state.

use crate::filter::SpamFilter;
use crate::session::Session;
use crate::stanza::{Stanza, StanzaKind, StanzaType};

/// Rejects error-typed messages that carry no error payload.
///
/// A message of type `error` without an error child is not a legal stanza;
/// real servers never produce it, spam injectors do.
pub struct MessageErrorEnsureErrorChild;

pub const MESSAGE_ERROR_ID: &str = "message-error-ensure-error-child";

impl SpamFilter for MessageErrorEnsureErrorChild {
    fn id(&self) -> &'static str {
        MESSAGE_ERROR_ID
    }

    fn filter(&self, stanza: &Stanza, _session: Option<&Session>) -> bool {
        if stanza.kind() != StanzaKind::Message || stanza.stanza_type() != Some(StanzaType::Error) {
            return true;
        }
        stanza.has_error_payload()
    }
}

/// Rejects groupchat messages addressed to the session owner's bare jid.
///
/// A legitimate groupchat message delivered to a user is always addressed to
/// the full jid of the joined resource; a bare-jid destination means the
/// sender never joined the room and is spamming through it.
pub struct MucMessageEnsureToFullJid;

pub const MUC_TO_FULL_JID_ID: &str = "muc-message-ensure-to-full-jid";

impl SpamFilter for MucMessageEnsureToFullJid {
    fn id(&self) -> &'static str {
        MUC_TO_FULL_JID_ID
    }

    fn filter(&self, stanza: &Stanza, session: Option<&Session>) -> bool {
        if stanza.kind() != StanzaKind::Message
            || stanza.stanza_type() != Some(StanzaType::Groupchat)
        {
            return true;
        }
        // Without an authorized session we cannot tell whether the message is
        // incoming to the user at all; rejecting here caused redelivery
        // problems on reconnect, so allow.
        let Some(session) = session else {
            return true;
        };
        if !session.is_authorized() {
            return true;
        }
        match stanza.to() {
            Some(to) if session.is_own_identity(to.bare()) => to.resource().is_some(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryAccountRepository;
    use crate::stanza::{ConnectionId, Jid};
    use std::sync::Arc;

    #[test]
    fn error_message_without_payload_is_rejected() {
        let filter = MessageErrorEnsureErrorChild;
        let from: Jid = "spammer@evil.example".parse().unwrap();
        let to: Jid = "victim@example.com".parse().unwrap();

        let bogus = Stanza::new(StanzaKind::Message)
            .with_type(StanzaType::Error)
            .with_from(from.clone())
            .with_to(to.clone());
        assert!(!filter.filter(&bogus, None));

        let genuine = Stanza::new(StanzaKind::Message)
            .with_type(StanzaType::Error)
            .with_from(from.clone())
            .with_to(to.clone())
            .with_error_payload();
        assert!(filter.filter(&genuine, None));

        let chat = Stanza::message(from, to, "hello");
        assert!(filter.filter(&chat, None));
    }

    fn muc_message(to: &str) -> Stanza {
        let from: Jid = "room@muc.example.com/nick".parse().unwrap();
        let to: Jid = to.parse().unwrap();
        Stanza::new(StanzaKind::Message)
            .with_type(StanzaType::Groupchat)
            .with_from(from)
            .with_to(to)
            .with_body("room chatter")
    }

    fn user_session() -> Session {
        let jid: Jid = "user@example.com/desktop".parse().unwrap();
        Session::authorized(ConnectionId(1), jid, Arc::new(MemoryAccountRepository::new()))
    }

    #[test]
    fn groupchat_to_bare_own_jid_is_rejected() {
        let filter = MucMessageEnsureToFullJid;
        let session = user_session();

        assert!(!filter.filter(&muc_message("user@example.com"), Some(&session)));
        assert!(filter.filter(&muc_message("user@example.com/desktop"), Some(&session)));
        // Someone else's traffic is not ours to judge.
        assert!(filter.filter(&muc_message("other@example.com"), Some(&session)));
    }

    #[test]
    fn groupchat_without_authorized_session_is_allowed() {
        let filter = MucMessageEnsureToFullJid;
        assert!(filter.filter(&muc_message("user@example.com"), None));

        let anon = Session::anonymous(ConnectionId(2));
        assert!(filter.filter(&muc_message("user@example.com"), Some(&anon)));
    }
}
