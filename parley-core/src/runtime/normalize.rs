// File: src/runtime/normalize.rs
//
// Turns raw plugin events into runtime events, applying their side effects on session
// state and the conversation table on the way.

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

use parley_common::models::{
    normalize_name, BuddyRef, ConversationKind, InboundEvent, MessageFlags, ProtocolEvent,
    RuntimeEvent, SessionHandle,
};

use crate::conversations::ConversationTable;
use crate::dispatch::AuthorizationRequest;
use crate::platforms::session::SessionManager;

#[derive(Debug, PartialEq)]
pub(crate) enum Normalized {
    Dispatch(RuntimeEvent),
    Authorize(AuthorizationRequest),
    /// Consumed by the runtime itself.
    Absorbed,
}

pub(crate) fn normalize(
    handle: SessionHandle,
    event: ProtocolEvent,
    sessions: &mut SessionManager,
    conversations: &mut ConversationTable,
    now: DateTime<Utc>,
) -> Normalized {
    let Some(session) = sessions.session(handle) else {
        return Normalized::Absorbed;
    };
    let account = session.account_id();
    let epoch = session.epoch();
    let own_name = normalize_name(&session.account().username);

    match event {
        ProtocolEvent::SignedOn => Normalized::Dispatch(RuntimeEvent::SignedOn { session: handle, account }),

        ProtocolEvent::SignedOff => {
            sessions.mark_signed_off(handle);
            conversations.invalidate_session(handle);
            Normalized::Dispatch(RuntimeEvent::SignedOff { session: handle, account })
        }

        ProtocolEvent::ConnectionError { reason, description, fatal } => {
            if fatal {
                warn!("(EventLoop) {} fatal connection error => {}: {}", handle, reason, description);
                sessions.mark_failed(handle);
                conversations.invalidate_session(handle);
            } else {
                warn!("(EventLoop) {} connection error => {}: {}", handle, reason, description);
            }
            Normalized::Dispatch(RuntimeEvent::ConnectionError {
                session: handle,
                account,
                reason,
                description,
            })
        }

        ProtocolEvent::Message { kind, conversation, who, body, mut flags, timestamp } => {
            let conv = conversations.lookup_or_create(handle, epoch, kind, &conversation, now);
            let author = who.unwrap_or(conversation);
            let sender = sessions.resolve_sender(handle, &author);

            if normalize_name(sender.id()) == own_name {
                flags |= MessageFlags::SELF_ECHO;
            } else if kind == ConversationKind::Chat && mentions(&body, &own_name) {
                flags |= MessageFlags::NICK_MENTION;
            }

            Normalized::Dispatch(RuntimeEvent::Message(InboundEvent {
                conversation: conv,
                sender,
                body,
                flags,
                timestamp,
            }))
        }

        ProtocolEvent::ChatJoined { room } => {
            sessions.mark_joined(handle, &room);
            let conv = conversations.lookup_or_create(handle, epoch, ConversationKind::Chat, &room, now);
            Normalized::Dispatch(RuntimeEvent::ChatJoined { conversation: conv })
        }

        ProtocolEvent::BuddyJoined { room, who } => {
            let conv = conversations.lookup_or_create(handle, epoch, ConversationKind::Chat, &room, now);
            let buddy = sessions.resolve_sender(handle, &who);
            Normalized::Dispatch(RuntimeEvent::BuddyJoined { conversation: conv, buddy })
        }

        ProtocolEvent::BuddyListed { name, alias } => {
            sessions.learn_buddy(handle, BuddyRef { name, alias });
            Normalized::Absorbed
        }

        ProtocolEvent::BuddyPresence { name, online } => {
            sessions.set_presence(handle, &name, online);
            Normalized::Absorbed
        }

        ProtocolEvent::AuthorizationRequest { remote_user, message, on_list } => {
            Normalized::Authorize(AuthorizationRequest {
                session: handle,
                remote_user,
                message,
                on_list,
            })
        }
    }
}

/// Whether `nick` appears in `body` as a whole word, ignoring case.
fn mentions(body: &str, nick: &str) -> bool {
    if nick.is_empty() {
        return false;
    }
    Regex::new(&format!(r"(?i)(^|\W){}(\W|$)", regex::escape(nick)))
        .map(|re| re.is_match(body))
        .unwrap_or(false)
}
