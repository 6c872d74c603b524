// File: parley-common/src/models/event.rs

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConnectReason;
use super::account::AccountId;
use super::conversation::{Conversation, ConversationKind};
use super::session::SessionHandle;

/// Bit set describing how a message reached us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    /// Sent by someone else to us.
    pub const RECEIVED: MessageFlags = MessageFlags(1 << 0);
    /// Our own outbound message echoed back by the server.
    pub const SELF_ECHO: MessageFlags = MessageFlags(1 << 1);
    /// Mentions our nick (chats).
    pub const NICK_MENTION: MessageFlags = MessageFlags(1 << 2);
    pub const SYSTEM: MessageFlags = MessageFlags(1 << 3);
    /// Delivered from offline storage or room backlog.
    pub const DELAYED: MessageFlags = MessageFlags(1 << 4);

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MessageFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;
    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: MessageFlags) {
        self.insert(rhs);
    }
}

/// A buddy the session's buddy list knows about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuddyRef {
    pub name: String,
    pub alias: Option<String>,
}

impl BuddyRef {
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Message author, resolved once when the protocol event is normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sender {
    Known(BuddyRef),
    Unresolved(String),
}

impl Sender {
    /// Protocol-level id of the author.
    pub fn id(&self) -> &str {
        match self {
            Sender::Known(buddy) => &buddy.name,
            Sender::Unresolved(name) => name,
        }
    }

    /// Human-facing name: buddy alias when we have one.
    pub fn alias(&self) -> &str {
        match self {
            Sender::Known(buddy) => buddy.display_name(),
            Sender::Unresolved(name) => name,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Raw event as produced by a protocol plugin's `poll_events`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    SignedOn,
    SignedOff,
    ConnectionError {
        reason: ConnectReason,
        description: String,
        /// Fatal errors move the session to `Failed`.
        fatal: bool,
    },
    Message {
        kind: ConversationKind,
        /// Peer id for direct messages, room id for chats.
        conversation: String,
        /// Author; `None` means the conversation name is the author.
        who: Option<String>,
        body: String,
        flags: MessageFlags,
        timestamp: DateTime<Utc>,
    },
    ChatJoined {
        room: String,
    },
    BuddyJoined {
        room: String,
        who: String,
    },
    /// Buddy list entry learned from the server.
    BuddyListed {
        name: String,
        alias: Option<String>,
    },
    BuddyPresence {
        name: String,
        online: bool,
    },
    /// Remote user asks to add us to their list.
    AuthorizationRequest {
        remote_user: String,
        message: Option<String>,
        on_list: bool,
    },
}

/// A message ready for handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub conversation: Conversation,
    pub sender: Sender,
    pub body: String,
    pub flags: MessageFlags,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn is_received(&self) -> bool {
        self.flags.contains(MessageFlags::RECEIVED) && !self.is_self_echo()
    }

    pub fn is_self_echo(&self) -> bool {
        self.flags.contains(MessageFlags::SELF_ECHO)
    }

    pub fn mentions_us(&self) -> bool {
        self.flags.contains(MessageFlags::NICK_MENTION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SignedOn,
    SignedOff,
    MessageReceived,
    ChatJoined,
    BuddyJoined,
    ConnectionError,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::SignedOn => "signed_on",
            EventKind::SignedOff => "signed_off",
            EventKind::MessageReceived => "message_received",
            EventKind::ChatJoined => "chat_joined",
            EventKind::BuddyJoined => "buddy_joined",
            EventKind::ConnectionError => "connection_error",
        };
        write!(f, "{}", s)
    }
}

/// Normalized event handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    SignedOn {
        session: SessionHandle,
        account: AccountId,
    },
    SignedOff {
        session: SessionHandle,
        account: AccountId,
    },
    Message(InboundEvent),
    ChatJoined {
        conversation: Conversation,
    },
    BuddyJoined {
        conversation: Conversation,
        buddy: Sender,
    },
    ConnectionError {
        session: SessionHandle,
        account: AccountId,
        reason: ConnectReason,
        description: String,
    },
}

impl RuntimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RuntimeEvent::SignedOn { .. } => EventKind::SignedOn,
            RuntimeEvent::SignedOff { .. } => EventKind::SignedOff,
            RuntimeEvent::Message(_) => EventKind::MessageReceived,
            RuntimeEvent::ChatJoined { .. } => EventKind::ChatJoined,
            RuntimeEvent::BuddyJoined { .. } => EventKind::BuddyJoined,
            RuntimeEvent::ConnectionError { .. } => EventKind::ConnectionError,
        }
    }

    pub fn session(&self) -> SessionHandle {
        match self {
            RuntimeEvent::SignedOn { session, .. }
            | RuntimeEvent::SignedOff { session, .. }
            | RuntimeEvent::ConnectionError { session, .. } => *session,
            RuntimeEvent::Message(msg) => msg.conversation.session,
            RuntimeEvent::ChatJoined { conversation }
            | RuntimeEvent::BuddyJoined { conversation, .. } => conversation.session,
        }
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        match self {
            RuntimeEvent::Message(msg) => Some(&msg.conversation),
            RuntimeEvent::ChatJoined { conversation }
            | RuntimeEvent::BuddyJoined { conversation, .. } => Some(conversation),
            _ => None,
        }
    }
}
