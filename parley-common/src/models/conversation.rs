// File: parley-common/src/models/conversation.rs

use std::fmt;

use serde::{Deserialize, Serialize};

use super::session::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKind {
    DirectMessage,
    Chat,
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKind::DirectMessage => write!(f, "im"),
            ConversationKind::Chat => write!(f, "chat"),
        }
    }
}

/// A direct-message peer or a chat room on one session.
///
/// Holds only a non-owning back-reference to its session: the handle plus the session
/// epoch it was created under. Once the session disconnects the epoch goes stale and every
/// operation on this value fails with `SessionClosed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Participant id for direct messages, room id for chats.
    pub name: String,
    pub session: SessionHandle,
    pub epoch: u64,
}

impl Conversation {
    pub fn is_chat(&self) -> bool {
        self.kind == ConversationKind::Chat
    }
}
