pub mod account;
pub mod conversation;
pub mod event;
pub mod session;

pub use account::{normalize_name, Account, AccountId, Protocol};
pub use conversation::{Conversation, ConversationId, ConversationKind};
pub use event::{
    BuddyRef, EventKind, InboundEvent, MessageFlags, ProtocolEvent, RuntimeEvent, Sender,
};
pub use session::{ConnectionState, Heartbeat, SessionHandle};
