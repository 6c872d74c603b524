//! src/dispatch/context.rs

use chrono::Utc;
use tracing::{debug, info};

use parley_common::error::{ConnectError, SendError};
use parley_common::models::{
    normalize_name, Account, BuddyRef, ConnectionState, Conversation, ConversationKind,
    SessionHandle,
};

use crate::accounts::AccountRegistry;
use crate::conversations::ConversationTable;
use crate::platforms::session::SessionManager;

/// What a handler can reach while it runs: the session the event came from, the
/// conversations of every session, and the loop's stop switch.
///
/// Borrowed from the event loop for the duration of a single dispatch.
pub struct HandlerContext<'a> {
    sessions: &'a mut SessionManager,
    conversations: &'a mut ConversationTable,
    accounts: &'a AccountRegistry,
    stop_requested: &'a mut bool,
    session: SessionHandle,
    tick: u64,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        sessions: &'a mut SessionManager,
        conversations: &'a mut ConversationTable,
        accounts: &'a AccountRegistry,
        stop_requested: &'a mut bool,
        session: SessionHandle,
        tick: u64,
    ) -> Self {
        Self {
            sessions,
            conversations,
            accounts,
            stop_requested,
            session,
            tick,
        }
    }

    /// Session the current event (or heartbeat) belongs to.
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn account(&self) -> Option<&Account> {
        let id = self.sessions.session(self.session)?.account_id();
        self.accounts.get(id)
    }

    pub fn session_state(&self) -> Option<ConnectionState> {
        self.sessions.state(self.session)
    }

    /// Sends on a conversation of any session. Fails with `SessionClosed` when that session
    /// is no longer connected under the conversation's epoch.
    pub async fn send_message(&mut self, conversation: &Conversation, body: &str) -> Result<(), SendError> {
        self.check_current(conversation)?;
        self.sessions
            .send_message(conversation.session, conversation, body)
            .await
    }

    /// Opens a conversation on the current session. For chats this joins the room first.
    pub async fn open_conversation(&mut self, kind: ConversationKind, name: &str) -> Result<Conversation, SendError> {
        let epoch = match self.sessions.session(self.session) {
            Some(s) if s.state() == ConnectionState::Connected => s.epoch(),
            _ => return Err(SendError::SessionClosed),
        };
        if kind == ConversationKind::Chat {
            self.sessions.join_chat(self.session, name).await?;
        }
        Ok(self
            .conversations
            .lookup_or_create(self.session, epoch, kind, name, Utc::now()))
    }

    pub async fn is_user_in_chat(&mut self, conversation: &Conversation, who: &str) -> Result<bool, SendError> {
        self.check_current(conversation)?;
        let users = self
            .sessions
            .chat_users(conversation.session, conversation)
            .await?;
        let wanted = normalize_name(who);
        Ok(users.iter().any(|u| normalize_name(u) == wanted))
    }

    pub async fn invite_user(&mut self, conversation: &Conversation, who: &str, message: &str) -> Result<(), SendError> {
        self.check_current(conversation)?;
        self.sessions
            .invite(conversation.session, conversation, who, message)
            .await
    }

    /// Puts a buddy on the current session's buddy list.
    pub async fn add_buddy(&mut self, name: &str, alias: Option<&str>) -> Result<(), SendError> {
        let buddy = BuddyRef {
            name: name.to_string(),
            alias: alias.map(str::to_string),
        };
        self.sessions.add_buddy(self.session, buddy).await
    }

    /// Returns false when `name` was not on the list.
    pub async fn remove_buddy(&mut self, name: &str) -> Result<bool, SendError> {
        self.sessions.remove_buddy(self.session, name).await
    }

    pub fn is_buddy_online(&self, name: &str) -> bool {
        self.sessions.is_buddy_online(self.session, name)
    }

    /// Brings the current session back up after a sign-off or failure. A live session is
    /// left alone. Conversations from the previous connection are dropped.
    pub async fn connect(&mut self) -> Result<SessionHandle, ConnectError> {
        let Some((account_id, account)) = self
            .sessions
            .session(self.session)
            .map(|s| (s.account_id(), s.account().clone()))
        else {
            return Err(ConnectError::negotiation(format!("unknown session {}", self.session)));
        };
        info!("(HandlerContext) reconnect requested for {}", self.session);
        let handle = self.sessions.connect(account_id, &account).await?;
        let epoch = self.sessions.session(handle).map_or(0, |s| s.epoch());
        self.conversations.invalidate_stale(handle, epoch);
        Ok(handle)
    }

    /// Disconnects the current session and drops its conversations.
    pub async fn disconnect(&mut self) {
        info!("(HandlerContext) disconnect requested for {}", self.session);
        self.sessions.disconnect(self.session).await;
        self.conversations.invalidate_session(self.session);
    }

    /// Ends the event loop at the next tick boundary.
    pub fn stop(&mut self) {
        debug!("(HandlerContext) stop requested at tick {}", self.tick);
        *self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_requested
    }

    fn check_current(&mut self, conversation: &Conversation) -> Result<(), SendError> {
        match self.sessions.session(conversation.session) {
            Some(s) if s.state() == ConnectionState::Connected && s.epoch() == conversation.epoch => {}
            _ => return Err(SendError::SessionClosed),
        }
        self.conversations.touch(conversation, Utc::now());
        Ok(())
    }
}
