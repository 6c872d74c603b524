//! src/platforms/session.rs
//!
//! Per-account connection lifecycle. `SessionManager` exclusively owns every
//! `ProtocolSession` and the plugin instance behind it.
//!
//! State machine:
//!   Disconnected -> Connecting -> Connected -> Disconnected (disconnect / signed off)
//!                              \-> Failed (connect error or fatal protocol error)
//! Failed is terminal until the next explicit `connect`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use parley_common::error::{ConnectError, ConnectReason, SendError};
use parley_common::models::{
    normalize_name, Account, AccountId, BuddyRef, ConnectionState, Conversation, Heartbeat,
    ProtocolEvent, Sender, SessionHandle,
};

use crate::eventbus::{BusEvent, EventBus};
use crate::platforms::{PluginRegistry, ProtocolPlugin};

pub struct ProtocolSession {
    handle: SessionHandle,
    account_id: AccountId,
    account: Account,
    state: ConnectionState,
    /// Bumped on every successful connect; conversations from older epochs are dead.
    epoch: u64,
    last_heartbeat_tick: u64,
    heartbeats: u64,
    plugin: Option<Box<dyn ProtocolPlugin>>,
    /// Events synthesized by the runtime, delivered ahead of the next poll.
    pending: VecDeque<ProtocolEvent>,
    /// normalized room name => room name as joined
    joined_chats: BTreeMap<String, String>,
    buddies: HashMap<String, BuddyRef>,
    /// Normalized names of buddies the server reports online. Unknown while not connected.
    online: HashSet<String>,
}

impl ProtocolSession {
    fn new(handle: SessionHandle, account_id: AccountId, account: Account) -> Self {
        Self {
            handle,
            account_id,
            account,
            state: ConnectionState::Disconnected,
            epoch: 0,
            last_heartbeat_tick: 0,
            heartbeats: 0,
            plugin: None,
            pending: VecDeque::new(),
            joined_chats: BTreeMap::new(),
            buddies: HashMap::new(),
            online: HashSet::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_heartbeat_tick(&self) -> u64 {
        self.last_heartbeat_tick
    }

    pub fn joined_chats(&self) -> impl Iterator<Item = &str> {
        self.joined_chats.values().map(|s| s.as_str())
    }

    pub fn is_in_chat(&self, room: &str) -> bool {
        self.joined_chats.contains_key(&normalize_name(room))
    }

    pub fn buddies(&self) -> impl Iterator<Item = &BuddyRef> {
        self.buddies.values()
    }

    pub fn has_buddy(&self, name: &str) -> bool {
        self.buddies.contains_key(&normalize_name(name))
    }

    /// Only listed buddies can be online.
    pub fn is_buddy_online(&self, name: &str) -> bool {
        let key = normalize_name(name);
        self.buddies.contains_key(&key) && self.online.contains(&key)
    }
}

pub struct SessionManager {
    plugins: PluginRegistry,
    sessions: BTreeMap<SessionHandle, ProtocolSession>,
    by_account: HashMap<AccountId, SessionHandle>,
    next_handle: u32,
    event_bus: Option<Arc<EventBus>>,
}

impl SessionManager {
    pub fn new(plugins: PluginRegistry) -> Self {
        Self {
            plugins,
            sessions: BTreeMap::new(),
            by_account: HashMap::new(),
            next_handle: 0,
            event_bus: None,
        }
    }

    pub fn set_event_bus(&mut self, bus: Arc<EventBus>) {
        self.event_bus = Some(bus);
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&ProtocolSession> {
        self.sessions.get(&handle)
    }

    pub fn state(&self, handle: SessionHandle) -> Option<ConnectionState> {
        self.sessions.get(&handle).map(|s| s.state)
    }

    pub fn handle_for(&self, account: AccountId) -> Option<SessionHandle> {
        self.by_account.get(&account).copied()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.keys().copied().collect()
    }

    pub fn live_handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .values()
            .filter(|s| s.state.is_live())
            .map(|s| s.handle)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// True when there is at least one session and every one of them is Failed.
    pub fn all_failed(&self) -> bool {
        !self.sessions.is_empty()
            && self.sessions.values().all(|s| s.state == ConnectionState::Failed)
    }

    /// True when there is at least one session and none of them is live.
    pub fn all_down(&self) -> bool {
        !self.sessions.is_empty() && !self.sessions.values().any(|s| s.state.is_live())
    }

    /// Brings the account's session up. Reuses the account's handle across reconnects and
    /// returns it unchanged when the session is already live.
    pub async fn connect(
        &mut self,
        account_id: AccountId,
        account: &Account,
    ) -> Result<SessionHandle, ConnectError> {
        let handle = match self.by_account.get(&account_id) {
            Some(h) => *h,
            None => {
                self.next_handle += 1;
                let h = SessionHandle(self.next_handle);
                self.sessions
                    .insert(h, ProtocolSession::new(h, account_id, account.clone()));
                self.by_account.insert(account_id, h);
                h
            }
        };

        if let Some(s) = self.sessions.get_mut(&handle) {
            if s.state.is_live() {
                info!("(SessionManager) connect => {} already {}", handle, s.state);
                return Ok(handle);
            }
            // Release what a failed connection left behind
            if let Some(mut stale) = s.plugin.take() {
                if let Err(e) = stale.disconnect().await {
                    warn!("(SessionManager) {} stale plugin disconnect => {}", handle, e);
                }
            }
        }

        let Some(mut plugin) = self.plugins.create(account) else {
            let err = ConnectError::negotiation(format!(
                "no protocol plugin registered for '{}'",
                account.protocol
            ));
            error!("(SessionManager) {} => {}", handle, err);
            self.set_state(handle, ConnectionState::Failed);
            return Err(err);
        };

        self.set_state(handle, ConnectionState::Connecting);
        info!("(SessionManager) connecting {} => {}://{}", handle, account.protocol, account.username);

        match plugin.connect(account).await {
            Ok(()) => {
                if let Some(s) = self.sessions.get_mut(&handle) {
                    s.plugin = Some(plugin);
                    s.epoch += 1;
                    s.heartbeats = 0;
                    s.pending.clear();
                    s.pending.push_back(ProtocolEvent::SignedOn);
                }
                self.set_state(handle, ConnectionState::Connected);
                info!("(SessionManager) {} connected.", handle);
                Ok(handle)
            }
            Err(e) => {
                error!("(SessionManager) connect {} failed => {}", handle, e);
                self.set_state(handle, ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Idempotent. Leaves joined chats, drops the plugin connection and moves the session
    /// to Disconnected whatever its state was.
    pub async fn disconnect(&mut self, handle: SessionHandle) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            debug!("(SessionManager) disconnect => unknown {}", handle);
            return;
        };
        if session.state == ConnectionState::Disconnected && session.plugin.is_none() {
            return;
        }

        let was_connected = session.state == ConnectionState::Connected;
        let rooms: Vec<String> = std::mem::take(&mut session.joined_chats).into_values().collect();
        session.pending.clear();
        session.online.clear();

        if let Some(mut plugin) = session.plugin.take() {
            if was_connected {
                for room in &rooms {
                    if let Err(e) = plugin.leave_chat(room).await {
                        warn!("(SessionManager) {} leave {} => {}", handle, room, e);
                    }
                }
            }
            if let Err(e) = plugin.disconnect().await {
                warn!("(SessionManager) {} disconnect => {}", handle, e);
            }
        }

        self.set_state(handle, ConnectionState::Disconnected);
        info!("(SessionManager) {} disconnected.", handle);
    }

    /// Forgets the account's session. Refuses while the session is live.
    pub fn remove_account(&mut self, account_id: AccountId) -> Result<Option<SessionHandle>, SessionHandle> {
        let Some(handle) = self.by_account.get(&account_id).copied() else {
            return Ok(None);
        };
        if self.sessions.get(&handle).is_some_and(|s| s.state.is_live()) {
            return Err(handle);
        }
        self.by_account.remove(&account_id);
        self.sessions.remove(&handle);
        debug!("(SessionManager) dropped {} for {}", handle, account_id);
        Ok(Some(handle))
    }

    /// Fails with `SessionClosed` without touching the plugin unless the session is
    /// Connected and the conversation belongs to its current epoch.
    pub async fn send_message(
        &mut self,
        handle: SessionHandle,
        conversation: &Conversation,
        body: &str,
    ) -> Result<(), SendError> {
        let (session, plugin) = self.connected_mut(handle, conversation)?;
        debug!("(SessionManager) {} >> {} {}: {}", session, conversation.kind, conversation.name, body);
        plugin.send(conversation.kind, &conversation.name, body).await?;
        Ok(())
    }

    /// Joins a chat room on a connected session. Joining twice is a no-op.
    pub async fn join_chat(&mut self, handle: SessionHandle, room: &str) -> Result<(), SendError> {
        let session = self.sessions.get_mut(&handle).ok_or(SendError::SessionClosed)?;
        if session.state != ConnectionState::Connected {
            return Err(SendError::SessionClosed);
        }
        let key = normalize_name(room);
        if session.joined_chats.contains_key(&key) {
            return Ok(());
        }
        let plugin = session.plugin.as_mut().ok_or(SendError::SessionClosed)?;
        plugin.join_chat(room).await?;
        session.joined_chats.insert(key, room.to_string());
        Ok(())
    }

    pub async fn chat_users(
        &mut self,
        handle: SessionHandle,
        conversation: &Conversation,
    ) -> Result<Vec<String>, SendError> {
        if !conversation.is_chat() {
            return Err(SendError::NotAChat);
        }
        let (_, plugin) = self.connected_mut(handle, conversation)?;
        Ok(plugin.chat_users(&conversation.name).await?)
    }

    pub async fn invite(
        &mut self,
        handle: SessionHandle,
        conversation: &Conversation,
        who: &str,
        message: &str,
    ) -> Result<(), SendError> {
        if !conversation.is_chat() {
            return Err(SendError::NotAChat);
        }
        let (session, plugin) = self.connected_mut(handle, conversation)?;
        debug!("(SessionManager) {} invite {} => {}", session, who, conversation.name);
        plugin.invite(&conversation.name, who, message).await?;
        Ok(())
    }

    pub async fn respond_authorization(
        &mut self,
        handle: SessionHandle,
        remote_user: &str,
        accept: bool,
    ) -> Result<(), SendError> {
        let session = self.sessions.get_mut(&handle).ok_or(SendError::SessionClosed)?;
        if session.state != ConnectionState::Connected {
            return Err(SendError::SessionClosed);
        }
        let plugin = session.plugin.as_mut().ok_or(SendError::SessionClosed)?;
        plugin.respond_authorization(remote_user, accept).await?;
        Ok(())
    }

    /// Drains synthesized events and whatever the plugin has ready. A transport error is
    /// turned into a trailing fatal `ConnectionError` event.
    pub async fn poll(&mut self, handle: SessionHandle) -> Vec<ProtocolEvent> {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return Vec::new();
        };
        if !session.state.is_live() {
            return Vec::new();
        }

        let mut events: Vec<ProtocolEvent> = session.pending.drain(..).collect();
        if let Some(plugin) = session.plugin.as_mut() {
            match plugin.poll_events().await {
                Ok(mut polled) => events.append(&mut polled),
                Err(e) => {
                    warn!("(SessionManager) poll {} => {}", handle, e);
                    events.push(ProtocolEvent::ConnectionError {
                        reason: ConnectReason::NetworkUnreachable,
                        description: e.0,
                        fatal: true,
                    });
                }
            }
        }
        events
    }

    /// Marks a session Failed after a fatal protocol error. Chat memberships are gone with
    /// the connection; the plugin is kept until the next `disconnect`/`connect`.
    pub fn mark_failed(&mut self, handle: SessionHandle) {
        if let Some(s) = self.sessions.get_mut(&handle) {
            s.joined_chats.clear();
            s.pending.clear();
            s.online.clear();
        }
        self.set_state(handle, ConnectionState::Failed);
    }

    /// The server ended the session on its own.
    pub fn mark_signed_off(&mut self, handle: SessionHandle) {
        if let Some(s) = self.sessions.get_mut(&handle) {
            s.joined_chats.clear();
            s.pending.clear();
            s.online.clear();
            s.plugin = None;
        }
        self.set_state(handle, ConnectionState::Disconnected);
    }

    /// Records a chat the server confirms we are in (joins we did not ask for included).
    pub fn mark_joined(&mut self, handle: SessionHandle, room: &str) {
        if let Some(s) = self.sessions.get_mut(&handle) {
            s.joined_chats
                .entry(normalize_name(room))
                .or_insert_with(|| room.to_string());
        }
    }

    pub fn learn_buddy(&mut self, handle: SessionHandle, buddy: BuddyRef) {
        if let Some(s) = self.sessions.get_mut(&handle) {
            s.buddies.insert(normalize_name(&buddy.name), buddy);
        }
    }

    /// Puts a buddy on the session's list, on the server too when the protocol keeps one.
    /// Adding a listed buddy again only updates its alias.
    pub async fn add_buddy(&mut self, handle: SessionHandle, buddy: BuddyRef) -> Result<(), SendError> {
        let session = self.sessions.get_mut(&handle).ok_or(SendError::SessionClosed)?;
        if session.state != ConnectionState::Connected {
            return Err(SendError::SessionClosed);
        }
        let key = normalize_name(&buddy.name);
        if !session.buddies.contains_key(&key) {
            let plugin = session.plugin.as_mut().ok_or(SendError::SessionClosed)?;
            plugin.add_buddy(&buddy.name).await?;
            debug!("(SessionManager) {} added buddy {}", handle, buddy.name);
        }
        session.buddies.insert(key, buddy);
        Ok(())
    }

    /// Drops a buddy from the list. Returns false when it was not listed; the server is
    /// only asked for buddies we know.
    pub async fn remove_buddy(&mut self, handle: SessionHandle, name: &str) -> Result<bool, SendError> {
        let session = self.sessions.get_mut(&handle).ok_or(SendError::SessionClosed)?;
        if session.state != ConnectionState::Connected {
            return Err(SendError::SessionClosed);
        }
        let key = normalize_name(name);
        let Some(buddy) = session.buddies.get(&key) else {
            return Ok(false);
        };
        let plugin = session.plugin.as_mut().ok_or(SendError::SessionClosed)?;
        plugin.remove_buddy(&buddy.name).await?;
        session.buddies.remove(&key);
        session.online.remove(&key);
        debug!("(SessionManager) {} removed buddy {}", handle, name);
        Ok(true)
    }

    pub fn set_presence(&mut self, handle: SessionHandle, name: &str, online: bool) {
        if let Some(s) = self.sessions.get_mut(&handle) {
            let key = normalize_name(name);
            if online {
                s.online.insert(key);
            } else {
                s.online.remove(&key);
            }
        }
    }

    pub fn is_buddy_online(&self, handle: SessionHandle, name: &str) -> bool {
        self.sessions
            .get(&handle)
            .is_some_and(|s| s.is_buddy_online(name))
    }

    /// Resolves a protocol-level id against the session's buddy list.
    pub fn resolve_sender(&self, handle: SessionHandle, who: &str) -> Sender {
        self.sessions
            .get(&handle)
            .and_then(|s| s.buddies.get(&normalize_name(who)))
            .map(|b| Sender::Known(b.clone()))
            .unwrap_or_else(|| Sender::Unresolved(who.to_string()))
    }

    /// Advances the session's heartbeat counter and returns the beat to deliver.
    pub fn record_heartbeat(&mut self, handle: SessionHandle, tick: u64) -> Option<Heartbeat> {
        let s = self.sessions.get_mut(&handle)?;
        if !s.state.is_live() {
            return None;
        }
        let beat = Heartbeat { session: handle, tick, count: s.heartbeats };
        s.heartbeats += 1;
        s.last_heartbeat_tick = tick;
        Some(beat)
    }

    fn connected_mut(
        &mut self,
        handle: SessionHandle,
        conversation: &Conversation,
    ) -> Result<(SessionHandle, &mut Box<dyn ProtocolPlugin>), SendError> {
        let session = self.sessions.get_mut(&handle).ok_or(SendError::SessionClosed)?;
        if session.state != ConnectionState::Connected
            || conversation.session != handle
            || conversation.epoch != session.epoch
        {
            return Err(SendError::SessionClosed);
        }
        let plugin = session.plugin.as_mut().ok_or(SendError::SessionClosed)?;
        Ok((handle, plugin))
    }

    fn set_state(&mut self, handle: SessionHandle, state: ConnectionState) {
        let Some(s) = self.sessions.get_mut(&handle) else {
            return;
        };
        if s.state == state {
            return;
        }
        debug!("(SessionManager) {} {} -> {}", handle, s.state, state);
        s.state = state;
        if let Some(bus) = &self.event_bus {
            bus.publish(BusEvent::SessionState {
                session: handle,
                account: s.account_id,
                state,
            });
        }
    }
}
