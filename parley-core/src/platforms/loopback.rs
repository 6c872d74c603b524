//! src/platforms/loopback.rs
//!
//! In-memory protocol plugin. Each (protocol, account name) pair maps to a `LoopbackHandle` through which
//! a test (or the demo simulator) plays the remote side: it queues inbound events and
//! inspects every call the runtime made.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use parley_common::error::{ConnectError, TransportError};
use parley_common::models::{
    normalize_name, Account, ConversationKind, MessageFlags, Protocol, ProtocolEvent,
};

use crate::platforms::{PluginRegistry, ProtocolPlugin};

/// Everything the runtime asked the loopback peer to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackCall {
    Connect { username: String },
    Disconnect,
    Send { kind: ConversationKind, target: String, text: String },
    JoinChat { room: String },
    LeaveChat { room: String },
    Invite { room: String, who: String, message: String },
    Authorization { remote_user: String, accept: bool },
    AddBuddy { name: String },
    RemoveBuddy { name: String },
}

struct PeerState {
    inbox: VecDeque<ProtocolEvent>,
    calls: Vec<LoopbackCall>,
    chat_members: HashMap<String, Vec<String>>,
    connect_failure: Option<ConnectError>,
    poll_failure: Option<TransportError>,
    send_failure: Option<TransportError>,
    connected: bool,
    echo_chat: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            inbox: VecDeque::new(),
            calls: Vec::new(),
            chat_members: HashMap::new(),
            connect_failure: None,
            poll_failure: None,
            send_failure: None,
            connected: false,
            echo_chat: true,
        }
    }
}

/// Remote-side controls for one loopback account.
#[derive(Clone, Default)]
pub struct LoopbackHandle {
    state: Arc<Mutex<PeerState>>,
}

impl LoopbackHandle {
    pub fn push(&self, event: ProtocolEvent) {
        self.state.lock().inbox.push_back(event);
    }

    pub fn deliver_im(&self, from: &str, body: &str) {
        self.push(ProtocolEvent::Message {
            kind: ConversationKind::DirectMessage,
            conversation: from.to_string(),
            who: Some(from.to_string()),
            body: body.to_string(),
            flags: MessageFlags::RECEIVED,
            timestamp: Utc::now(),
        });
    }

    pub fn deliver_chat(&self, room: &str, from: &str, body: &str, flags: MessageFlags) {
        self.push(ProtocolEvent::Message {
            kind: ConversationKind::Chat,
            conversation: room.to_string(),
            who: Some(from.to_string()),
            body: body.to_string(),
            flags,
            timestamp: Utc::now(),
        });
    }

    pub fn add_buddy(&self, name: &str, alias: Option<&str>) {
        self.push(ProtocolEvent::BuddyListed {
            name: name.to_string(),
            alias: alias.map(str::to_string),
        });
    }

    /// The server reports a buddy going online or offline.
    pub fn set_presence(&self, name: &str, online: bool) {
        self.push(ProtocolEvent::BuddyPresence {
            name: name.to_string(),
            online,
        });
    }

    pub fn set_chat_members(&self, room: &str, members: &[&str]) {
        self.state.lock().chat_members.insert(
            normalize_name(room),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    /// Whether chat messages we send come back flagged as self-echo. On by default.
    pub fn set_echo_chat(&self, echo: bool) {
        self.state.lock().echo_chat = echo;
    }

    pub fn fail_next_connect(&self, err: ConnectError) {
        self.state.lock().connect_failure = Some(err);
    }

    pub fn fail_next_poll(&self, err: TransportError) {
        self.state.lock().poll_failure = Some(err);
    }

    pub fn fail_next_send(&self, err: TransportError) {
        self.state.lock().send_failure = Some(err);
    }

    pub fn calls(&self) -> Vec<LoopbackCall> {
        self.state.lock().calls.clone()
    }

    /// Outbound messages as (target, text).
    pub fn sent(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                LoopbackCall::Send { target, text, .. } => Some((target.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// A loopback "server": hands out one peer handle per protocol and account name.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<(Protocol, String), LoopbackHandle>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self, protocol: Protocol, username: &str) -> LoopbackHandle {
        self.peers
            .lock()
            .entry((protocol, normalize_name(username)))
            .or_default()
            .clone()
    }

    pub fn plugin_for(&self, account: &Account) -> LoopbackPlugin {
        LoopbackPlugin {
            username: account.username.clone(),
            peer: self.peer(account.protocol.clone(), &account.username),
        }
    }

    /// Serves every listed protocol from this network.
    pub fn register(&self, registry: &mut PluginRegistry, protocols: &[Protocol]) {
        for protocol in protocols {
            let network = self.clone();
            registry.register(protocol.clone(), move |account: &Account| -> Box<dyn ProtocolPlugin> {
                Box::new(network.plugin_for(account))
            });
        }
    }
}

pub struct LoopbackPlugin {
    username: String,
    peer: LoopbackHandle,
}

impl LoopbackPlugin {
    fn record(&self, call: LoopbackCall) {
        self.peer.state.lock().calls.push(call);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.peer.state.lock().connected {
            Ok(())
        } else {
            Err(TransportError::from("loopback peer not connected"))
        }
    }
}

#[async_trait]
impl ProtocolPlugin for LoopbackPlugin {
    async fn connect(&mut self, account: &Account) -> Result<(), ConnectError> {
        self.record(LoopbackCall::Connect { username: account.username.clone() });
        let mut st = self.peer.state.lock();
        if let Some(err) = st.connect_failure.take() {
            return Err(err);
        }
        st.connected = true;
        debug!("(LoopbackPlugin) {} connected", self.username);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(LoopbackCall::Disconnect);
        self.peer.state.lock().connected = false;
        Ok(())
    }

    async fn send(&mut self, kind: ConversationKind, target: &str, text: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(LoopbackCall::Send {
            kind,
            target: target.to_string(),
            text: text.to_string(),
        });
        let mut st = self.peer.state.lock();
        if let Some(err) = st.send_failure.take() {
            return Err(err);
        }
        if kind == ConversationKind::Chat && st.echo_chat {
            st.inbox.push_back(ProtocolEvent::Message {
                kind,
                conversation: target.to_string(),
                who: Some(self.username.clone()),
                body: text.to_string(),
                flags: MessageFlags::SELF_ECHO,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    async fn poll_events(&mut self) -> Result<Vec<ProtocolEvent>, TransportError> {
        let mut st = self.peer.state.lock();
        if let Some(err) = st.poll_failure.take() {
            st.connected = false;
            return Err(err);
        }
        Ok(st.inbox.drain(..).collect())
    }

    async fn join_chat(&mut self, room: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(LoopbackCall::JoinChat { room: room.to_string() });
        let mut st = self.peer.state.lock();
        let members = st.chat_members.entry(normalize_name(room)).or_default();
        if !members.iter().any(|m| normalize_name(m) == normalize_name(&self.username)) {
            members.push(self.username.clone());
        }
        st.inbox.push_back(ProtocolEvent::ChatJoined { room: room.to_string() });
        Ok(())
    }

    async fn leave_chat(&mut self, room: &str) -> Result<(), TransportError> {
        self.record(LoopbackCall::LeaveChat { room: room.to_string() });
        let mut st = self.peer.state.lock();
        let me = normalize_name(&self.username);
        if let Some(members) = st.chat_members.get_mut(&normalize_name(room)) {
            members.retain(|m| normalize_name(m) != me);
        }
        Ok(())
    }

    async fn chat_users(&mut self, room: &str) -> Result<Vec<String>, TransportError> {
        self.ensure_connected()?;
        Ok(self
            .peer
            .state
            .lock()
            .chat_members
            .get(&normalize_name(room))
            .cloned()
            .unwrap_or_default())
    }

    async fn invite(&mut self, room: &str, who: &str, message: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(LoopbackCall::Invite {
            room: room.to_string(),
            who: who.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn respond_authorization(&mut self, remote_user: &str, accept: bool) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(LoopbackCall::Authorization {
            remote_user: remote_user.to_string(),
            accept,
        });
        if accept {
            self.peer.state.lock().inbox.push_back(ProtocolEvent::BuddyListed {
                name: remote_user.to_string(),
                alias: None,
            });
        }
        Ok(())
    }

    async fn add_buddy(&mut self, name: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(LoopbackCall::AddBuddy { name: name.to_string() });
        Ok(())
    }

    async fn remove_buddy(&mut self, name: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(LoopbackCall::RemoveBuddy { name: name.to_string() });
        Ok(())
    }
}
