// File: src/platforms/mod.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use parley_common::error::{ConnectError, TransportError};
use parley_common::models::{Account, ConversationKind, Protocol, ProtocolEvent};

/// The protocol collaborator behind one account's session. Implementations own the actual
/// wire connection; the runtime only drives them through this capability set.
///
/// `poll_events` must not block: it returns whatever arrived since the last call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProtocolPlugin: Send {
    async fn connect(&mut self, account: &Account) -> Result<(), ConnectError>;
    async fn disconnect(&mut self) -> Result<(), TransportError>;
    async fn send(&mut self, kind: ConversationKind, target: &str, text: &str) -> Result<(), TransportError>;
    async fn poll_events(&mut self) -> Result<Vec<ProtocolEvent>, TransportError>;

    async fn join_chat(&mut self, room: &str) -> Result<(), TransportError>;
    async fn leave_chat(&mut self, room: &str) -> Result<(), TransportError>;
    async fn chat_users(&mut self, room: &str) -> Result<Vec<String>, TransportError>;
    async fn invite(&mut self, room: &str, who: &str, message: &str) -> Result<(), TransportError>;

    async fn respond_authorization(&mut self, remote_user: &str, accept: bool) -> Result<(), TransportError>;

    /// Server-side buddy list. Protocols without one keep the list local only.
    async fn add_buddy(&mut self, _name: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn remove_buddy(&mut self, _name: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Builds a fresh plugin instance for one connect attempt.
pub type PluginFactory = Arc<dyn Fn(&Account) -> Box<dyn ProtocolPlugin> + Send + Sync>;

/// Maps protocols to the plugin factories that can serve them.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<Protocol, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, protocol: Protocol, factory: F)
    where
        F: Fn(&Account) -> Box<dyn ProtocolPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(protocol, Arc::new(factory));
    }

    pub fn create(&self, account: &Account) -> Option<Box<dyn ProtocolPlugin>> {
        self.factories.get(&account.protocol).map(|f| f(account))
    }

    /// Protocols we can connect.
    pub fn protocols(&self) -> Vec<Protocol> {
        self.factories.keys().cloned().collect()
    }

    pub fn supports(&self, protocol: &Protocol) -> bool {
        self.factories.contains_key(protocol)
    }
}

pub mod loopback;
pub mod session;
