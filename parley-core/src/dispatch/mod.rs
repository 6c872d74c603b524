//! src/dispatch/mod.rs
//!
//! Routes normalized runtime events to the handlers registered for their kind, and
//! heartbeats to heartbeat handlers. Handlers run one at a time, in registration order,
//! each awaited to completion before the next.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use parley_common::error::HandlerError;
use parley_common::models::{Account, EventKind, Heartbeat, RuntimeEvent, SessionHandle};

use crate::eventbus::{BusEvent, EventBus};

pub mod context;

pub use context::HandlerContext;

/// Reacts to one kind of runtime event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identifier used in logs and failure notices.
    fn id(&self) -> &str;

    /// Kinds this handler wants when registered through `ConversationDispatcher::register`.
    fn event_kinds(&self) -> Vec<EventKind> {
        Vec::new()
    }

    async fn handle(&self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError>;
}

/// Called once per live session on every tick.
#[async_trait]
pub trait HeartbeatHandler: Send + Sync {
    fn id(&self) -> &str;

    async fn beat(&self, beat: &Heartbeat, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError>;
}

/// A remote user asking to add one of our accounts to their list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub session: SessionHandle,
    pub remote_user: String,
    pub message: Option<String>,
    /// Whether the remote user is already on our buddy list.
    pub on_list: bool,
}

/// Decides authorization requests. Returning `true` accepts.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, account: &Account, request: &AuthorizationRequest) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&Account, &AuthorizationRequest) -> bool + Send + Sync,
{
    fn authorize(&self, account: &Account, request: &AuthorizationRequest) -> bool {
        self(account, request)
    }
}

/// Default authorizer: refuses everyone.
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, _account: &Account, _request: &AuthorizationRequest) -> bool {
        false
    }
}

pub struct ConversationDispatcher {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    heartbeats: Vec<Arc<dyn HeartbeatHandler>>,
    authorizer: Arc<dyn Authorizer>,
    event_bus: Option<Arc<EventBus>>,
    handler_errors: u64,
}

impl Default for ConversationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            heartbeats: Vec::new(),
            authorizer: Arc::new(DenyAll),
            event_bus: None,
            handler_errors: 0,
        }
    }

    pub fn set_event_bus(&mut self, bus: Arc<EventBus>) {
        self.event_bus = Some(bus);
    }

    pub fn register_handler(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        debug!("(Dispatcher) registering '{}' for {}", handler.id(), kind);
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Registers a handler under every kind it declares.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        for kind in handler.event_kinds() {
            self.register_handler(kind, handler.clone());
        }
    }

    pub fn register_heartbeat(&mut self, handler: Arc<dyn HeartbeatHandler>) {
        debug!("(Dispatcher) registering heartbeat '{}'", handler.id());
        self.heartbeats.push(handler);
    }

    pub fn set_authorizer(&mut self, authorizer: Arc<dyn Authorizer>) {
        self.authorizer = authorizer;
    }

    pub fn authorize(&self, account: &Account, request: &AuthorizationRequest) -> bool {
        self.authorizer.authorize(account, request)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn has_heartbeats(&self) -> bool {
        !self.heartbeats.is_empty()
    }

    /// Errors reported by handlers since this dispatcher was created.
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors
    }

    /// Runs every handler registered for the event's kind. Handler errors are reported and
    /// never stop the remaining handlers.
    pub async fn dispatch(&mut self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) {
        let kind = event.kind();
        let handlers = self.handlers.get(&kind).cloned().unwrap_or_default();
        for handler in handlers {
            if let Err(e) = handler.handle(event, ctx).await {
                self.report(handler.id(), &kind.to_string(), event.session(), e);
            }
        }
    }

    pub async fn heartbeat(&mut self, beat: &Heartbeat, ctx: &mut HandlerContext<'_>) {
        let handlers = self.heartbeats.clone();
        for handler in handlers {
            if let Err(e) = handler.beat(beat, ctx).await {
                self.report(handler.id(), "heartbeat", beat.session, e);
            }
        }
    }

    fn report(&mut self, handler: &str, source: &str, session: SessionHandle, err: HandlerError) {
        self.handler_errors += 1;
        error!("(Dispatcher) handler '{}' failed on {} for {} => {:#}", handler, source, session, err);
        if let Some(bus) = &self.event_bus {
            bus.publish(BusEvent::HandlerFailed {
                source: source.to_string(),
                session,
                error: format!("{:#}", err),
            });
        }
    }
}
