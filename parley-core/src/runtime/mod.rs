//! src/runtime/mod.rs
//!
//! The cooperative event loop. One task drives every session: each tick polls the live
//! sessions, dispatches what they produced, delivers heartbeats, evicts idle conversations
//! and then decides whether to keep going.

mod normalize;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use parley_common::error::DuplicateAccount;
use parley_common::models::{
    Account, AccountId, ConnectionState, EventKind, ProtocolEvent, SessionHandle,
};

use crate::accounts::{parse_account_uri, AccountRegistry};
use crate::config::RuntimeConfig;
use crate::conversations::ConversationTable;
use crate::dispatch::{
    AuthorizationRequest, Authorizer, ConversationDispatcher, EventHandler, HandlerContext,
    HeartbeatHandler,
};
use crate::eventbus::{BusEvent, EventBus};
use crate::platforms::session::SessionManager;
use crate::platforms::PluginRegistry;
use crate::Error;

use normalize::{normalize, Normalized};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` from a handler or a `StopHandle`.
    Stopped,
    MaxTicks,
    AllSessionsFailed,
    /// Every session is down (signed off, disconnected or failed) and none came back
    /// during the tick.
    NoLiveSessions,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Stopped => write!(f, "stopped"),
            StopReason::MaxTicks => write!(f, "max ticks reached"),
            StopReason::AllSessionsFailed => write!(f, "all sessions failed"),
            StopReason::NoLiveSessions => write!(f, "no live sessions"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub reason: StopReason,
    /// Handler errors reported during this run.
    pub handler_errors: u64,
}

/// Stops a running loop from outside it, e.g. from a signal handler task.
#[derive(Clone)]
pub struct StopHandle {
    bus: Arc<EventBus>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.bus.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.bus.is_shutdown()
    }
}

pub struct EventLoop {
    config: RuntimeConfig,
    accounts: AccountRegistry,
    sessions: SessionManager,
    conversations: ConversationTable,
    dispatcher: ConversationDispatcher,
    event_bus: Arc<EventBus>,
    stop_requested: bool,
    /// Ticks run over the loop's lifetime; heartbeats are stamped with it.
    ticks: u64,
}

impl EventLoop {
    pub fn new(config: RuntimeConfig, plugins: PluginRegistry) -> Self {
        let event_bus = Arc::new(EventBus::with_buffer_size(config.event_buffer_size));

        let mut sessions = SessionManager::new(plugins);
        sessions.set_event_bus(event_bus.clone());
        let mut dispatcher = ConversationDispatcher::new();
        dispatcher.set_event_bus(event_bus.clone());

        Self {
            conversations: ConversationTable::new(config.conversation_ttl()),
            config,
            accounts: AccountRegistry::new(),
            sessions,
            dispatcher,
            event_bus,
            stop_requested: false,
            ticks: 0,
        }
    }

    /// Builds a loop and registers every account URI listed in the config.
    pub fn from_config(config: RuntimeConfig, plugins: PluginRegistry) -> Result<Self, Error> {
        config.validate()?;
        let uris = config.accounts.clone();
        let mut event_loop = Self::new(config, plugins);
        for uri in &uris {
            event_loop.add_account_uri(uri)?;
        }
        Ok(event_loop)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn conversations(&self) -> &ConversationTable {
        &self.conversations
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<BusEvent> {
        self.event_bus.subscribe(None)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { bus: self.event_bus.clone() }
    }

    pub fn add_account(&mut self, account: Account) -> Result<AccountId, DuplicateAccount> {
        self.accounts.add_account(account)
    }

    pub fn add_account_uri(&mut self, uri: &str) -> Result<AccountId, Error> {
        let account = parse_account_uri(uri)?;
        Ok(self.accounts.add_account(account)?)
    }

    /// Removes an account whose session is not live. A disconnected or failed session is
    /// forgotten together with its conversations.
    pub fn remove_account(&mut self, id: AccountId) -> Result<Account, Error> {
        if self.accounts.get(id).is_none() {
            return Err(Error::NotFound(format!("{}", id)));
        }
        match self.sessions.remove_account(id) {
            Ok(Some(handle)) => {
                self.conversations.invalidate_session(handle);
            }
            Ok(None) => {}
            Err(handle) => {
                return Err(Error::AccountInUse(format!("{} is live on {}", id, handle)));
            }
        }
        self.accounts
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("{}", id)))
    }

    pub fn register_handler(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.dispatcher.register_handler(kind, handler);
    }

    /// Registers a handler under every kind it declares.
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.dispatcher.register(handler);
    }

    pub fn register_heartbeat(&mut self, handler: Arc<dyn HeartbeatHandler>) {
        self.dispatcher.register_heartbeat(handler);
    }

    pub fn set_authorizer(&mut self, authorizer: Arc<dyn Authorizer>) {
        self.dispatcher.set_authorizer(authorizer);
    }

    pub fn session_for(&self, id: AccountId) -> Option<SessionHandle> {
        self.sessions.handle_for(id)
    }

    pub fn session_state(&self, handle: SessionHandle) -> Option<ConnectionState> {
        self.sessions.state(handle)
    }

    pub async fn connect(&mut self, id: AccountId) -> Result<SessionHandle, Error> {
        let account = self
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}", id)))?;
        let handle = self.sessions.connect(id, &account).await?;
        // Whatever survived from an older epoch is unreachable now
        let epoch = self.sessions.session(handle).map_or(0, |s| s.epoch());
        let dropped = self.conversations.invalidate_stale(handle, epoch);
        if dropped > 0 {
            debug!("(EventLoop) {} dropped {} stale conversation(s)", handle, dropped);
        }
        Ok(handle)
    }

    /// Connects every registered account, in the order they were added. One failure does
    /// not keep the others from connecting.
    pub async fn connect_all(&mut self) -> Vec<(AccountId, Result<SessionHandle, Error>)> {
        let ids: Vec<AccountId> = self.accounts.iter().map(|(id, _)| id).collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.connect(id).await;
            if let Err(e) = &result {
                warn!("(EventLoop) connect {} => {}", id, e);
            }
            results.push((id, result));
        }
        results
    }

    pub async fn disconnect(&mut self, handle: SessionHandle) {
        self.sessions.disconnect(handle).await;
        self.conversations.invalidate_session(handle);
    }

    pub async fn disconnect_all(&mut self) {
        for handle in self.sessions.handles() {
            self.disconnect(handle).await;
        }
    }

    /// Runs with the configured tick interval and tick limit.
    pub async fn run_configured(&mut self) -> Result<RunSummary, Error> {
        let interval = self.config.tick_interval();
        let max_ticks = self.config.max_ticks;
        self.run(interval, max_ticks).await
    }

    /// Drives the loop until a handler or `StopHandle` stops it, `max_ticks` ticks have run,
    /// or no session is live any more. A zero interval runs ticks back to back.
    pub async fn run(&mut self, tick_interval: Duration, max_ticks: Option<u64>) -> Result<RunSummary, Error> {
        if self.sessions.is_empty() && max_ticks.is_none() {
            return Err(Error::Config(
                "nothing to run: no sessions were connected and no tick limit is set".into(),
            ));
        }

        let errors_before = self.dispatcher.handler_errors();
        let mut shutdown_rx = self.event_bus.shutdown_rx.clone();
        shutdown_rx.borrow_and_update();
        let mut interval = if tick_interval.is_zero() {
            None
        } else {
            let mut i = tokio::time::interval(tick_interval);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(i)
        };

        self.stop_requested = false;
        self.event_bus.publish(BusEvent::LoopStarted);
        info!(
            "(EventLoop) started => {} session(s), tick {:?}, max ticks {:?}",
            self.sessions.handles().len(),
            tick_interval,
            max_ticks
        );

        let mut ticks: u64 = 0;
        let reason = loop {
            if max_ticks.is_some_and(|max| ticks >= max) {
                break StopReason::MaxTicks;
            }

            match interval.as_mut() {
                Some(i) => {
                    tokio::select! {
                        _ = i.tick() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                None => tokio::task::yield_now().await,
            }
            if self.event_bus.is_shutdown() {
                break StopReason::Stopped;
            }

            ticks += 1;
            self.run_tick().await;

            if self.stop_requested || self.event_bus.is_shutdown() {
                break StopReason::Stopped;
            }
            if max_ticks.is_some_and(|max| ticks >= max) {
                break StopReason::MaxTicks;
            }
            if let Some(reason) = self.sessions_ended() {
                break reason;
            }
        };

        self.stop_requested = false;
        self.event_bus.reset_shutdown();

        let summary = RunSummary {
            ticks,
            reason,
            handler_errors: self.dispatcher.handler_errors() - errors_before,
        };
        self.event_bus.publish(BusEvent::Stopped { reason, ticks });
        info!(
            "(EventLoop) finished => {} after {} tick(s), {} handler error(s)",
            reason, ticks, summary.handler_errors
        );
        Ok(summary)
    }

    /// Runs exactly one tick without waiting. Returns why a `run` would stop after it, if
    /// it would; a stop request is consumed here.
    pub async fn iterate(&mut self) -> Option<StopReason> {
        if !self.event_bus.is_shutdown() {
            self.run_tick().await;
        }
        if self.stop_requested || self.event_bus.is_shutdown() {
            self.stop_requested = false;
            self.event_bus.reset_shutdown();
            return Some(StopReason::Stopped);
        }
        self.sessions_ended()
    }

    fn sessions_ended(&self) -> Option<StopReason> {
        if self.sessions.all_failed() {
            Some(StopReason::AllSessionsFailed)
        } else if self.sessions.all_down() {
            Some(StopReason::NoLiveSessions)
        } else {
            None
        }
    }

    async fn run_tick(&mut self) {
        self.ticks += 1;
        let tick = self.ticks;
        for handle in self.sessions.live_handles() {
            let events = self.sessions.poll(handle).await;
            if !events.is_empty() {
                debug!("(EventLoop) tick {} {} => {} event(s)", tick, handle, events.len());
            }
            for event in events {
                // A handler may have disconnected the session; the rest of its batch is moot
                if !self.sessions.state(handle).is_some_and(|s| s.is_live()) {
                    break;
                }
                self.process(handle, event, tick).await;
            }
        }

        for handle in self.sessions.live_handles() {
            let Some(beat) = self.sessions.record_heartbeat(handle, tick) else {
                continue;
            };
            let mut ctx = HandlerContext::new(
                &mut self.sessions,
                &mut self.conversations,
                &self.accounts,
                &mut self.stop_requested,
                handle,
                tick,
            );
            self.dispatcher.heartbeat(&beat, &mut ctx).await;
        }

        self.conversations.evict_idle(Utc::now());
    }

    async fn process(&mut self, handle: SessionHandle, event: ProtocolEvent, tick: u64) {
        match normalize(handle, event, &mut self.sessions, &mut self.conversations, Utc::now()) {
            Normalized::Dispatch(runtime_event) => {
                let mut ctx = HandlerContext::new(
                    &mut self.sessions,
                    &mut self.conversations,
                    &self.accounts,
                    &mut self.stop_requested,
                    handle,
                    tick,
                );
                self.dispatcher.dispatch(&runtime_event, &mut ctx).await;
            }
            Normalized::Authorize(request) => self.answer_authorization(request).await,
            Normalized::Absorbed => {}
        }
    }

    async fn answer_authorization(&mut self, request: AuthorizationRequest) {
        let Some(account) = self.sessions.session(request.session).map(|s| s.account().clone()) else {
            return;
        };
        let accept = self.dispatcher.authorize(&account, &request);
        info!(
            "(EventLoop) authorization from '{}' for {} => {}",
            request.remote_user,
            account.username,
            if accept { "accepted" } else { "denied" }
        );
        if let Err(e) = self
            .sessions
            .respond_authorization(request.session, &request.remote_user, accept)
            .await
        {
            error!("(EventLoop) answering authorization for {} => {}", request.session, e);
        }
    }
}
