// tests/runtime_tests.rs

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

use parley_common::error::{ConnectError, HandlerError, SendError, TransportError};
use parley_common::models::{
    ConnectionState, Conversation, EventKind, Protocol, ProtocolEvent, RuntimeEvent, SessionHandle,
};
use parley_core::dispatch::{EventHandler, HandlerContext};
use parley_core::eventbus::BusEvent;
use parley_core::platforms::loopback::{LoopbackCall, LoopbackNetwork};
use parley_core::platforms::PluginRegistry;
use parley_core::{Error, EventLoop, RuntimeConfig, StopReason};

fn event_loop() -> (EventLoop, LoopbackNetwork) {
    let net = LoopbackNetwork::new();
    let mut plugins = PluginRegistry::new();
    net.register(&mut plugins, &[Protocol::Icq, Protocol::Irc]);
    (EventLoop::new(RuntimeConfig::default(), plugins), net)
}

/// Logs message bodies as "<name>:<body>".
struct BodyLog {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler for BodyLog {
    fn id(&self) -> &str {
        self.name
    }

    async fn handle(&self, event: &RuntimeEvent, _ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        if let RuntimeEvent::Message(msg) = event {
            self.log.lock().push(format!("{}:{}", self.name, msg.body));
        }
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    fn id(&self) -> &str {
        "failing"
    }

    async fn handle(&self, _event: &RuntimeEvent, _ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        Err(anyhow!("boom"))
    }
}

/// Keeps the first conversation it sees and tries to write to it on every message.
#[derive(Default)]
struct Keeper {
    first: Mutex<Option<Conversation>>,
    seen: Mutex<Vec<Conversation>>,
    results: Mutex<Vec<Result<(), SendError>>>,
}

#[async_trait]
impl EventHandler for Keeper {
    fn id(&self) -> &str {
        "keeper"
    }

    async fn handle(&self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let RuntimeEvent::Message(msg) = event else {
            return Ok(());
        };
        self.seen.lock().push(msg.conversation.clone());
        let first = self
            .first
            .lock()
            .get_or_insert_with(|| msg.conversation.clone())
            .clone();
        let result = ctx.send_message(&first, "still here").await;
        self.results.lock().push(result);
        Ok(())
    }
}

/// Counts sign-ons and brings the session back once after it is signed off.
#[derive(Default)]
struct Reviver {
    signed_on: Mutex<u32>,
    reconnects: Mutex<Vec<Result<SessionHandle, ConnectError>>>,
}

#[async_trait]
impl EventHandler for Reviver {
    fn id(&self) -> &str {
        "reviver"
    }

    fn event_kinds(&self) -> Vec<EventKind> {
        vec![EventKind::SignedOn, EventKind::SignedOff]
    }

    async fn handle(&self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        match event {
            RuntimeEvent::SignedOn { .. } => *self.signed_on.lock() += 1,
            RuntimeEvent::SignedOff { .. } if self.reconnects.lock().is_empty() => {
                let result = ctx.connect().await;
                self.reconnects.lock().push(result);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Lists every sender as a buddy on sign-on and drops it after its first message.
#[derive(Default)]
struct BuddyKeeper {
    seen: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl EventHandler for BuddyKeeper {
    fn id(&self) -> &str {
        "buddy-keeper"
    }

    fn event_kinds(&self) -> Vec<EventKind> {
        vec![EventKind::SignedOn, EventKind::MessageReceived]
    }

    async fn handle(&self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        match event {
            RuntimeEvent::SignedOn { .. } => ctx.add_buddy("alice", Some("Alice A.")).await?,
            RuntimeEvent::Message(msg) => {
                let online = ctx.is_buddy_online(msg.sender.id());
                self.seen.lock().push((msg.sender.alias().to_string(), online));
                ctx.remove_buddy(msg.sender.id()).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_max_ticks_bounds_the_run() {
    let (mut el, _net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://bot@irc.example.net"));
    let handle = assert_ok!(el.connect(id).await);

    let summary = assert_ok!(el.run(Duration::from_millis(1), Some(5)).await);
    assert_eq!(summary.ticks, 5);
    assert_eq!(summary.reason, StopReason::MaxTicks);
    assert_eq!(el.sessions().session(handle).unwrap().last_heartbeat_tick(), 5);
}

#[tokio::test]
async fn test_stop_handle_ends_run() {
    let (mut el, _net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://bot@irc.example.net"));
    assert_ok!(el.connect(id).await);

    let stop = el.stop_handle();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        stop.stop();
    });

    let summary = assert_ok!(el.run(Duration::from_millis(1), None).await);
    assert_eq!(summary.reason, StopReason::Stopped);
    assert!(summary.ticks >= 1);

    // The stop signal is cleared for the next run
    assert!(!el.stop_handle().is_stopped());
    let again = assert_ok!(el.run(Duration::ZERO, Some(2)).await);
    assert_eq!(again.reason, StopReason::MaxTicks);
}

#[tokio::test]
async fn test_stop_before_run_runs_no_ticks() {
    let (mut el, _net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://bot@irc.example.net"));
    assert_ok!(el.connect(id).await);

    el.stop_handle().stop();
    let summary = assert_ok!(el.run(Duration::from_millis(1), None).await);
    assert_eq!(summary.ticks, 0);
    assert_eq!(summary.reason, StopReason::Stopped);
}

#[tokio::test]
async fn test_ends_when_every_session_failed() {
    let (mut el, net) = event_loop();
    let a = assert_ok!(el.add_account_uri("irc://one@irc.example.net"));
    let b = assert_ok!(el.add_account_uri("icq://2:pw"));

    net.peer(Protocol::Irc, "one").fail_next_connect(ConnectError::auth("bad password"));
    let results = el.connect_all().await;
    assert!(matches!(&results[0], (id, Err(Error::Connect(_))) if *id == a));
    let handle_b = match &results[1] {
        (_, Ok(handle)) => *handle,
        (_, Err(e)) => panic!("second account should connect: {}", e),
    };

    net.peer(Protocol::Icq, "2").fail_next_poll(TransportError::from("connection reset"));
    let summary = assert_ok!(el.run(Duration::ZERO, None).await);
    assert_eq!(summary.reason, StopReason::AllSessionsFailed);
    assert_eq!(summary.ticks, 1);
    assert_eq!(el.session_state(handle_b), Some(ConnectionState::Failed));
    assert_eq!(el.session_for(b), Some(handle_b));
}

#[tokio::test]
async fn test_events_dispatched_in_arrival_then_registration_order() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://1:pw"));
    assert_ok!(el.connect(id).await);

    let log = Arc::new(Mutex::new(Vec::new()));
    el.register_handler(EventKind::MessageReceived, Arc::new(BodyLog { name: "a", log: log.clone() }));
    el.register_handler(EventKind::MessageReceived, Arc::new(BodyLog { name: "b", log: log.clone() }));

    let peer = net.peer(Protocol::Icq, "1");
    for body in ["1", "2", "3"] {
        peer.deliver_im("alice", body);
    }

    assert_ok!(el.run(Duration::ZERO, Some(1)).await);
    assert_eq!(*log.lock(), vec!["a:1", "b:1", "a:2", "b:2", "a:3", "b:3"]);
}

#[tokio::test]
async fn test_handler_errors_are_counted_and_published() {
    let (mut el, net) = event_loop();
    let mut notices = el.subscribe();
    let id = assert_ok!(el.add_account_uri("icq://1:pw"));

    let log = Arc::new(Mutex::new(Vec::new()));
    el.register_handler(EventKind::MessageReceived, Arc::new(Failing));
    el.register_handler(EventKind::MessageReceived, Arc::new(BodyLog { name: "after", log: log.clone() }));
    assert_ok!(el.connect(id).await);

    net.peer(Protocol::Icq, "1").deliver_im("alice", "hi");
    let summary = assert_ok!(el.run(Duration::ZERO, Some(1)).await);
    assert_eq!(summary.handler_errors, 1);
    assert_eq!(*log.lock(), vec!["after:hi"]);

    let mut kinds = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let BusEvent::HandlerFailed { source, error, .. } = &notice {
            assert_eq!(source, "message_received");
            assert!(error.contains("boom"));
        }
        kinds.push(notice.event_type());
    }
    assert_eq!(
        kinds,
        vec![
            "session.state",
            "session.state",
            "loop.started",
            "handler.failed",
            "loop.stopped",
        ]
    );
}

#[tokio::test]
async fn test_reconnect_invalidates_old_conversations() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://1:pw"));
    let keeper = Arc::new(Keeper::default());
    el.register_handler(EventKind::MessageReceived, keeper.clone());

    let handle = assert_ok!(el.connect(id).await);
    let peer = net.peer(Protocol::Icq, "1");
    peer.deliver_im("alice", "one");
    assert_ok!(el.run(Duration::ZERO, Some(1)).await);

    el.disconnect(handle).await;
    assert_eq!(el.session_state(handle), Some(ConnectionState::Disconnected));
    assert!(el.conversations().is_empty());

    assert_eq!(assert_ok!(el.connect(id).await), handle);
    peer.deliver_im("ALICE", "two");
    assert_ok!(el.run(Duration::ZERO, Some(1)).await);

    let results = keeper.results.lock();
    assert_eq!(results.len(), 2);
    assert_ok!(&results[0]);
    assert_eq!(results[1], Err(SendError::SessionClosed));

    let seen = keeper.seen.lock();
    assert_ne!(seen[0].id, seen[1].id);
    assert!(seen[1].epoch > seen[0].epoch);
    assert_eq!(peer.sent(), vec![("alice".to_string(), "still here".to_string())]);
}

#[tokio::test]
async fn test_remove_account_in_use() {
    let (mut el, _net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://1:pw"));
    assert_ok!(el.connect(id).await);
    assert_err!(el.remove_account(id));

    el.disconnect_all().await;
    assert_ok!(el.remove_account(id));
}

#[tokio::test]
async fn test_run_ends_once_the_server_signs_every_session_off() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://bot@irc.example.net"));
    let handle = assert_ok!(el.connect(id).await);
    net.peer(Protocol::Irc, "bot").push(ProtocolEvent::SignedOff);

    let run = tokio::time::timeout(Duration::from_secs(5), el.run(Duration::from_millis(1), None)).await;
    let summary = assert_ok!(assert_ok!(run));
    assert_eq!(summary.reason, StopReason::NoLiveSessions);
    assert_eq!(summary.ticks, 1);
    assert_eq!(el.session_state(handle), Some(ConnectionState::Disconnected));
}

#[tokio::test]
async fn test_handler_reconnects_a_signed_off_session() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://bot@irc.example.net"));
    let reviver = Arc::new(Reviver::default());
    el.add_handler(reviver.clone());
    let handle = assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Irc, "bot");
    peer.push(ProtocolEvent::SignedOff);

    let summary = assert_ok!(el.run(Duration::ZERO, Some(3)).await);
    assert_eq!(summary.reason, StopReason::MaxTicks);
    assert_eq!(el.session_state(handle), Some(ConnectionState::Connected));
    assert_eq!(*reviver.reconnects.lock(), vec![Ok(handle)]);
    assert_eq!(*reviver.signed_on.lock(), 2);
    assert_eq!(el.sessions().session(handle).unwrap().epoch(), 2);

    let connects = peer
        .calls()
        .into_iter()
        .filter(|c| matches!(c, LoopbackCall::Connect { .. }))
        .count();
    assert_eq!(connects, 2);
}

#[tokio::test]
async fn test_iterate_runs_one_tick() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://1:pw"));
    let handle = assert_ok!(el.connect(id).await);

    let log = Arc::new(Mutex::new(Vec::new()));
    el.register_handler(EventKind::MessageReceived, Arc::new(BodyLog { name: "a", log: log.clone() }));

    let peer = net.peer(Protocol::Icq, "1");
    peer.deliver_im("alice", "one");
    assert_eq!(el.iterate().await, None);
    assert_eq!(*log.lock(), vec!["a:one"]);
    assert_eq!(el.sessions().session(handle).unwrap().last_heartbeat_tick(), 1);

    // A pending stop skips the tick and is consumed
    peer.deliver_im("alice", "two");
    el.stop_handle().stop();
    assert_eq!(el.iterate().await, Some(StopReason::Stopped));
    assert_eq!(log.lock().len(), 1);
    assert!(!el.stop_handle().is_stopped());

    assert_eq!(el.iterate().await, None);
    assert_eq!(*log.lock(), vec!["a:one", "a:two"]);

    el.disconnect(handle).await;
    assert_eq!(el.iterate().await, Some(StopReason::NoLiveSessions));
}

#[tokio::test]
async fn test_handlers_manage_the_buddy_list() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://1:pw"));
    let keeper = Arc::new(BuddyKeeper::default());
    el.add_handler(keeper.clone());
    let handle = assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Icq, "1");
    peer.set_presence("alice", true);
    peer.deliver_im("ALICE", "hi");

    let summary = assert_ok!(el.run(Duration::ZERO, Some(1)).await);
    assert_eq!(summary.handler_errors, 0);
    assert_eq!(*keeper.seen.lock(), vec![("Alice A.".to_string(), true)]);
    assert!(!el.sessions().is_buddy_online(handle, "alice"));
    assert!(!el.sessions().session(handle).unwrap().has_buddy("alice"));

    let buddy_calls: Vec<LoopbackCall> = peer
        .calls()
        .into_iter()
        .filter(|c| matches!(c, LoopbackCall::AddBuddy { .. } | LoopbackCall::RemoveBuddy { .. }))
        .collect();
    assert_eq!(
        buddy_calls,
        vec![
            LoopbackCall::AddBuddy { name: "alice".into() },
            LoopbackCall::RemoveBuddy { name: "alice".into() },
        ]
    );
}
