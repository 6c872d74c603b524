// tests/scenario_tests.rs
//
// The three bundled bots driven end to end over the loopback network.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use parley_common::error::TransportError;
use parley_common::models::{ConnectionState, ConversationKind, MessageFlags, Protocol, ProtocolEvent};
use parley_core::bots::{ChannelBot, ConferenceBot, EchoBot, Lifetime};
use parley_core::dispatch::AuthorizationRequest;
use parley_core::platforms::loopback::{LoopbackCall, LoopbackNetwork};
use parley_core::platforms::PluginRegistry;
use parley_core::{EventLoop, RuntimeConfig, StopReason};

fn event_loop() -> (EventLoop, LoopbackNetwork) {
    let net = LoopbackNetwork::new();
    let mut plugins = PluginRegistry::new();
    net.register(&mut plugins, &[Protocol::Icq, Protocol::Irc, Protocol::Xmpp]);
    (EventLoop::new(RuntimeConfig::default(), plugins), net)
}

#[tokio::test]
async fn test_channel_bot_leaves_after_sixty_beats() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://mybot@irc.freenode.net"));
    el.add_handler(Arc::new(ChannelBot::new("#somechannel", "somebuddy")));
    el.register_heartbeat(Arc::new(Lifetime::default()));
    let handle = assert_ok!(el.connect(id).await);

    let summary = assert_ok!(el.run(Duration::from_millis(1), Some(1000)).await);
    assert_eq!(summary.ticks, 62);
    assert_eq!(summary.reason, StopReason::Stopped);
    assert_eq!(summary.handler_errors, 0);
    assert_eq!(el.session_state(handle), Some(ConnectionState::Disconnected));
    assert_eq!(el.sessions().session(handle).unwrap().last_heartbeat_tick(), 62);

    let peer = net.peer(Protocol::Irc, "mybot");
    assert_eq!(
        peer.calls(),
        vec![
            LoopbackCall::Connect { username: "mybot".into() },
            LoopbackCall::JoinChat { room: "#somechannel".into() },
            LoopbackCall::Invite {
                room: "#somechannel".into(),
                who: "somebuddy".into(),
                message: "common buddy!".into(),
            },
            LoopbackCall::Send {
                kind: ConversationKind::Chat,
                target: "#somechannel".into(),
                text: "somebuddy, just starting a conversation. hi there".into(),
            },
            LoopbackCall::LeaveChat { room: "#somechannel".into() },
            LoopbackCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_irc_account_greets_buddy_then_leaves_after_lifetime() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://bot@irc.example.net"));
    el.add_handler(Arc::new(EchoBot::new("somebuddy")));
    el.register_heartbeat(Arc::new(Lifetime::default()));
    let handle = assert_ok!(el.connect(id).await);

    let summary = assert_ok!(el.run(Duration::from_millis(1), None).await);
    assert_eq!(summary.reason, StopReason::Stopped);
    assert_eq!(summary.ticks, 62);
    assert_eq!(el.session_state(handle), Some(ConnectionState::Disconnected));

    let peer = net.peer(Protocol::Irc, "bot");
    assert_eq!(
        peer.calls(),
        vec![
            LoopbackCall::Connect { username: "bot".into() },
            LoopbackCall::Send {
                kind: ConversationKind::DirectMessage,
                target: "somebuddy".into(),
                text: "hello friend".into(),
            },
            LoopbackCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_channel_bot_acknowledges_buddy_already_present() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://mybot@irc.freenode.net"));
    el.add_handler(Arc::new(ChannelBot::new("#somechannel", "somebuddy")));
    assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Irc, "mybot");
    peer.set_chat_members("#somechannel", &["SomeBuddy"]);

    assert_ok!(el.run(Duration::ZERO, Some(3)).await);
    assert_eq!(
        peer.sent(),
        vec![("#somechannel".to_string(), "somebuddy, got you ;)".to_string())]
    );
    assert!(!peer.calls().iter().any(|c| matches!(c, LoopbackCall::Invite { .. })));
}

#[tokio::test]
async fn test_channel_bot_answers_mentions_and_plain_messages() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("irc://mybot@irc.freenode.net"));
    el.add_handler(Arc::new(ChannelBot::new("#somechannel", "somebuddy")));
    assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Irc, "mybot");
    peer.set_echo_chat(false);
    peer.deliver_chat("#somechannel", "alice", "hey mybot, you there?", MessageFlags::RECEIVED);
    peer.deliver_chat("#somechannel", "bob", "what time is it", MessageFlags::RECEIVED);

    assert_ok!(el.run(Duration::ZERO, Some(1)).await);
    let replies: Vec<String> = peer.sent().into_iter().map(|(_, text)| text).collect();
    assert_eq!(
        replies,
        vec![
            "alice, why did you say 'hey mybot, you there?'?".to_string(),
            "Sorry, I only can answer this ;(".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_echo_bot_answers_ping_once_on_same_conversation() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://my_uin:my_pass"));
    el.add_handler(Arc::new(EchoBot::new("buddy_uin")));
    assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Icq, "my_uin");
    peer.deliver_im("friend", "ping");

    let summary = assert_ok!(el.run(Duration::ZERO, Some(2)).await);
    assert_eq!(summary.reason, StopReason::MaxTicks);

    let sent = peer.sent();
    assert_eq!(sent[0], ("buddy_uin".to_string(), "hello friend".to_string()));

    let replies: Vec<&(String, String)> = sent.iter().filter(|(to, _)| to == "friend").collect();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].1.starts_with("random saying "));
    assert!(replies[0].1.len() > "random saying ".len());
}

#[tokio::test]
async fn test_echo_bot_ignores_its_own_echo() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://my_uin:my_pass"));
    el.add_handler(Arc::new(EchoBot::new("buddy_uin")));
    assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Icq, "my_uin");
    peer.deliver_im("MY_UIN", "ping");

    assert_ok!(el.run(Duration::ZERO, Some(2)).await);
    assert_eq!(
        peer.sent(),
        vec![("buddy_uin".to_string(), "hello friend".to_string())]
    );
}

#[tokio::test]
async fn test_conference_bot_opens_room_and_answers_nick() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("xmpp://myemail@gmail.com:mypassword@talk.google.com"));
    let room = "someroom@conference.jabber.org";
    el.add_handler(Arc::new(ConferenceBot::new(room, "somebuddy@jabber.org")));
    assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Xmpp, "myemail@gmail.com");
    peer.deliver_chat(room, "somebuddy@jabber.org", "hi myemail@gmail.com", MessageFlags::RECEIVED);

    assert_ok!(el.run(Duration::ZERO, Some(3)).await);

    let calls = peer.calls();
    let invite = calls
        .iter()
        .position(|c| matches!(c, LoopbackCall::Invite { who, .. } if who == "somebuddy@jabber.org"))
        .expect("buddy invited");
    let greeting = calls
        .iter()
        .position(|c| matches!(c, LoopbackCall::Send { text, .. } if text.ends_with("just starting a conversation. hi there")))
        .expect("greeting sent");
    assert!(invite < greeting);

    // The greeting comes back as a self echo and is not answered
    let texts: Vec<String> = peer.sent().into_iter().map(|(_, text)| text).collect();
    assert_eq!(
        texts,
        vec![
            "somebuddy@jabber.org, just starting a conversation. hi there".to_string(),
            "somebuddy@jabber.org, you said 'hi myemail@gmail.com'?".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_conference_bot_stops_on_connection_error() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("xmpp://myemail@gmail.com:mypassword@talk.google.com"));
    let bot = Arc::new(ConferenceBot::new("room@conference.jabber.org", "somebuddy@jabber.org"));
    el.add_handler(bot.clone());
    let handle = assert_ok!(el.connect(id).await);

    net.peer(Protocol::Xmpp, "myemail@gmail.com")
        .fail_next_poll(TransportError::from("stream closed"));

    let summary = assert_ok!(el.run(Duration::ZERO, None).await);
    assert_eq!(summary.reason, StopReason::Stopped);
    assert_eq!(summary.ticks, 1);
    assert_eq!(bot.failure().as_deref(), Some("stream closed"));
    assert_eq!(el.session_state(handle), Some(ConnectionState::Failed));
}

#[tokio::test]
async fn test_authorization_requests_denied_by_default() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://my_uin:my_pass"));
    assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Icq, "my_uin");
    peer.push(ProtocolEvent::AuthorizationRequest {
        remote_user: "stranger".into(),
        message: Some("let me in".into()),
        on_list: false,
    });

    assert_ok!(el.run(Duration::ZERO, Some(1)).await);
    assert!(peer.calls().contains(&LoopbackCall::Authorization {
        remote_user: "stranger".into(),
        accept: false,
    }));
}

#[tokio::test]
async fn test_registered_authorizer_decides() {
    let (mut el, net) = event_loop();
    let id = assert_ok!(el.add_account_uri("icq://my_uin:my_pass"));
    el.set_authorizer(Arc::new(|_: &parley_common::models::Account, r: &AuthorizationRequest| {
        r.remote_user == "friend"
    }));
    assert_ok!(el.connect(id).await);

    let peer = net.peer(Protocol::Icq, "my_uin");
    for who in ["friend", "stranger"] {
        peer.push(ProtocolEvent::AuthorizationRequest {
            remote_user: who.into(),
            message: None,
            on_list: false,
        });
    }

    assert_ok!(el.run(Duration::ZERO, Some(1)).await);
    let answers: Vec<LoopbackCall> = peer
        .calls()
        .into_iter()
        .filter(|c| matches!(c, LoopbackCall::Authorization { .. }))
        .collect();
    assert_eq!(
        answers,
        vec![
            LoopbackCall::Authorization { remote_user: "friend".into(), accept: true },
            LoopbackCall::Authorization { remote_user: "stranger".into(), accept: false },
        ]
    );
}
