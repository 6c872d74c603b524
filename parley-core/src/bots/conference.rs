use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::error;

use parley_common::error::HandlerError;
use parley_common::models::{normalize_name, ConversationKind, EventKind, RuntimeEvent};

use crate::bots::{greet_in_chat, log_transcript, random_saying};
use crate::dispatch::{EventHandler, HandlerContext};

/// Opens a conference room on sign-on, brings a buddy in and chats back. A connection
/// error stops the loop and is kept for the caller to report.
pub struct ConferenceBot {
    room: String,
    buddy: String,
    failure: Mutex<Option<String>>,
}

impl ConferenceBot {
    pub fn new(room: &str, buddy: &str) -> Self {
        Self {
            room: room.to_string(),
            buddy: buddy.to_string(),
            failure: Mutex::new(None),
        }
    }

    /// Description of the connection error that stopped the loop, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

#[async_trait]
impl EventHandler for ConferenceBot {
    fn id(&self) -> &str {
        "bot.conference"
    }

    fn event_kinds(&self) -> Vec<EventKind> {
        vec![
            EventKind::SignedOn,
            EventKind::MessageReceived,
            EventKind::ConnectionError,
        ]
    }

    async fn handle(&self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        match event {
            RuntimeEvent::SignedOn { .. } => {
                let room = ctx.open_conversation(ConversationKind::Chat, &self.room).await?;
                greet_in_chat(ctx, &room, &self.buddy).await?;
            }
            RuntimeEvent::Message(msg) => {
                log_transcript(msg);
                let own = ctx.account().map(|a| a.normalized_username()).unwrap_or_default();
                if msg.is_self_echo() || normalize_name(msg.sender.id()) == own {
                    return Ok(());
                }
                if msg.mentions_us() {
                    let reply = format!("{}, you said '{}'?", msg.sender.alias(), msg.body);
                    ctx.send_message(&msg.conversation, &reply).await?;
                } else if msg.is_received() {
                    ctx.send_message(&msg.conversation, &random_saying()).await?;
                }
            }
            RuntimeEvent::ConnectionError { session, reason, description, .. } => {
                error!("(ConferenceBot) {} connection error ({}) => {}", session, reason, description);
                *self.failure.lock() = Some(description.clone());
                ctx.stop();
            }
            _ => {}
        }
        Ok(())
    }
}
