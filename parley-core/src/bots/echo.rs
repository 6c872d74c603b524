use async_trait::async_trait;
use tracing::debug;

use parley_common::error::HandlerError;
use parley_common::models::{ConversationKind, EventKind, RuntimeEvent};

use crate::bots::{log_transcript, random_saying};
use crate::dispatch::{EventHandler, HandlerContext};

/// Greets a fixed buddy on sign-on and answers every received direct message with a
/// random saying.
pub struct EchoBot {
    buddy: String,
}

impl EchoBot {
    pub fn new(buddy: &str) -> Self {
        Self { buddy: buddy.to_string() }
    }
}

#[async_trait]
impl EventHandler for EchoBot {
    fn id(&self) -> &str {
        "bot.echo"
    }

    fn event_kinds(&self) -> Vec<EventKind> {
        vec![EventKind::SignedOn, EventKind::MessageReceived]
    }

    async fn handle(&self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        match event {
            RuntimeEvent::SignedOn { session, .. } => {
                debug!("(EchoBot) {} signed on, greeting {}", session, self.buddy);
                let conv = ctx
                    .open_conversation(ConversationKind::DirectMessage, &self.buddy)
                    .await?;
                ctx.send_message(&conv, "hello friend").await?;
            }
            RuntimeEvent::Message(msg) => {
                log_transcript(msg);
                if msg.is_received() {
                    ctx.send_message(&msg.conversation, &random_saying()).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
