use async_trait::async_trait;

use parley_common::error::HandlerError;
use parley_common::models::{ConversationKind, EventKind, RuntimeEvent};

use crate::bots::{greet_in_chat, log_transcript};
use crate::dispatch::{EventHandler, HandlerContext};

/// Joins a channel on sign-on, pulls a buddy in once the join is confirmed and answers
/// whatever is said in the channel.
pub struct ChannelBot {
    channel: String,
    buddy: String,
}

impl ChannelBot {
    pub fn new(channel: &str, buddy: &str) -> Self {
        Self {
            channel: channel.to_string(),
            buddy: buddy.to_string(),
        }
    }
}

#[async_trait]
impl EventHandler for ChannelBot {
    fn id(&self) -> &str {
        "bot.channel"
    }

    fn event_kinds(&self) -> Vec<EventKind> {
        vec![EventKind::SignedOn, EventKind::ChatJoined, EventKind::MessageReceived]
    }

    async fn handle(&self, event: &RuntimeEvent, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        match event {
            RuntimeEvent::SignedOn { .. } => {
                ctx.open_conversation(ConversationKind::Chat, &self.channel).await?;
            }
            RuntimeEvent::ChatJoined { conversation } => {
                greet_in_chat(ctx, conversation, &self.buddy).await?;
            }
            RuntimeEvent::Message(msg) => {
                log_transcript(msg);
                if msg.is_self_echo() {
                    return Ok(());
                }
                let reply = if msg.mentions_us() {
                    format!("{}, why did you say '{}'?", msg.sender.alias(), msg.body)
                } else if msg.is_received() {
                    "Sorry, I only can answer this ;(".to_string()
                } else {
                    return Ok(());
                };
                ctx.send_message(&msg.conversation, &reply).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
