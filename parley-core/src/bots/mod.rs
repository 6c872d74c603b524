//! src/bots/mod.rs
//!
//! Ready-made handler sets. Each bot is a single `EventHandler` that declares the kinds it
//! wants; install it with `EventLoop::add_handler`.

pub mod channel;
pub mod conference;
pub mod echo;
pub mod lifetime;

pub use channel::ChannelBot;
pub use conference::ConferenceBot;
pub use echo::EchoBot;
pub use lifetime::Lifetime;

use tracing::info;
use uuid::Uuid;

use parley_common::error::SendError;
use parley_common::models::{Conversation, InboundEvent, Sender};

use crate::dispatch::HandlerContext;

/// `(peer) HH:MM:SS alias: body`, the transcript format every bot logs.
pub fn transcript_line(msg: &InboundEvent) -> String {
    let peer = match &msg.sender {
        Sender::Known(buddy) => buddy.name.as_str(),
        Sender::Unresolved(_) => msg.conversation.name.as_str(),
    };
    format!(
        "({}) {} {}: {}",
        peer,
        msg.timestamp.format("%H:%M:%S"),
        msg.sender.alias(),
        msg.body
    )
}

pub(crate) fn log_transcript(msg: &InboundEvent) {
    info!("{}", transcript_line(msg));
}

pub(crate) fn random_saying() -> String {
    format!("random saying {}", Uuid::new_v4().simple())
}

/// Pulls `buddy` into a chat: invite plus a greeting when they are absent, a short
/// acknowledgement when they are already there.
pub(crate) async fn greet_in_chat(
    ctx: &mut HandlerContext<'_>,
    conversation: &Conversation,
    buddy: &str,
) -> Result<(), SendError> {
    if !ctx.is_user_in_chat(conversation, buddy).await? {
        ctx.invite_user(conversation, buddy, "common buddy!").await?;
        ctx.send_message(conversation, &format!("{}, just starting a conversation. hi there", buddy))
            .await
    } else {
        ctx.send_message(conversation, &format!("{}, got you ;)", buddy))
            .await
    }
}
