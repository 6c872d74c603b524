use async_trait::async_trait;
use tracing::info;

use parley_common::error::HandlerError;
use parley_common::models::Heartbeat;

use crate::dispatch::{HandlerContext, HeartbeatHandler};

/// Default number of beats a session lives through before the bot leaves.
pub const DEFAULT_MAX_BEATS: u64 = 60;

/// Disconnects a session and stops the loop once the session has seen more than
/// `max_beats` heartbeats.
pub struct Lifetime {
    max_beats: u64,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BEATS)
    }
}

impl Lifetime {
    pub fn new(max_beats: u64) -> Self {
        Self { max_beats }
    }
}

#[async_trait]
impl HeartbeatHandler for Lifetime {
    fn id(&self) -> &str {
        "bot.lifetime"
    }

    async fn beat(&self, beat: &Heartbeat, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        if beat.count > self.max_beats {
            info!(
                "(Lifetime) {} done after {} beats (tick {})",
                beat.session, beat.count, beat.tick
            );
            ctx.disconnect().await;
            ctx.stop();
        }
        Ok(())
    }
}
