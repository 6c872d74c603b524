// A scripted remote buddy for trying the bots without a real network.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use parley_common::models::{MessageFlags, Protocol};
use parley_core::platforms::loopback::LoopbackNetwork;

use crate::BotKind;

const MIN_PERIOD: Duration = Duration::from_millis(100);

pub struct Script {
    bot: BotKind,
    buddy: String,
    room: String,
}

impl Script {
    pub fn new(bot: BotKind, buddy: &str, room: &str) -> Self {
        Self {
            bot,
            buddy: buddy.to_string(),
            room: room.to_string(),
        }
    }

    /// What the buddy says on the `n`th turn to the account `me`.
    fn line(&self, n: u64, me: &str) -> String {
        match n % 3 {
            0 => "ping".to_string(),
            1 => format!("hey {}, are you a bot?", me),
            _ => "nice weather today".to_string(),
        }
    }
}

/// Has the script's buddy talk to every listed account once per `period`.
pub fn spawn(
    network: &LoopbackNetwork,
    script: Script,
    accounts: &[(Protocol, String)],
    period: Duration,
) -> JoinHandle<()> {
    let peers: Vec<_> = accounts
        .iter()
        .map(|(protocol, name)| (name.clone(), network.peer(protocol.clone(), name)))
        .collect();

    for (_, peer) in &peers {
        peer.add_buddy(&script.buddy, None);
        peer.set_presence(&script.buddy, true);
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
        // First tick fires immediately; give the bots a moment to sign on.
        ticker.tick().await;
        let mut turn: u64 = 0;
        loop {
            ticker.tick().await;
            for (me, peer) in &peers {
                let line = script.line(turn, me);
                debug!("(Simulator) {} -> {}: {}", script.buddy, me, line);
                match script.bot {
                    BotKind::Echo => peer.deliver_im(&script.buddy, &line),
                    BotKind::Channel | BotKind::Conference => {
                        peer.deliver_chat(&script.room, &script.buddy, &line, MessageFlags::RECEIVED)
                    }
                }
            }
            turn += 1;
        }
    })
}
