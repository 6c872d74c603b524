use std::env;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use parley_common::models::Protocol;
use parley_core::bots::{ChannelBot, ConferenceBot, EchoBot, Lifetime};
use parley_core::platforms::loopback::LoopbackNetwork;
use parley_core::platforms::PluginRegistry;
use parley_core::{EventLoop, RuntimeConfig, StopReason};

mod simulate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BotKind {
    /// Greets a buddy and answers every direct message (ICQ style)
    Echo,
    /// Joins a channel and answers what is said there (IRC style)
    Channel,
    /// Opens a conference room and chats back (XMPP style)
    Conference,
}

impl BotKind {
    fn default_account(self) -> &'static str {
        match self {
            BotKind::Echo => "icq://my_uin:my_pass",
            BotKind::Channel => "irc://mybot@irc.freenode.net",
            BotKind::Conference => "xmpp://myemail@gmail.com:mypassword@talk.google.com",
        }
    }

    fn default_buddy(self) -> &'static str {
        match self {
            BotKind::Echo => "buddy_uin",
            BotKind::Channel => "somebuddy",
            BotKind::Conference => "somebuddy@jabber.org",
        }
    }

    fn default_room(self) -> &'static str {
        match self {
            BotKind::Echo => "",
            BotKind::Channel => "#somechannel",
            BotKind::Conference => "someroom@conference.jabber.org",
        }
    }

    /// The echo bot runs until stopped; the others leave after a minute of beats.
    fn default_lifetime(self) -> Option<u64> {
        match self {
            BotKind::Echo => None,
            _ => Some(60),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "parley")]
#[command(author, version, about = "parley - multi-account chat bot runtime")]
struct Args {
    /// Which bot to run
    #[arg(long, value_enum, default_value = "channel")]
    bot: BotKind,

    /// Account URI, e.g. irc://nick@irc.example.net. May be repeated.
    /// Falls back to $PARLEY_ACCOUNT, then to the bot's sample account.
    #[arg(long = "account")]
    accounts: Vec<String>,

    /// Buddy the bot talks to
    #[arg(long)]
    buddy: Option<String>,

    /// Channel or conference room to join
    #[arg(long)]
    room: Option<String>,

    /// JSON runtime config file
    #[arg(long)]
    config: Option<String>,

    /// Tick interval in milliseconds (overrides the config file)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Stop after this many ticks (overrides the config file)
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Heartbeats before the bot disconnects and stops; 0 disables
    #[arg(long)]
    lifetime: Option<u64>,

    /// Play a chatty remote buddy over the loopback network
    #[arg(long, default_value = "false")]
    simulate: bool,
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("parley=info".parse().unwrap_or_default());
    let sub = fmt().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(sub) {
        eprintln!("[parley]: could not install tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_tracing();
    let args = Args::parse();
    info!("parley starting. bot={:?}, simulate={}", args.bot, args.simulate);

    if let Err(e) = run(args).await {
        error!("parley error: {:#}", e);
        eprintln!("[parley]: {}", e);
        std::process::exit(1);
    }
    info!("Main finished. Goodbye!");
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(ms) = args.tick_ms {
        config.tick_interval_ms = ms;
    }
    if args.max_ticks.is_some() {
        config.max_ticks = args.max_ticks;
    }

    let mut accounts = args.accounts.clone();
    if accounts.is_empty() {
        if let Ok(uri) = env::var("PARLEY_ACCOUNT") {
            accounts.push(uri);
        }
    }
    if accounts.is_empty() && config.accounts.is_empty() {
        accounts.push(args.bot.default_account().to_string());
    }
    config.accounts.extend(accounts);

    let network = LoopbackNetwork::new();
    let mut plugins = PluginRegistry::new();
    network.register(
        &mut plugins,
        &[Protocol::Icq, Protocol::Aim, Protocol::Irc, Protocol::Xmpp],
    );
    let mut event_loop = EventLoop::from_config(config, plugins)?;

    let buddy = args
        .buddy
        .clone()
        .unwrap_or_else(|| args.bot.default_buddy().to_string());
    let room = args
        .room
        .clone()
        .unwrap_or_else(|| args.bot.default_room().to_string());

    let mut conference = None;
    match args.bot {
        BotKind::Echo => event_loop.add_handler(Arc::new(EchoBot::new(&buddy))),
        BotKind::Channel => event_loop.add_handler(Arc::new(ChannelBot::new(&room, &buddy))),
        BotKind::Conference => {
            let bot = Arc::new(ConferenceBot::new(&room, &buddy));
            event_loop.add_handler(bot.clone());
            conference = Some(bot);
        }
    }
    match args.lifetime.or(args.bot.default_lifetime()) {
        Some(0) | None => {}
        Some(beats) => event_loop.register_heartbeat(Arc::new(Lifetime::new(beats))),
    }

    for (_, result) in event_loop.connect_all().await {
        result?;
    }

    let simulator = if args.simulate {
        let accounts: Vec<(Protocol, String)> = event_loop
            .accounts()
            .iter()
            .map(|(_, account)| (account.protocol.clone(), account.username.clone()))
            .collect();
        Some(simulate::spawn(
            &network,
            simulate::Script::new(args.bot, &buddy, &room),
            &accounts,
            event_loop.config().tick_interval() * 3,
        ))
    } else {
        None
    };

    let stop = event_loop.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping at the next tick.");
            stop.stop();
        }
    });

    let summary = event_loop.run_configured().await?;
    event_loop.disconnect_all().await;
    if let Some(task) = simulator {
        task.abort();
    }

    if let Some(description) = conference.and_then(|bot| bot.failure()) {
        bail!(description);
    }
    if summary.reason == StopReason::AllSessionsFailed {
        bail!("all sessions failed after {} tick(s)", summary.ticks);
    }
    info!(
        "parley done => {} after {} tick(s), {} handler error(s)",
        summary.reason, summary.ticks, summary.handler_errors
    );
    Ok(())
}
