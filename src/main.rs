//! Bridge entry point.

use anyhow::Context as _;
use clap::Parser;
use remote_vibe::config::Config;
use remote_vibe::db::Database;
use remote_vibe::discord::Bot;
use remote_vibe::lifecycle::{self, Shutdown};
use remote_vibe::state::State;
use serenity::prelude::GatewayIntents;
use songbird::driver::DecodeMode;
use songbird::SerenityInit as _;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "remote-vibe")]
#[command(about = "Drive a local coding agent from Discord text and voice channels")]
struct Cli {
    /// Data directory (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let exit_code = match run(cli).await {
        Ok(shutdown) => match shutdown {
            Shutdown::Exit => 0,
            Shutdown::Restart => {
                // Only returns on failure.
                let error = lifecycle::reexec();
                tracing::error!(%error, "re-exec failed");
                1
            }
        },
        Err(error) => {
            tracing::error!(%error, "fatal error");
            lifecycle::EXIT_NO_RESTART
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<Shutdown> {
    tracing::info!("starting remote-vibe bridge");

    let _lock = lifecycle::acquire_instance_lock()
        .await
        .context("single-instance check failed")?;

    let data_dir = cli.data_dir.unwrap_or_else(Config::default_data_dir);
    let db = Database::open(&Config::database_path(&data_dir))
        .await
        .context("failed to open database")?;
    let config = Config::load(data_dir, &db)
        .await
        .context("failed to load configuration")?;

    tracing::info!(app_id = %config.app_id, data_dir = %config.data_dir.display(), "configuration loaded");

    let token = config.bot_token.clone();
    let state = State::new(config, db);

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;

    // Receive must decode to PCM for the realtime pipeline.
    let songbird_config = songbird::Config::default().decode_mode(DecodeMode::Decode);

    let mut client = serenity::Client::builder(&token, intents)
        .event_handler(Bot::new(state.clone()))
        .register_songbird_from_config(songbird_config)
        .await
        .context("failed to build the gateway client")?;

    let shard_manager = client.shard_manager.clone();
    let gateway = tokio::spawn(async move {
        if let Err(error) = client.start().await {
            tracing::error!(%error, "gateway client stopped");
        }
    });

    let shutdown = lifecycle::wait_for_shutdown().await;
    tracing::info!(?shutdown, "shutting down");
    state.begin_shutdown();

    // Voice workers first (they hold live connections), then the agent
    // servers, then storage, then the gateway itself.
    state.voice.stop_all().await;
    state.agents.shutdown().await;
    state.db.close().await;
    shard_manager.shutdown_all().await;
    gateway.abort();

    tracing::info!("bridge stopped");
    Ok(shutdown)
}
