//! Voice channels: per-guild realtime workers and their lifecycle.
//!
//! One worker per guild. Joining a bound voice channel starts it; the last
//! human leaving stops it. The worker itself lives in `worker`; everything
//! here is registry and Discord-side plumbing.

pub mod audio;
pub mod driver;
pub mod realtime;
pub mod tools;
pub mod worker;

use crate::db::ChannelType as BoundChannelType;
use crate::discord::bot;
use crate::error::VoiceError;
use crate::state::SharedState;
use crate::voice::worker::{WorkerConfig, WorkerInput};
use serenity::all::{ChannelId, Context, GuildId, VoiceState};
use songbird::Songbird;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Budget for a worker to wind down after `Stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running per-guild voice worker.
pub struct VoiceWorker {
    guild_id: u64,
    input_tx: mpsc::Sender<WorkerInput>,
    worker_task: tokio::task::JoinHandle<()>,
    tx_task: tokio::task::JoinHandle<()>,
    manager: Arc<Songbird>,
}

/// Registry of live voice workers, keyed by guild.
#[derive(Default)]
pub struct VoiceRegistry {
    workers: Mutex<HashMap<u64, VoiceWorker>>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has(&self, guild_id: u64) -> bool {
        self.workers.lock().await.contains_key(&guild_id)
    }

    async fn insert(&self, worker: VoiceWorker) {
        let mut workers = self.workers.lock().await;
        if let Some(previous) = workers.insert(worker.guild_id, worker) {
            tracing::warn!(guild_id = previous.guild_id, "replacing live voice worker");
            previous.worker_task.abort();
            previous.tx_task.abort();
        }
    }

    async fn remove(&self, guild_id: u64) -> Option<VoiceWorker> {
        self.workers.lock().await.remove(&guild_id)
    }

    /// Stop every worker in parallel (process shutdown).
    pub async fn stop_all(&self) {
        let workers: Vec<VoiceWorker> = {
            let mut map = self.workers.lock().await;
            map.drain().map(|(_, worker)| worker).collect()
        };
        let mut tasks = Vec::with_capacity(workers.len());
        for worker in workers {
            tasks.push(tokio::spawn(shutdown_worker(worker)));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn shutdown_worker(worker: VoiceWorker) {
    let _ = worker.input_tx.send(WorkerInput::Stop).await;
    if tokio::time::timeout(STOP_TIMEOUT, worker.worker_task)
        .await
        .is_err()
    {
        tracing::warn!(guild_id = worker.guild_id, "voice worker did not stop in time");
    }
    worker.tx_task.abort();
    if let Err(error) = worker.manager.remove(GuildId::new(worker.guild_id)).await {
        tracing::debug!(%error, guild_id = worker.guild_id, "voice leave failed");
    }
}

/// React to guild voice-state updates: start a worker when an authorized
/// human joins a bound voice channel, stop it when the channel empties.
pub async fn handle_voice_state(
    state: SharedState,
    ctx: Context,
    old: Option<VoiceState>,
    new: VoiceState,
) -> crate::Result<()> {
    let Some(guild_id) = new.guild_id else {
        return Ok(());
    };
    if new.member.as_ref().is_some_and(|member| member.user.bot) {
        return Ok(());
    }

    // Join side.
    if let Some(channel_id) = new.channel_id {
        if let Some(binding) = state.db.channel_binding(&channel_id.to_string()).await? {
            if binding.channel_type == BoundChannelType::Voice
                && !state.voice.has(guild_id.get()).await
                && bot::is_authorized(&ctx, guild_id, new.user_id).await
            {
                start_worker(
                    &state,
                    &ctx,
                    guild_id,
                    channel_id,
                    PathBuf::from(&binding.directory),
                )
                .await?;
            }
        }
    }

    // Leave side: the previous channel may now be empty of humans.
    if let Some(previous) = old.and_then(|voice_state| voice_state.channel_id) {
        if Some(previous) != new.channel_id && state.voice.has(guild_id.get()).await {
            let bound = state
                .db
                .channel_binding(&previous.to_string())
                .await?
                .is_some_and(|binding| binding.channel_type == BoundChannelType::Voice);
            if bound && channel_is_empty(&ctx, guild_id, previous) {
                if let Some(worker) = state.voice.remove(guild_id.get()).await {
                    tracing::info!(guild_id = guild_id.get(), "voice channel empty, stopping worker");
                    shutdown_worker(worker).await;
                }
            }
        }
    }

    Ok(())
}

/// No human (non-bot, non-self) users left in the channel, per cache.
fn channel_is_empty(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> bool {
    let current_user = ctx.cache.current_user().id;
    let Some(guild) = ctx.cache.guild(guild_id) else {
        return false;
    };
    !guild.voice_states.values().any(|voice_state| {
        voice_state.channel_id == Some(channel_id) && voice_state.user_id != current_user
    })
}

async fn start_worker(
    state: &SharedState,
    ctx: &Context,
    guild_id: GuildId,
    channel_id: ChannelId,
    directory: PathBuf,
) -> crate::Result<()> {
    let Some(api_key) = state.config.google_api_key.clone() else {
        tracing::warn!("voice requested but no Google API key is configured");
        return Ok(());
    };

    let manager = songbird::get(ctx)
        .await
        .ok_or_else(|| VoiceError::Join("voice driver not registered".into()))?
        .clone();

    let call = manager
        .join(guild_id, channel_id)
        .await
        .map_err(|error| VoiceError::Join(error.to_string()))?;

    let (input_tx, input_rx) = mpsc::channel(256);
    let (output_tx, output_rx) = mpsc::channel(256);

    driver::install_rx(&call, input_tx.clone()).await;

    // Worker errors surface into the project's text channel.
    let error_channel = state
        .db
        .channels_for_directory(&directory.to_string_lossy())
        .await?
        .into_iter()
        .find(|binding| binding.channel_type == BoundChannelType::Text)
        .and_then(|binding| binding.channel_id.parse::<u64>().ok())
        .map(ChannelId::new);

    let tx_task = tokio::spawn(driver::run_tx(
        call.clone(),
        output_rx,
        ctx.http.clone(),
        error_channel,
    ));

    let config = WorkerConfig {
        api_key,
        model: state.config.realtime_model.clone(),
        directory: directory.clone(),
        debug_audio_path: state
            .config
            .debug_audio_log
            .then(|| state.config.data_dir.join("voice-debug.pcm")),
    };
    let worker_task = tokio::spawn(worker::run(
        state.clone(),
        config,
        input_rx,
        output_tx,
    ));

    state
        .voice
        .insert(VoiceWorker {
            guild_id: guild_id.get(),
            input_tx,
            worker_task,
            tx_task,
            manager,
        })
        .await;

    tracing::info!(guild_id = guild_id.get(), %channel_id, directory = %directory.display(), "voice worker started");
    Ok(())
}
