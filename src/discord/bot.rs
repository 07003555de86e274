//! Gateway event handler and the Discord-side authorization gate.

use crate::bridge::orchestrator::{self, SubmitRequest};
use crate::discord::{attachments, commands};
use crate::state::SharedState;
use crate::topic;
use crate::THREAD_TITLE_LIMIT;
use serenity::all::{
    ChannelType, Context, CreateThread, EditThread, EventHandler, GuildId, Interaction, Message,
    Ready, UserId, VoiceState,
};
use serenity::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Role name granting access to the bridge, matched case-insensitively.
const AUTHORIZED_ROLE: &str = "remote-vibe";

/// Best-effort budget for thread renames.
const THREAD_RENAME_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Bot {
    state: SharedState,
}

impl Bot {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl EventHandler for Bot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, app_id = %self.state.config.app_id, "gateway connected");
        commands::register_commands(&ctx).await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let state = self.state.clone();
        if let Err(error) = handle_message(state, ctx, msg).await {
            tracing::error!(%error, "message handler failed");
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command) => {
                commands::dispatch_command(self.state.clone(), ctx, command).await;
            }
            Interaction::Autocomplete(autocomplete) => {
                commands::dispatch_autocomplete(self.state.clone(), ctx, autocomplete).await;
            }
            _ => {}
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let state = self.state.clone();
        if let Err(error) = crate::voice::handle_voice_state(state, ctx, old, new).await {
            tracing::error!(%error, "voice state handler failed");
        }
    }
}

/// Where a message landed, in bridge terms.
enum MessageSurface {
    /// A thread under a bound project channel.
    Thread { directory: PathBuf },
    /// The bound project text channel itself.
    ProjectChannel { directory: PathBuf },
    /// Anything else.
    Unrelated,
}

async fn handle_message(state: SharedState, ctx: Context, msg: Message) -> crate::Result<()> {
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };

    let surface = classify_surface(&state, &ctx, &msg).await?;
    let directory = match &surface {
        MessageSurface::Thread { directory } | MessageSurface::ProjectChannel { directory } => {
            directory.clone()
        }
        MessageSurface::Unrelated => return Ok(()),
    };

    if !is_authorized(&ctx, guild_id, msg.author.id).await {
        return Ok(());
    }

    // Thread messages only continue existing conversations.
    let is_new_thread = matches!(surface, MessageSurface::ProjectChannel { .. });
    if !is_new_thread {
        let binding = state.db.thread_session(&msg.channel_id.to_string()).await?;
        if binding.is_none() {
            return Ok(());
        }
    }

    let mut prompt = msg.content.clone();
    let mut file_parts = Vec::new();

    let classified = attachments::classify(&msg.attachments).await;
    if !classified.inline_text.is_empty() {
        prompt.push_str(&classified.inline_text);
    }
    file_parts.extend(classified.file_parts);

    if let Some(audio) = classified.audio {
        let transcriber = crate::transcribe::Transcriber::from_config(&state.config);
        match transcriber
            .transcribe_url(&audio.url, &audio.mime, Some(directory.as_path()))
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                prompt = text;
            }
            Ok(_) => return Ok(()),
            Err(error) => {
                tracing::warn!(%error, "transcription failed");
                let _ = msg
                    .reply(&ctx.http, "✗ Could not transcribe the voice message.")
                    .await;
                return Ok(());
            }
        }
    }

    if prompt.trim().is_empty() {
        return Ok(());
    }

    let thread_id = if is_new_thread {
        let name = crate::truncate_chars(&prompt, THREAD_TITLE_LIMIT);
        let thread = msg
            .channel_id
            .create_thread_from_message(&ctx.http, msg.id, CreateThread::new(name))
            .await?;
        thread.id
    } else {
        msg.channel_id
    };

    // Voice notes echo their transcript and (on a fresh thread) title it.
    if classified.had_audio {
        let echo = format!(
            "📝 **Transcribed message:** {}",
            prompt.replace("```", "\\`\\`\\`")
        );
        let _ = orchestrator::post_chunks(&ctx.http, thread_id, &echo).await;
        if is_new_thread {
            let name = crate::truncate_chars(&prompt, THREAD_TITLE_LIMIT).to_owned();
            let rename = thread_id.edit_thread(&ctx.http, EditThread::new().name(name));
            if tokio::time::timeout(THREAD_RENAME_TIMEOUT, rename).await.is_err() {
                tracing::debug!(%thread_id, "thread rename timed out");
            }
        }
    }

    // The triggering message lives in the channel it was sent to, which for
    // a fresh thread is the parent channel, not the thread.
    let request = SubmitRequest {
        thread_id,
        prompt,
        file_parts,
        directory,
        triggering: Some((msg.channel_id, msg.id)),
    };

    // The gateway handler must not block on the whole turn.
    let http = ctx.http.clone();
    tokio::spawn(orchestrator::submit(state, http, request));
    Ok(())
}

/// Figure out whether the message belongs to a bound project channel or one
/// of its threads, honoring the app-ownership rule from the topic tags.
async fn classify_surface(
    state: &SharedState,
    ctx: &Context,
    msg: &Message,
) -> crate::Result<MessageSurface> {
    let channel = match msg.channel(&ctx).await {
        Ok(channel) => channel,
        Err(error) => {
            tracing::debug!(%error, channel_id = %msg.channel_id, "channel lookup failed");
            return Ok(MessageSurface::Unrelated);
        }
    };
    let Some(guild_channel) = channel.guild() else {
        return Ok(MessageSurface::Unrelated);
    };

    let is_thread = matches!(
        guild_channel.kind,
        ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread
    );

    let (project_channel_id, surface_is_thread) = if is_thread {
        match guild_channel.parent_id {
            Some(parent) => (parent, true),
            None => return Ok(MessageSurface::Unrelated),
        }
    } else {
        (guild_channel.id, false)
    };

    // The topic descriptor is authoritative for ownership; the database row
    // is the fallback for the directory.
    let project_channel = project_channel_id.to_channel(&ctx).await.ok();
    let tags = project_channel
        .as_ref()
        .and_then(|c| c.clone().guild())
        .and_then(|c| c.topic.clone())
        .map(|t| topic::extract_tags(&t))
        .unwrap_or_default();

    if !tags.owned_by(&state.config.app_id) {
        return Ok(MessageSurface::Unrelated);
    }

    let directory = match tags.directory {
        Some(directory) => Some(directory),
        None => state
            .db
            .channel_binding(&project_channel_id.to_string())
            .await?
            .map(|binding| binding.directory),
    };

    let Some(directory) = directory else {
        return Ok(MessageSurface::Unrelated);
    };
    let directory = PathBuf::from(directory);

    Ok(if surface_is_thread {
        MessageSurface::Thread { directory }
    } else {
        MessageSurface::ProjectChannel { directory }
    })
}

/// Discord-side authorization: server owner, administrator, manage-guild, or
/// a role named `remote-vibe` (case-insensitive).
pub async fn is_authorized(ctx: &Context, guild_id: GuildId, user_id: UserId) -> bool {
    let guild = match ctx.http.get_guild(guild_id).await {
        Ok(guild) => guild,
        Err(error) => {
            tracing::warn!(%error, %guild_id, "guild lookup failed");
            return false;
        }
    };

    if guild.owner_id == user_id {
        return true;
    }

    let member = match guild_id.member(&ctx.http, user_id).await {
        Ok(member) => member,
        Err(error) => {
            tracing::warn!(%error, %guild_id, %user_id, "member lookup failed");
            return false;
        }
    };

    for role_id in &member.roles {
        let Some(role) = guild.roles.get(role_id) else {
            continue;
        };
        if role.permissions.administrator() || role.permissions.manage_guild() {
            return true;
        }
        if role.name.eq_ignore_ascii_case(AUTHORIZED_ROLE) {
            return true;
        }
    }

    false
}
