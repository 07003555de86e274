//! Slash command surface and autocompletes.

use crate::agent::client::PermissionReply;
use crate::agent::types::Project;
use crate::bridge::cancel::AbortReason;
use crate::bridge::orchestrator::{self, SubmitRequest};
use crate::discord::{bot, channels};
use crate::state::SharedState;
use serenity::all::{
    ChannelType, CommandDataOptionValue, CommandInteraction, CommandOptionType, Context,
    CreateAutocompleteResponse, CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateThread, EditInteractionResponse,
};
use std::path::PathBuf;

/// Thread names are longer than message titles but still capped by Discord.
const THREAD_NAME_LIMIT: usize = 100;

/// Autocomplete result cap (Discord rejects more than 25 choices).
const AUTOCOMPLETE_LIMIT: usize = 25;

/// Register the global slash command set.
pub async fn register_commands(ctx: &Context) {
    let commands = vec![
        CreateCommand::new("session")
            .description("Start a new agent session in this project channel")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "prompt", "What to work on")
                    .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "files",
                    "Comma-separated project files to mention",
                )
                .set_autocomplete(true),
            ),
        CreateCommand::new("resume")
            .description("Resume an existing agent session in a new thread")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "session", "Session to resume")
                    .required(true)
                    .set_autocomplete(true),
            ),
        CreateCommand::new("add-project")
            .description("Create channels for a project the agent already knows")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "project", "Known project")
                    .required(true)
                    .set_autocomplete(true),
            ),
        CreateCommand::new("create-new-project")
            .description("Scaffold a fresh project directory with channels")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "name", "Project name")
                    .required(true),
            ),
        CreateCommand::new("add-existing-project")
            .description("Bind channels to an existing directory on disk")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "path", "Directory path")
                    .required(true),
            ),
        CreateCommand::new("accept").description("Accept the pending permission request"),
        CreateCommand::new("accept-always")
            .description("Accept the pending permission request and similar future ones"),
        CreateCommand::new("reject").description("Reject the pending permission request"),
        CreateCommand::new("abort").description("Abort the running session in this thread"),
        CreateCommand::new("share").description("Share this thread's session and post the link"),
    ];

    for command in commands {
        if let Err(error) =
            serenity::all::Command::create_global_command(&ctx.http, command).await
        {
            tracing::error!(%error, "failed to register slash command");
        }
    }
}

/// Entry point for command interactions. Unknown commands are ignored.
pub async fn dispatch_command(state: SharedState, ctx: Context, command: CommandInteraction) {
    let Some(guild_id) = command.guild_id else {
        return;
    };
    if !bot::is_authorized(&ctx, guild_id, command.user.id).await {
        return;
    }

    let name = command.data.name.clone();
    let result = match name.as_str() {
        "session" => session_command(&state, &ctx, &command).await,
        "resume" => resume_command(&state, &ctx, &command).await,
        "add-project" => add_project_command(&state, &ctx, &command).await,
        "create-new-project" => create_new_project_command(&state, &ctx, &command).await,
        "add-existing-project" => add_existing_project_command(&state, &ctx, &command).await,
        "accept" => permission_command(&state, &ctx, &command, PermissionReply::Once).await,
        "accept-always" => permission_command(&state, &ctx, &command, PermissionReply::Always).await,
        "reject" => permission_command(&state, &ctx, &command, PermissionReply::Reject).await,
        "abort" => abort_command(&state, &ctx, &command).await,
        "share" => share_command(&state, &ctx, &command).await,
        _ => return,
    };

    if let Err(error) = result {
        tracing::error!(%error, command = %name, "slash command failed");
        let text = format!("✗ {error}");
        // Either path works depending on whether the command already ACKed.
        if command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new().content(text.clone()).ephemeral(true),
                ),
            )
            .await
            .is_err()
        {
            let _ = command
                .edit_response(&ctx.http, EditInteractionResponse::new().content(text))
                .await;
        }
    }
}

fn str_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command.data.options.iter().find_map(|option| {
        if option.name != name {
            return None;
        }
        match &option.value {
            CommandDataOptionValue::String(value) => Some(value.as_str()),
            _ => None,
        }
    })
}

async fn reply_text(
    ctx: &Context,
    command: &CommandInteraction,
    text: impl Into<String>,
) -> crate::Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(text),
            ),
        )
        .await?;
    Ok(())
}

async fn defer(ctx: &Context, command: &CommandInteraction) -> crate::Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;
    Ok(())
}

async fn finish_deferred(
    ctx: &Context,
    command: &CommandInteraction,
    text: impl Into<String>,
) -> crate::Result<()> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(text))
        .await?;
    Ok(())
}

// --- project session commands ---------------------------------------------

async fn session_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
) -> crate::Result<()> {
    let prompt = str_option(command, "prompt").unwrap_or_default().to_owned();
    let files = str_option(command, "files").unwrap_or_default().to_owned();

    let Some(directory) = channels::directory_for(state, ctx, command.channel_id).await? else {
        return reply_text(ctx, command, "This channel is not bound to a project.").await;
    };

    let mut full_prompt = prompt.clone();
    let mentions: Vec<String> = files
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| format!("@{f}"))
        .collect();
    if !mentions.is_empty() {
        full_prompt.push(' ');
        full_prompt.push_str(&mentions.join("@ "));
    }

    // The interaction response doubles as the starter message.
    reply_text(ctx, command, prompt.as_str()).await?;
    let starter = command.get_response(&ctx.http).await?;

    let thread_name = crate::truncate_chars(&prompt, THREAD_NAME_LIMIT);
    let thread = command
        .channel_id
        .create_thread_from_message(&ctx.http, starter.id, CreateThread::new(thread_name))
        .await?;

    let request = SubmitRequest {
        thread_id: thread.id,
        prompt: full_prompt,
        file_parts: Vec::new(),
        directory,
        triggering: Some((command.channel_id, starter.id)),
    };
    tokio::spawn(orchestrator::submit(state.clone(), ctx.http.clone(), request));
    Ok(())
}

async fn resume_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
) -> crate::Result<()> {
    let session_id = str_option(command, "session").unwrap_or_default().to_owned();
    let Some(directory) = channels::directory_for(state, ctx, command.channel_id).await? else {
        return reply_text(ctx, command, "This channel is not bound to a project.").await;
    };

    defer(ctx, command).await?;

    let client = state.agents.client_for(&directory).await?;
    let session = client.get_session(&session_id).await?;

    let thread_name = format!("Resume: {}", session.title);
    let thread_name = crate::truncate_chars(&thread_name, THREAD_NAME_LIMIT);
    let thread = command
        .channel_id
        .create_thread(
            &ctx.http,
            CreateThread::new(thread_name).kind(ChannelType::PublicThread),
        )
        .await?;

    orchestrator::resume_session(state, &ctx.http, thread.id, &client, &session_id).await?;
    finish_deferred(ctx, command, format!("Resumed `{}` in <#{}>", session.title, thread.id)).await
}

async fn add_project_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
) -> crate::Result<()> {
    let project_id = str_option(command, "project").unwrap_or_default().to_owned();
    let Some(guild_id) = command.guild_id else {
        return Ok(());
    };

    defer(ctx, command).await?;

    let project = find_project(state, &project_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("unknown project: {project_id}"))?;
    let directory = PathBuf::from(&project.worktree);

    // Heal stale rows: a recorded channel that Discord no longer knows is
    // deleted and the binding recreated.
    let mut already_bound = false;
    for binding in state.db.channels_for_directory(&project.worktree).await? {
        let channel_id: u64 = binding.channel_id.parse().unwrap_or(0);
        match ctx.http.get_channel(channel_id.into()).await {
            Ok(_) => already_bound = true,
            Err(_) => {
                tracing::info!(channel_id = %binding.channel_id, "removing stale channel row");
                state.db.delete_channel(&binding.channel_id).await?;
            }
        }
    }
    if already_bound {
        return finish_deferred(ctx, command, "That project already has channels here.").await;
    }

    let text = channels::create_project_channels(state, ctx, guild_id, &directory).await?;
    finish_deferred(ctx, command, format!("Project bound: <#{}>", text.id)).await
}

async fn create_new_project_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
) -> crate::Result<()> {
    let name = str_option(command, "name").unwrap_or_default().to_owned();
    let Some(guild_id) = command.guild_id else {
        return Ok(());
    };

    defer(ctx, command).await?;

    let sanitized = channels::sanitize_name(&name);
    let directory = crate::config::Config::projects_root().join(&sanitized);
    std::fs::create_dir_all(&directory).map_err(crate::Error::Io)?;

    let git = tokio::process::Command::new("git")
        .arg("init")
        .current_dir(&directory)
        .output()
        .await;
    if let Err(error) = git {
        tracing::warn!(%error, "git init failed");
    }

    let text = channels::create_project_channels(state, ctx, guild_id, &directory).await?;
    start_project_thread(
        state,
        ctx,
        text.id,
        directory,
        "Say hello, then suggest a few things we could build in this brand-new project.",
    )
    .await?;
    finish_deferred(ctx, command, format!("Project created: <#{}>", text.id)).await
}

async fn add_existing_project_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
) -> crate::Result<()> {
    let path = str_option(command, "path").unwrap_or_default().to_owned();
    let Some(guild_id) = command.guild_id else {
        return Ok(());
    };

    defer(ctx, command).await?;

    let directory = channels::normalize_path(&path);
    if !directory.is_dir() {
        return finish_deferred(
            ctx,
            command,
            format!("`{}` is not an existing directory.", directory.display()),
        )
        .await;
    }

    let text = channels::create_project_channels(state, ctx, guild_id, &directory).await?;
    start_project_thread(
        state,
        ctx,
        text.id,
        directory,
        "Take a quick look at this project and ask what I want to work on.",
    )
    .await?;
    finish_deferred(ctx, command, format!("Project bound: <#{}>", text.id)).await
}

/// Open a greeting thread in a fresh project channel and submit `prompt`.
async fn start_project_thread(
    state: &SharedState,
    ctx: &Context,
    channel_id: serenity::all::ChannelId,
    directory: PathBuf,
    prompt: &str,
) -> crate::Result<()> {
    let thread = channel_id
        .create_thread(
            &ctx.http,
            CreateThread::new("getting started").kind(ChannelType::PublicThread),
        )
        .await?;

    let request = SubmitRequest {
        thread_id: thread.id,
        prompt: prompt.to_owned(),
        file_parts: Vec::new(),
        directory,
        triggering: None,
    };
    tokio::spawn(orchestrator::submit(state.clone(), ctx.http.clone(), request));
    Ok(())
}

// --- thread-scoped commands ------------------------------------------------

async fn permission_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
    reply: PermissionReply,
) -> crate::Result<()> {
    let thread_key = command.channel_id.to_string();
    let Some(pending) = state.permissions.take(&thread_key) else {
        return reply_text(ctx, command, "No permission request is pending here.").await;
    };

    let client = state.agents.client_for(&pending.directory).await?;
    client
        .reply_permission(&pending.session_id, &pending.permission_id, reply)
        .await?;

    let confirmation = match reply {
        PermissionReply::Once => "✅ Permission accepted",
        PermissionReply::Always => "✅ Permission accepted (auto-approve similar requests)",
        PermissionReply::Reject => "🚫 Permission rejected",
    };
    reply_text(ctx, command, confirmation).await
}

async fn abort_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
) -> crate::Result<()> {
    let thread_key = command.channel_id.to_string();
    let Some(session_id) = state.db.thread_session(&thread_key).await? else {
        return reply_text(ctx, command, "No session is bound to this thread.").await;
    };

    state.aborts.abort(&session_id, AbortReason::UserAbort);

    if let Some(directory) = channels::directory_for(state, ctx, command.channel_id).await? {
        let client = state.agents.client_for(&directory).await?;
        if let Err(error) = client.abort(&session_id).await {
            tracing::warn!(%error, session_id, "agent-side abort failed");
        }
    }

    reply_text(ctx, command, "⏹ Session aborted.").await
}

async fn share_command(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
) -> crate::Result<()> {
    let thread_key = command.channel_id.to_string();
    let Some(session_id) = state.db.thread_session(&thread_key).await? else {
        return reply_text(ctx, command, "No session is bound to this thread.").await;
    };
    let Some(directory) = channels::directory_for(state, ctx, command.channel_id).await? else {
        return reply_text(ctx, command, "This thread is not bound to a project.").await;
    };

    defer(ctx, command).await?;
    let client = state.agents.client_for(&directory).await?;
    match client.share(&session_id).await? {
        Some(url) => finish_deferred(ctx, command, format!("🔗 **Session shared:** {url}")).await,
        None => finish_deferred(ctx, command, "The agent did not return a share link.").await,
    }
}

// --- autocomplete -----------------------------------------------------------

pub async fn dispatch_autocomplete(
    state: SharedState,
    ctx: Context,
    command: CommandInteraction,
) {
    let Some(focused) = command.data.autocomplete() else {
        return;
    };
    let query = focused.value.to_owned();

    let choices = match (command.data.name.as_str(), focused.name) {
        ("resume", "session") => resume_choices(&state, &ctx, &command, &query).await,
        ("session", "files") => file_choices(&state, &ctx, &command, &query).await,
        ("add-project", "project") => project_choices(&state, &query).await,
        _ => Vec::new(),
    };

    let mut response = CreateAutocompleteResponse::new();
    for (label, value) in choices.into_iter().take(AUTOCOMPLETE_LIMIT) {
        response = response.add_string_choice(label, value);
    }
    if let Err(error) = command
        .create_response(&ctx.http, CreateInteractionResponse::Autocomplete(response))
        .await
    {
        tracing::debug!(%error, "autocomplete response failed");
    }
}

/// Last 25 sessions matching the prefix, newest first.
async fn resume_choices(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
    query: &str,
) -> Vec<(String, String)> {
    let Ok(Some(directory)) = channels::directory_for(state, ctx, command.channel_id).await else {
        return Vec::new();
    };
    let Ok(client) = state.agents.client_for(&directory).await else {
        return Vec::new();
    };
    let Ok(mut sessions) = client.list_sessions().await else {
        return Vec::new();
    };

    sessions.sort_by_key(|session| std::cmp::Reverse(session.time.updated));
    let needle = query.to_lowercase();
    sessions
        .into_iter()
        .filter(|session| {
            needle.is_empty() || session.title.to_lowercase().contains(&needle)
        })
        .take(AUTOCOMPLETE_LIMIT)
        .map(|session| {
            let date = chrono::DateTime::from_timestamp_millis(session.time.updated)
                .map(|ts| ts.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let label = format!("{} ({date})", session.title);
            (crate::truncate_chars(&label, 100).to_owned(), session.id)
        })
        .collect()
}

/// Complete the last comma-delimited token against project files; the label
/// shows every selected basename.
async fn file_choices(
    state: &SharedState,
    ctx: &Context,
    command: &CommandInteraction,
    query: &str,
) -> Vec<(String, String)> {
    let Ok(Some(directory)) = channels::directory_for(state, ctx, command.channel_id).await else {
        return Vec::new();
    };
    let Ok(client) = state.agents.client_for(&directory).await else {
        return Vec::new();
    };

    let (prefix, token) = match query.rsplit_once(',') {
        Some((prefix, token)) => (format!("{prefix},"), token.trim()),
        None => (String::new(), query.trim()),
    };

    let Ok(matches) = client.find_files(token).await else {
        return Vec::new();
    };

    matches
        .into_iter()
        .take(AUTOCOMPLETE_LIMIT)
        .map(|path| {
            let value = format!("{prefix}{path}");
            let label: String = value
                .split(',')
                .map(|entry| entry.rsplit('/').next().unwrap_or(entry).trim())
                .collect::<Vec<_>>()
                .join(",");
            (crate::truncate_chars(&label, 100).to_owned(), value)
        })
        .collect()
}

/// Agent-known projects without channels yet, newest first.
async fn project_choices(state: &SharedState, query: &str) -> Vec<(String, String)> {
    let Ok(projects) = known_projects(state).await else {
        return Vec::new();
    };
    let Ok(bindings) = state.db.channel_bindings().await else {
        return Vec::new();
    };
    let bound: Vec<&str> = bindings.iter().map(|b| b.directory.as_str()).collect();

    let needle = query.to_lowercase();
    let mut projects = projects;
    projects.sort_by_key(|project| std::cmp::Reverse(project.time.updated));
    projects
        .into_iter()
        .filter(|project| !bound.contains(&project.worktree.as_str()))
        .filter(|project| needle.is_empty() || project.worktree.to_lowercase().contains(&needle))
        .take(AUTOCOMPLETE_LIMIT)
        .map(|project| {
            let label = crate::truncate_chars(&project.worktree, 100).to_owned();
            (label, project.id)
        })
        .collect()
}

async fn known_projects(state: &SharedState) -> crate::Result<Vec<Project>> {
    let client = state.agents.client_for(&host_directory(state).await).await?;
    Ok(client.projects().await?)
}

async fn find_project(state: &SharedState, project_id: &str) -> crate::Result<Option<Project>> {
    let projects = known_projects(state).await?;
    Ok(projects.into_iter().find(|p| p.id == project_id))
}

/// Directory whose agent answers project-catalog queries: any bound project,
/// falling back to the projects root.
async fn host_directory(state: &SharedState) -> PathBuf {
    if let Ok(bindings) = state.db.channel_bindings().await {
        if let Some(binding) = bindings.first() {
            return PathBuf::from(&binding.directory);
        }
    }
    let root = crate::config::Config::projects_root();
    let _ = std::fs::create_dir_all(&root);
    root
}

#[cfg(test)]
mod tests {
    #[test]
    fn file_label_concatenates_basenames() {
        let value = "src/main.rs,docs/readme.md";
        let label: String = value
            .split(',')
            .map(|entry| entry.rsplit('/').next().unwrap_or(entry).trim())
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(label, "main.rs,readme.md");
    }
}
