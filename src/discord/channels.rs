//! Project channel management.
//!
//! Every project gets exactly two channels: a text channel (session entry
//! point) and a voice channel (realtime voice). Both carry the descriptor in
//! their topic and a row in `channel_directories`.

use crate::db::ChannelType as BoundChannelType;
use crate::state::SharedState;
use crate::topic;
use serenity::all::{ChannelId, ChannelType, Context, CreateChannel, GuildChannel, GuildId};
use std::path::{Path, PathBuf};

/// Maximum length for generated channel / project names.
const NAME_LIMIT: usize = 100;

/// Create the text+voice channel pair for a project directory.
///
/// Returns the text channel. Both channels are recorded in the database
/// before this returns.
pub async fn create_project_channels(
    state: &SharedState,
    ctx: &Context,
    guild_id: GuildId,
    directory: &Path,
) -> crate::Result<GuildChannel> {
    let base_name = directory
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_owned());
    let name = sanitize_name(&base_name);
    let descriptor = topic::render_tags(&directory.to_string_lossy(), &state.config.app_id);

    let text = guild_id
        .create_channel(
            &ctx.http,
            CreateChannel::new(&name)
                .kind(ChannelType::Text)
                .topic(&descriptor),
        )
        .await?;

    let voice = guild_id
        .create_channel(
            &ctx.http,
            CreateChannel::new(format!("{name}-voice")).kind(ChannelType::Voice),
        )
        .await?;

    let directory = directory.to_string_lossy();
    state
        .db
        .bind_channel(&text.id.to_string(), &directory, BoundChannelType::Text)
        .await?;
    state
        .db
        .bind_channel(&voice.id.to_string(), &directory, BoundChannelType::Voice)
        .await?;

    tracing::info!(%directory, text_channel = %text.id, voice_channel = %voice.id, "project channels created");
    Ok(text)
}

/// Resolve the project directory for a channel or a thread inside one.
pub async fn directory_for(
    state: &SharedState,
    ctx: &Context,
    channel_id: ChannelId,
) -> crate::Result<Option<PathBuf>> {
    let Ok(channel) = channel_id.to_channel(&ctx).await else {
        return Ok(None);
    };
    let Some(guild_channel) = channel.guild() else {
        return Ok(None);
    };

    let project_channel_id = if guild_channel.thread_metadata.is_some() {
        match guild_channel.parent_id {
            Some(parent) => parent,
            None => return Ok(None),
        }
    } else {
        guild_channel.id
    };

    // Topic descriptor first, database row as fallback.
    if let Ok(project) = project_channel_id.to_channel(&ctx).await {
        if let Some(project) = project.guild() {
            let tags = project
                .topic
                .as_deref()
                .map(topic::extract_tags)
                .unwrap_or_default();
            if !tags.owned_by(&state.config.app_id) {
                return Ok(None);
            }
            if let Some(directory) = tags.directory {
                return Ok(Some(PathBuf::from(directory)));
            }
        }
    }

    Ok(state
        .db
        .channel_binding(&project_channel_id.to_string())
        .await?
        .map(|binding| PathBuf::from(binding.directory)))
}

/// Kebab-case a user-provided project name: lowercase, spaces and
/// underscores to dashes, anything else non-alphanumeric stripped.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        let mapped = match ch {
            'a'..='z' | '0'..='9' => Some(ch),
            'A'..='Z' => Some(ch.to_ascii_lowercase()),
            ' ' | '_' | '-' | '.' => Some('-'),
            _ => None,
        };
        match mapped {
            Some('-') => {
                if !last_dash {
                    out.push('-');
                    last_dash = true;
                }
            }
            Some(ch) => {
                out.push(ch);
                last_dash = false;
            }
            None => {}
        }
    }
    let trimmed = out.trim_matches('-');
    let capped = crate::truncate_chars(trimmed, NAME_LIMIT);
    if capped.is_empty() {
        "project".to_owned()
    } else {
        capped.to_owned()
    }
}

/// Expand `~` and resolve a relative path against the working directory.
pub fn normalize_path(input: &str) -> PathBuf {
    let trimmed = input.trim();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if trimmed == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    let path = PathBuf::from(trimmed);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_kebab_cases_names() {
        assert_eq!(sanitize_name("My Cool Project"), "my-cool-project");
        assert_eq!(sanitize_name("already-kebab"), "already-kebab");
        assert_eq!(sanitize_name("weird!!chars##here"), "weirdcharshere");
        assert_eq!(sanitize_name("under_scores.and.dots"), "under-scores-and-dots");
        assert_eq!(sanitize_name("--edges--"), "edges");
    }

    #[test]
    fn sanitize_caps_length_and_never_returns_empty() {
        let long = "x".repeat(300);
        assert_eq!(sanitize_name(&long).len(), 100);
        assert_eq!(sanitize_name("!!!"), "project");
    }

    #[test]
    fn normalize_path_expands_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(normalize_path("~/code"), home.join("code"));
        }
        assert_eq!(normalize_path("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn normalize_path_resolves_relative_against_cwd() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(normalize_path("sub/dir"), cwd.join("sub/dir"));
    }
}
