//! Configuration loading.
//!
//! Credentials are environment-first: anything present in the environment is
//! persisted to the database so later runs work without it. Everything else
//! has a sensible default.

use crate::db::Database;
use crate::error::{ConfigError, Result};
use std::path::PathBuf;

/// Default realtime speech model for voice channels.
const DEFAULT_REALTIME_MODEL: &str = "gemini-2.0-flash-live-001";

/// Default model for the transcription primary (Gemini).
const DEFAULT_TRANSCRIBE_MODEL: &str = "gemini-2.0-flash";

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding the database and logs.
    pub data_dir: PathBuf,

    /// Discord application id the process runs as.
    pub app_id: String,

    /// Discord bot token.
    pub bot_token: String,

    /// Google API key (realtime voice, transcription primary, agent provider).
    pub google_api_key: Option<String>,

    /// OpenAI API key (transcription fallback, agent provider).
    pub openai_api_key: Option<String>,

    /// Realtime speech model id.
    pub realtime_model: String,

    /// Transcription model id for the primary provider.
    pub transcribe_model: String,

    /// Write raw voice PCM next to the database for debugging.
    pub debug_audio_log: bool,
}

impl Config {
    /// Default data directory (`$XDG_DATA_HOME/remote-vibe` or equivalent).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("remote-vibe"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Root under which `create-new-project` scaffolds directories.
    pub fn projects_root() -> PathBuf {
        dirs::home_dir()
            .map(|dir| dir.join("remote-vibe"))
            .unwrap_or_else(|| PathBuf::from("./remote-vibe"))
    }

    /// Database file path for a data directory.
    pub fn database_path(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("remote-vibe.db")
    }

    /// Load configuration, persisting env-provided credentials to `db`.
    pub async fn load(data_dir: PathBuf, db: &Database) -> Result<Self> {
        let env_token = std::env::var("DISCORD_BOT_TOKEN").ok();
        let env_app_id = std::env::var("DISCORD_APP_ID").ok();

        let (app_id, bot_token) = match (env_app_id, env_token) {
            (Some(app_id), Some(token)) => {
                db.save_bot_token(&app_id, &token).await?;
                (app_id, token)
            }
            _ => db
                .latest_bot_token()
                .await?
                .ok_or(ConfigError::MissingBotToken)?,
        };

        let env_google = std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .ok();
        let env_openai = std::env::var("OPENAI_API_KEY").ok();
        if env_google.is_some() || env_openai.is_some() {
            db.save_api_keys(&app_id, env_google.as_deref(), env_openai.as_deref())
                .await?;
        }
        let (google_api_key, openai_api_key) = db.api_keys(&app_id).await?;

        Ok(Self {
            data_dir,
            app_id,
            bot_token,
            google_api_key,
            openai_api_key,
            realtime_model: std::env::var("REMOTE_VIBE_REALTIME_MODEL")
                .unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_owned()),
            transcribe_model: std::env::var("REMOTE_VIBE_TRANSCRIBE_MODEL")
                .unwrap_or_else(|_| DEFAULT_TRANSCRIBE_MODEL.to_owned()),
            debug_audio_log: std::env::var("REMOTE_VIBE_DEBUG_AUDIO").is_ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_falls_back_to_stored_token() {
        let db = Database::in_memory().await.unwrap();
        db.save_bot_token("app9", "tok9").await.unwrap();
        db.save_api_keys("app9", Some("gk"), None).await.unwrap();

        // No env in tests; the stored row wins.
        let config = Config::load(PathBuf::from("/tmp/rv-test"), &db).await;
        if std::env::var("DISCORD_BOT_TOKEN").is_err() {
            let config = config.unwrap();
            assert_eq!(config.app_id, "app9");
            assert_eq!(config.bot_token, "tok9");
            assert_eq!(config.google_api_key.as_deref(), Some("gk"));
        }
    }

    #[tokio::test]
    async fn load_without_any_token_fails() {
        if std::env::var("DISCORD_BOT_TOKEN").is_ok() {
            return;
        }
        let db = Database::in_memory().await.unwrap();
        let result = Config::load(PathBuf::from("/tmp/rv-test"), &db).await;
        assert!(result.is_err());
    }
}
