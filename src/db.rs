//! Local persistence (SQLite).
//!
//! One database file, one pool, one writer (the main loop). Every write is
//! an upsert; the schema is created on first open.

use crate::error::{DbError, Result};
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row as _;
use std::path::Path;

/// Handle to the bridge database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// A channel bound to a project directory.
#[derive(Debug, Clone)]
pub struct ChannelBinding {
    pub channel_id: String,
    pub directory: String,
    pub channel_type: ChannelType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Text,
    Voice,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Text => "text",
            ChannelType::Voice => "voice",
        }
    }

    fn parse(value: &str) -> Self {
        if value == "voice" {
            ChannelType::Voice
        } else {
            ChannelType::Text
        }
    }
}

impl Database {
    /// Open (and create if missing) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory: {}", parent.display()))
                .map_err(DbError::Other)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.map_err(DbError::Open)?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(DbError::Open)?;
        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS thread_sessions (
                thread_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS part_messages (
                part_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bot_tokens (
                app_id TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS channel_directories (
                channel_id TEXT PRIMARY KEY,
                directory TEXT NOT NULL,
                channel_type TEXT NOT NULL DEFAULT 'text',
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bot_api_keys (
                app_id TEXT PRIMARY KEY,
                google_key TEXT,
                openai_key TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_part_messages_thread ON part_messages(thread_id)",
            "CREATE INDEX IF NOT EXISTS idx_channel_directories_dir ON channel_directories(directory)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Schema(e.to_string()))?;
        }

        Ok(())
    }

    /// Close the pool. Called once on shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- thread ↔ session -------------------------------------------------

    pub async fn thread_session(&self, thread_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT session_id FROM thread_sessions WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("session_id")))
    }

    pub async fn bind_thread(&self, thread_id: &str, session_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO thread_sessions (thread_id, session_id)
            VALUES (?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET session_id = excluded.session_id
            "#,
        )
        .bind(thread_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unbind_thread(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM thread_sessions WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- part ↔ message ---------------------------------------------------

    pub async fn part_message(&self, part_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT message_id FROM part_messages WHERE part_id = ?")
            .bind(part_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("message_id")))
    }

    pub async fn has_part(&self, part_id: &str) -> Result<bool> {
        Ok(self.part_message(part_id).await?.is_some())
    }

    pub async fn record_part(
        &self,
        part_id: &str,
        message_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO part_messages (part_id, message_id, thread_id)
            VALUES (?, ?, ?)
            ON CONFLICT(part_id) DO UPDATE SET
                message_id = excluded.message_id,
                thread_id = excluded.thread_id
            "#,
        )
        .bind(part_id)
        .bind(message_id)
        .bind(thread_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- bot credentials --------------------------------------------------

    pub async fn save_bot_token(&self, app_id: &str, token: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_tokens (app_id, token)
            VALUES (?, ?)
            ON CONFLICT(app_id) DO UPDATE SET token = excluded.token
            "#,
        )
        .bind(app_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recently stored (app_id, token), if any.
    pub async fn latest_bot_token(&self) -> Result<Option<(String, String)>> {
        let row = sqlx::query(
            "SELECT app_id, token FROM bot_tokens ORDER BY created_at DESC, app_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("app_id"), r.get("token"))))
    }

    // --- provider API keys ------------------------------------------------

    pub async fn save_api_keys(
        &self,
        app_id: &str,
        google_key: Option<&str>,
        openai_key: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_api_keys (app_id, google_key, openai_key)
            VALUES (?, ?, ?)
            ON CONFLICT(app_id) DO UPDATE SET
                google_key = COALESCE(excluded.google_key, bot_api_keys.google_key),
                openai_key = COALESCE(excluded.openai_key, bot_api_keys.openai_key)
            "#,
        )
        .bind(app_id)
        .bind(google_key)
        .bind(openai_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn api_keys(&self, app_id: &str) -> Result<(Option<String>, Option<String>)> {
        let row = sqlx::query("SELECT google_key, openai_key FROM bot_api_keys WHERE app_id = ?")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok((r.get("google_key"), r.get("openai_key"))),
            None => Ok((None, None)),
        }
    }

    // --- channel ↔ directory ----------------------------------------------

    pub async fn bind_channel(
        &self,
        channel_id: &str,
        directory: &str,
        channel_type: ChannelType,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_directories (channel_id, directory, channel_type)
            VALUES (?, ?, ?)
            ON CONFLICT(channel_id) DO UPDATE SET
                directory = excluded.directory,
                channel_type = excluded.channel_type
            "#,
        )
        .bind(channel_id)
        .bind(directory)
        .bind(channel_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn channel_binding(&self, channel_id: &str) -> Result<Option<ChannelBinding>> {
        let row = sqlx::query(
            "SELECT channel_id, directory, channel_type FROM channel_directories WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ChannelBinding {
            channel_id: r.get("channel_id"),
            directory: r.get("directory"),
            channel_type: ChannelType::parse(r.get::<String, _>("channel_type").as_str()),
        }))
    }

    pub async fn channel_bindings(&self) -> Result<Vec<ChannelBinding>> {
        let rows = sqlx::query(
            "SELECT channel_id, directory, channel_type FROM channel_directories ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChannelBinding {
                channel_id: r.get("channel_id"),
                directory: r.get("directory"),
                channel_type: ChannelType::parse(r.get::<String, _>("channel_type").as_str()),
            })
            .collect())
    }

    pub async fn channels_for_directory(&self, directory: &str) -> Result<Vec<ChannelBinding>> {
        let rows = sqlx::query(
            "SELECT channel_id, directory, channel_type FROM channel_directories WHERE directory = ?",
        )
        .bind(directory)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChannelBinding {
                channel_id: r.get("channel_id"),
                directory: r.get("directory"),
                channel_type: ChannelType::parse(r.get::<String, _>("channel_type").as_str()),
            })
            .collect())
    }

    /// Remove a channel row whose Discord channel no longer exists.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM channel_directories WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn thread_binding_round_trips() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.thread_session("t1").await.unwrap(), None);

        db.bind_thread("t1", "ses_a").await.unwrap();
        assert_eq!(db.thread_session("t1").await.unwrap(), Some("ses_a".into()));

        // Rebinding overwrites (stale session healing).
        db.bind_thread("t1", "ses_b").await.unwrap();
        assert_eq!(db.thread_session("t1").await.unwrap(), Some("ses_b".into()));

        db.unbind_thread("t1").await.unwrap();
        assert_eq!(db.thread_session("t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn part_records_deduplicate() {
        let db = Database::in_memory().await.unwrap();
        assert!(!db.has_part("prt_1").await.unwrap());

        db.record_part("prt_1", "dm_1", "t1").await.unwrap();
        assert!(db.has_part("prt_1").await.unwrap());
        assert_eq!(db.part_message("prt_1").await.unwrap(), Some("dm_1".into()));

        // Re-recording the same part is an upsert, not an error.
        db.record_part("prt_1", "dm_2", "t1").await.unwrap();
        assert_eq!(db.part_message("prt_1").await.unwrap(), Some("dm_2".into()));
    }

    #[tokio::test]
    async fn api_keys_merge_instead_of_clobbering() {
        let db = Database::in_memory().await.unwrap();
        db.save_api_keys("app", Some("g1"), None).await.unwrap();
        db.save_api_keys("app", None, Some("o1")).await.unwrap();

        let (google, openai) = db.api_keys("app").await.unwrap();
        assert_eq!(google.as_deref(), Some("g1"));
        assert_eq!(openai.as_deref(), Some("o1"));
    }

    #[tokio::test]
    async fn channel_bindings_round_trip() {
        let db = Database::in_memory().await.unwrap();
        db.bind_channel("c1", "/proj", ChannelType::Text).await.unwrap();
        db.bind_channel("c2", "/proj", ChannelType::Voice).await.unwrap();

        let binding = db.channel_binding("c1").await.unwrap().unwrap();
        assert_eq!(binding.directory, "/proj");
        assert_eq!(binding.channel_type, ChannelType::Text);

        let pair = db.channels_for_directory("/proj").await.unwrap();
        assert_eq!(pair.len(), 2);

        db.delete_channel("c1").await.unwrap();
        assert!(db.channel_binding("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_bot_token_prefers_newest() {
        let db = Database::in_memory().await.unwrap();
        db.save_bot_token("app1", "tok1").await.unwrap();
        db.save_bot_token("app2", "tok2").await.unwrap();

        let (app_id, token) = db.latest_bot_token().await.unwrap().unwrap();
        assert_eq!(app_id, "app2");
        assert_eq!(token, "tok2");
    }
}
