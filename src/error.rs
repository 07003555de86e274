//! Top-level error types for the bridge.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error(transparent)]
    Transcribe(#[from] TranscribeError),

    #[error("discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration and credential loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing bot token: run with DISCORD_BOT_TOKEN and DISCORD_APP_ID set at least once")]
    MissingBotToken,

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("another instance is already running on port {0}")]
    AlreadyRunning(u16),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Database connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to open SQLite database: {0}")]
    Open(#[from] sqlx::Error),

    #[error("schema initialization failed: {0}")]
    Schema(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent server and API errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(
        "the `opencode` binary was not found on PATH. \
         Install it with `npm install -g opencode-ai` and restart the bridge"
    )]
    BinaryMissing,

    #[error("agent server for {directory} did not become healthy within {seconds}s")]
    HealthTimeout { directory: String, seconds: u64 },

    #[error("agent server for {directory} crashed {restarts} times, giving up")]
    RestartLimit { directory: String, restarts: u32 },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent request failed: {status} {body}")]
    Api { status: u16, body: String },

    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Voice connection and realtime pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("failed to join voice channel: {0}")]
    Join(String),

    #[error("realtime websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Speech-to-text errors.
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("no transcription provider is configured")]
    NoProvider,

    #[error("all transcription providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("transcription request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
