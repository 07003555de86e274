//! Per-directory opencode server supervision.
//!
//! Each project directory gets its own `opencode serve` child on a free
//! loopback port. Entries are reused across sessions; a crashed server is
//! respawned on next use, up to a bounded number of restarts.

use crate::agent::client::AgentClient;
use crate::error::AgentError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Health probe attempts (1 s apart) before giving up on a fresh spawn.
const HEALTH_ATTEMPTS: u32 = 30;

/// Maximum respawns after unclean exits, per directory.
const MAX_RESTARTS: u32 = 5;

/// The agent binary expected on PATH.
const AGENT_BINARY: &str = "opencode";

struct AgentEntry {
    child: Child,
    port: u16,
    client: AgentClient,
}

/// Registry of running agent servers, keyed by project directory.
pub struct AgentPool {
    entries: Mutex<HashMap<PathBuf, AgentEntry>>,
    /// Unclean-exit counters, kept across respawns of the same directory.
    restarts: Mutex<HashMap<PathBuf, u32>>,
    google_key: Option<String>,
    openai_key: Option<String>,
    binary: String,
}

impl AgentPool {
    pub fn new(google_key: Option<String>, openai_key: Option<String>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            google_key,
            openai_key,
            binary: AGENT_BINARY.to_owned(),
        }
    }

    #[cfg(test)]
    fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_owned();
        self
    }

    /// Return a client for the agent serving `directory`, spawning or
    /// respawning the server as needed.
    pub async fn client_for(&self, directory: &Path) -> Result<AgentClient, AgentError> {
        let key = directory.to_path_buf();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            match entry.child.try_wait() {
                Ok(None) => return Ok(entry.client.clone()),
                Ok(Some(status)) => {
                    let port = entry.port;
                    entries.remove(&key);
                    let mut restarts = self.restarts.lock().await;
                    if status.success() {
                        tracing::info!(directory = %key.display(), port, "agent exited cleanly");
                        restarts.remove(&key);
                    } else {
                        let count = restarts.entry(key.clone()).or_insert(0);
                        *count += 1;
                        tracing::warn!(
                            directory = %key.display(),
                            port,
                            restarts = *count,
                            "agent exited uncleanly, respawning"
                        );
                        if *count >= MAX_RESTARTS {
                            return Err(AgentError::RestartLimit {
                                directory: key.display().to_string(),
                                restarts: *count,
                            });
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, directory = %key.display(), "agent liveness check failed");
                    entries.remove(&key);
                }
            }
        }

        let entry = self.spawn(&key).await?;
        let client = entry.client.clone();
        entries.insert(key, entry);
        Ok(client)
    }

    async fn spawn(&self, directory: &Path) -> Result<AgentEntry, AgentError> {
        let port = pick_free_port()?;

        let mut command = Command::new(&self.binary);
        command
            .args(["serve", "--port", &port.to_string(), "--hostname", "127.0.0.1"])
            .current_dir(directory)
            .env("OPENCODE_CONFIG_CONTENT", server_config().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                AgentError::BinaryMissing
            } else {
                AgentError::Other(anyhow::Error::new(error).context("failed to spawn agent"))
            }
        })?;

        tracing::info!(directory = %directory.display(), port, "spawned agent server");

        let client = AgentClient::new(port);
        self.wait_healthy(&client, directory).await?;
        self.register_keys(&client).await;

        Ok(AgentEntry { child, port, client })
    }

    async fn wait_healthy(
        &self,
        client: &AgentClient,
        directory: &Path,
    ) -> Result<(), AgentError> {
        for attempt in 0..HEALTH_ATTEMPTS {
            match client.health().await {
                Ok(()) => {
                    tracing::debug!(directory = %directory.display(), attempt, "agent healthy");
                    return Ok(());
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_secs(1)).await,
            }
        }
        Err(AgentError::HealthTimeout {
            directory: directory.display().to_string(),
            seconds: HEALTH_ATTEMPTS as u64,
        })
    }

    /// Push provider keys into the fresh server. Best-effort: a failure here
    /// leaves the agent usable with whatever auth it already has on disk.
    async fn register_keys(&self, client: &AgentClient) {
        let keys = [
            ("google", self.google_key.as_deref()),
            ("openai", self.openai_key.as_deref()),
        ];
        for (provider, key) in keys {
            let Some(key) = key else { continue };
            if let Err(error) = client.set_auth(provider, key).await {
                tracing::warn!(%error, provider, "failed to register provider key");
            }
        }
    }

    /// Terminate all live servers: SIGTERM, short grace, then SIGKILL.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (directory, mut entry) in entries.drain() {
            tracing::info!(directory = %directory.display(), port = entry.port, "stopping agent");
            #[cfg(unix)]
            if let Some(pid) = entry.child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(std::time::Duration::from_secs(3), entry.child.wait()).await
            {
                Ok(_) => (),
                Err(_) => {
                    let _ = entry.child.kill().await;
                }
            }
        }
    }
}

/// Config injected into every spawned server: no language servers, no
/// formatters, and the tool permissions the bridge mediates itself.
fn server_config() -> serde_json::Value {
    serde_json::json!({
        "lsp": {"disabled": true},
        "formatter": {"disabled": true},
        "permission": {
            "edit": "allow",
            "bash": "allow",
            "webfetch": "allow"
        }
    })
}

/// Ask the OS for a free loopback port.
fn pick_free_port() -> Result<u16, AgentError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|error| AgentError::Other(anyhow::Error::new(error).context("port allocation")))?;
    let port = listener
        .local_addr()
        .map_err(|error| AgentError::Other(anyhow::Error::new(error).context("port allocation")))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_ports_are_nonzero() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn server_config_disables_lsp_and_allows_tools() {
        let config = server_config();
        assert_eq!(config["lsp"]["disabled"], serde_json::json!(true));
        assert_eq!(config["permission"]["bash"], serde_json::json!("allow"));
        assert_eq!(config["permission"]["edit"], serde_json::json!("allow"));
        assert_eq!(config["permission"]["webfetch"], serde_json::json!("allow"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_fatal_error() {
        let pool = AgentPool::new(None, None).with_binary("definitely-not-a-real-binary-xyz");
        let error = pool.client_for(Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(error, AgentError::BinaryMissing));
    }
}
