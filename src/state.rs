//! Shared process state.
//!
//! All mutable registries live here, behind one `Arc`, written from the
//! main runtime. The voice worker never touches these directly; it goes
//! through typed messages.

use crate::agent::AgentPool;
use crate::bridge::cancel::AbortRegistry;
use crate::bridge::permission::PermissionRegistry;
use crate::config::Config;
use crate::db::Database;
use crate::voice::VoiceRegistry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub type SharedState = Arc<State>;

pub struct State {
    pub config: Config,
    pub db: Database,
    pub agents: AgentPool,
    pub aborts: AbortRegistry,
    pub permissions: PermissionRegistry,
    pub voice: VoiceRegistry,
    /// Process-local cache over `part_messages`; the DB row stays the
    /// authoritative dedupe key.
    sent_parts: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
}

impl State {
    pub fn new(config: Config, db: Database) -> SharedState {
        let agents = AgentPool::new(
            config.google_api_key.clone(),
            config.openai_api_key.clone(),
        );
        Arc::new(Self {
            config,
            db,
            agents,
            aborts: AbortRegistry::new(),
            permissions: PermissionRegistry::new(),
            voice: VoiceRegistry::new(),
            sent_parts: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Whether this part id was already posted, per cache or database.
    pub async fn part_already_sent(&self, part_id: &str) -> bool {
        if self
            .sent_parts
            .lock()
            .expect("sent part cache lock poisoned")
            .contains(part_id)
        {
            return true;
        }
        match self.db.has_part(part_id).await {
            Ok(found) => {
                if found {
                    self.sent_parts
                        .lock()
                        .expect("sent part cache lock poisoned")
                        .insert(part_id.to_owned());
                }
                found
            }
            Err(error) => {
                tracing::warn!(%error, part_id, "part dedupe lookup failed");
                false
            }
        }
    }

    /// Record a posted part in the database and the cache.
    pub async fn record_sent_part(
        &self,
        part_id: &str,
        message_id: &str,
        thread_id: &str,
    ) -> crate::Result<()> {
        self.db.record_part(part_id, message_id, thread_id).await?;
        self.sent_parts
            .lock()
            .expect("sent part cache lock poisoned")
            .insert(part_id.to_owned());
        Ok(())
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn test_state() -> SharedState {
        let db = Database::in_memory().await.unwrap();
        let config = Config {
            data_dir: PathBuf::from("/tmp/rv-test"),
            app_id: "app".into(),
            bot_token: "token".into(),
            google_api_key: None,
            openai_api_key: None,
            realtime_model: "model".into(),
            transcribe_model: "model".into(),
            debug_audio_log: false,
        };
        State::new(config, db)
    }

    #[tokio::test]
    async fn sent_part_cache_is_seeded_from_the_database() {
        let state = test_state().await;
        state.db.record_part("prt_1", "dm_1", "t1").await.unwrap();

        // Cache is cold but the DB row is authoritative.
        assert!(state.part_already_sent("prt_1").await);
        assert!(!state.part_already_sent("prt_2").await);

        state.record_sent_part("prt_2", "dm_2", "t1").await.unwrap();
        assert!(state.part_already_sent("prt_2").await);
    }

    #[tokio::test]
    async fn shutdown_flag_flips_once() {
        let state = test_state().await;
        assert!(!state.is_shutting_down());
        state.begin_shutdown();
        assert!(state.is_shutting_down());
    }
}
