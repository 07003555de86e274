//! Permission mediation between the agent and the thread.
//!
//! The agent pauses on a permission request; the bridge posts it into the
//! thread and waits for `/accept`, `/accept-always`, or `/reject`. At most
//! one request is pending per thread.

use crate::agent::types::PermissionInfo;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A permission request awaiting a user decision in a thread.
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub permission_id: String,
    pub session_id: String,
    pub kind: String,
    pub title: String,
    pub pattern: Option<String>,
    /// Discord message id of the posted prompt.
    pub message_id: String,
    pub directory: PathBuf,
}

/// Registry of pending permissions, keyed by thread id.
#[derive(Default)]
pub struct PermissionRegistry {
    pending: Mutex<HashMap<String, PendingPermission>>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending request, replacing any previous one for the thread.
    pub fn set(&self, thread_id: &str, pending: PendingPermission) {
        self.pending
            .lock()
            .expect("permission registry lock poisoned")
            .insert(thread_id.to_owned(), pending);
    }

    /// Take (and clear) the pending request for a thread.
    pub fn take(&self, thread_id: &str) -> Option<PendingPermission> {
        self.pending
            .lock()
            .expect("permission registry lock poisoned")
            .remove(thread_id)
    }

    pub fn get(&self, thread_id: &str) -> Option<PendingPermission> {
        self.pending
            .lock()
            .expect("permission registry lock poisoned")
            .get(thread_id)
            .cloned()
    }

    /// Clear every pending entry belonging to `session_id`. Used when the
    /// agent reports the permission was answered elsewhere.
    pub fn clear_for_session(&self, session_id: &str) {
        self.pending
            .lock()
            .expect("permission registry lock poisoned")
            .retain(|_, pending| pending.session_id != session_id);
    }
}

/// Render the thread prompt for a permission request.
pub fn render_permission_request(info: &PermissionInfo) -> String {
    let mut text = String::from("⚠️ **Permission Required**\n");
    if !info.kind.is_empty() {
        text.push_str(&format!("Type: `{}`\n", info.kind));
    }
    if !info.title.is_empty() {
        text.push_str(&format!("{}\n", info.title));
    }
    if let Some(pattern) = info.pattern_text() {
        text.push_str(&format!("Pattern: `{pattern}`\n"));
    }
    text.push_str("\nReply with `/accept`, `/accept-always`, or `/reject`.");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(session: &str) -> PendingPermission {
        PendingPermission {
            permission_id: "perm_1".into(),
            session_id: session.into(),
            kind: "bash".into(),
            title: "Run a command".into(),
            pattern: Some("rm -rf *".into()),
            message_id: "123".into(),
            directory: PathBuf::from("/proj"),
        }
    }

    #[test]
    fn one_pending_request_per_thread() {
        let registry = PermissionRegistry::new();
        registry.set("t1", pending("ses_a"));
        let mut replacement = pending("ses_a");
        replacement.permission_id = "perm_2".into();
        registry.set("t1", replacement);

        let current = registry.get("t1").unwrap();
        assert_eq!(current.permission_id, "perm_2");
    }

    #[test]
    fn take_clears_the_entry() {
        let registry = PermissionRegistry::new();
        registry.set("t1", pending("ses_a"));
        assert!(registry.take("t1").is_some());
        assert!(registry.take("t1").is_none());
    }

    #[test]
    fn clear_for_session_only_touches_that_session() {
        let registry = PermissionRegistry::new();
        registry.set("t1", pending("ses_a"));
        registry.set("t2", pending("ses_b"));
        registry.clear_for_session("ses_a");
        assert!(registry.get("t1").is_none());
        assert!(registry.get("t2").is_some());
    }

    #[test]
    fn request_rendering_includes_pattern_and_instructions() {
        let info = PermissionInfo {
            id: "perm_1".into(),
            session_id: "ses_1".into(),
            kind: "bash".into(),
            title: "Run a destructive command".into(),
            pattern: Some(json!("rm -rf *")),
            metadata: json!({}),
        };
        let text = render_permission_request(&info);
        assert!(text.starts_with("⚠️ **Permission Required**"));
        assert!(text.contains("rm -rf *"));
        assert!(text.contains("/accept-always"));
    }
}
