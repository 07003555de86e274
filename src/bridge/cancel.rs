//! Per-session cancellation with typed reasons.
//!
//! Every in-flight agent call for a session carries the same handle. A new
//! submission supersedes the previous one; the reason recorded on the handle
//! decides what the dying task does on its way out (footer, error, silence).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Why a session bridge task was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Superseded by a newer submission: exit silently, no footer.
    NewRequest,
    /// Clean completion: emit the footer.
    Finished,
    /// Terminal error already surfaced to the thread.
    Error,
    /// Explicit `/abort` from the user.
    UserAbort,
}

/// Cancellation handle for one session's in-flight work.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    id: u64,
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortHandle {
    fn new() -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancel with a reason. The first reason wins; later aborts are no-ops.
    pub fn abort(&self, reason: AbortReason) {
        let mut slot = self.reason.lock().expect("abort reason lock poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.reason.lock().expect("abort reason lock poisoned")
    }

    /// Resolves when the handle is aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Process-wide map of session id → active cancellation handle.
#[derive(Default)]
pub struct AbortRegistry {
    handles: Mutex<HashMap<String, AbortHandle>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh handle for `session_id`, aborting any previous one
    /// with [`AbortReason::NewRequest`]. Returns the new handle and whether
    /// a previous one existed (the caller debounces in that case).
    pub fn supersede(&self, session_id: &str) -> (AbortHandle, bool) {
        let mut handles = self.handles.lock().expect("abort registry lock poisoned");
        let previous = handles.remove(session_id);
        let had_previous = match previous {
            Some(old) => {
                old.abort(AbortReason::NewRequest);
                true
            }
            None => false,
        };
        let fresh = AbortHandle::new();
        handles.insert(session_id.to_owned(), fresh.clone());
        (fresh, had_previous)
    }

    pub fn get(&self, session_id: &str) -> Option<AbortHandle> {
        self.handles
            .lock()
            .expect("abort registry lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Abort the active handle for a session, if any.
    pub fn abort(&self, session_id: &str, reason: AbortReason) -> bool {
        match self.get(session_id) {
            Some(handle) => {
                handle.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Remove the registration for `handle`, unless a newer handle has
    /// already replaced it.
    pub fn remove(&self, session_id: &str, handle: &AbortHandle) {
        let mut handles = self.handles.lock().expect("abort registry lock poisoned");
        if handles.get(session_id).is_some_and(|h| h.id == handle.id) {
            handles.remove(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supersede_aborts_the_previous_handle() {
        let registry = AbortRegistry::new();
        let (first, had_previous) = registry.supersede("ses_1");
        assert!(!had_previous);
        assert!(!first.is_aborted());

        let (second, had_previous) = registry.supersede("ses_1");
        assert!(had_previous);
        assert!(first.is_aborted());
        assert_eq!(first.reason(), Some(AbortReason::NewRequest));
        assert!(!second.is_aborted());
    }

    #[test]
    fn first_abort_reason_is_sticky() {
        let handle = AbortHandle::new();
        handle.abort(AbortReason::Finished);
        handle.abort(AbortReason::Error);
        assert_eq!(handle.reason(), Some(AbortReason::Finished));
    }

    #[test]
    fn at_most_one_active_handle_per_session() {
        let registry = AbortRegistry::new();
        let (_first, _) = registry.supersede("ses_1");
        let (second, _) = registry.supersede("ses_1");
        let current = registry.get("ses_1").unwrap();
        assert_eq!(current.id, second.id);
    }

    #[test]
    fn remove_ignores_stale_handles() {
        let registry = AbortRegistry::new();
        let (first, _) = registry.supersede("ses_1");
        let (second, _) = registry.supersede("ses_1");

        // The superseded task cleaning up after itself must not evict the
        // newer registration.
        registry.remove("ses_1", &first);
        assert!(registry.get("ses_1").is_some());

        registry.remove("ses_1", &second);
        assert!(registry.get("ses_1").is_none());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_abort() {
        let handle = AbortHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.reason()
        });
        handle.abort(AbortReason::UserAbort);
        assert_eq!(task.await.unwrap(), Some(AbortReason::UserAbort));
    }
}
