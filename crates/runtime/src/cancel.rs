//! Per-session cancellation with parent→child cascade.
//!
//! Each running prompt gets a `RunCancel`. The async token wakes suspension
//! points (`tokio::select!` against stream reads and tool awaits); the
//! atomic flag is mirrored into `ToolContext` so tools without an await
//! point can poll.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Cancellation handle for one run.
#[derive(Clone)]
pub struct RunCancel {
    token: CancellationToken,
    flag: Arc<AtomicBool>,
}

impl RunCancel {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Await cancellation (for `tokio::select!`).
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The pollable flag handed to tools.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

impl Default for RunCancel {
    fn default() -> Self {
        Self::new()
    }
}

/// Active cancellation handles per session, with cascade groups so
/// cancelling a parent also cancels its spawned children.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, RunCancel>>,
    /// parent session id → child session ids.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a fresh handle for a session's run.
    pub fn register(&self, session_id: &str) -> RunCancel {
        let cancel = RunCancel::new();
        self.tokens
            .lock()
            .insert(session_id.to_owned(), cancel.clone());
        cancel
    }

    /// Cancel a session's running prompt and cascade to its children.
    /// Returns true if a handle was found for the session itself.
    pub fn cancel(&self, session_id: &str) -> bool {
        let found = if let Some(cancel) = self.tokens.lock().get(session_id) {
            cancel.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(session_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(cancel) = tokens.get(child) {
                    cancel.cancel();
                }
            }
        }

        found
    }

    /// Remove a session's handle (run finished) and any group it owned.
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
        self.groups.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }

    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    pub fn remove_from_group(&self, parent: &str, child: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_flag_and_token() {
        let cancel = RunCancel::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());
        assert!(cancel.flag().load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let cancel = RunCancel::new();
        let waiter = cancel.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        cancel.cancel();
        assert!(handle.await.unwrap());
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let cancel = map.register("s1");
        assert!(map.is_running("s1"));

        assert!(map.cancel("s1"));
        assert!(cancel.is_cancelled());

        map.remove("s1");
        assert!(!map.is_running("s1"));
        assert!(!map.cancel("s1"));
    }

    #[test]
    fn cascade_reaches_children() {
        let map = CancelMap::new();
        let parent = map.register("p");
        let child = map.register("c");
        map.add_to_group("p", "c");

        map.cancel("p");
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn removed_child_escapes_cascade() {
        let map = CancelMap::new();
        map.register("p");
        let child = map.register("c");
        map.add_to_group("p", "c");
        map.remove_from_group("p", "c");

        map.cancel("p");
        assert!(!child.is_cancelled());
    }

    #[test]
    fn register_replaces_previous_handle() {
        let map = CancelMap::new();
        let old = map.register("s1");
        let new = map.register("s1");
        map.cancel("s1");
        assert!(!old.is_cancelled());
        assert!(new.is_cancelled());
    }
}
