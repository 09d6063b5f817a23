// DriveBridge Cancellation Registry
// Process-wide map of live transfer requests to their cancel flags

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Identifier of one transfer request; every event and task of the request carries it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Cooperative cancel flag, checked at chunk boundaries and between jobs
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live tokens keyed by request id
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<TaskId, CancelToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a fresh token for `id`. The returned guard clears it on drop.
    pub fn register(self: &Arc<Self>, id: TaskId) -> TokenGuard {
        let token = CancelToken::default();
        self.lock().insert(id, token.clone());
        debug!(task_id = %id, "Cancellation token registered");
        TokenGuard {
            registry: Arc::clone(self),
            id,
            token,
        }
    }

    /// Flag a live request. Returns false when no such request is running.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.lock().get(&id) {
            Some(token) => {
                token.cancel();
                info!(task_id = %id, "Transfer cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self, id: TaskId) -> bool {
        self.lock().contains_key(&id)
    }

    fn clear(&self, id: TaskId) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CancelToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ownership of a registered token for the lifetime of one request
pub struct TokenGuard {
    registry: Arc<CancellationRegistry>,
    id: TaskId,
    token: CancelToken,
}

impl TokenGuard {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.registry.clear(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_live_and_unknown() {
        let registry = CancellationRegistry::new();
        let id = TaskId::new();
        let guard = registry.register(id);

        assert!(!guard.token().is_cancelled());
        assert!(registry.cancel(id));
        assert!(guard.token().is_cancelled());
        assert!(!registry.cancel(TaskId::new()));
    }

    #[test]
    fn test_guard_clears_token() {
        let registry = CancellationRegistry::new();
        let id = TaskId::new();
        let guard = registry.register(id);
        let token = guard.token().clone();
        assert!(registry.is_live(id));

        drop(guard);
        assert!(!registry.is_live(id));
        assert!(!registry.cancel(id));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_task_id_round_trip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-an-id".parse::<TaskId>().is_err());
    }
}
