use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cluster::Cluster;
use tokio::time::Instant;

/// Registry entry for one live session.
#[derive(Clone)]
pub struct SessionEntry {
    pub cluster: Arc<Cluster>,
    pub created_at: Instant,
    pub expires_at: Instant,
}

/// Seconds until an entry expires, floored at zero.
pub fn ttl_remaining_secs(expires_at: Instant) -> u64 {
    expires_at
        .saturating_duration_since(Instant::now())
        .as_secs()
}

/// Maps session ids to live clusters with their TTL window.
///
/// Every operation takes one lock acquisition; reads see a consistent
/// snapshot for the duration of a single call only.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register (or overwrite) the session. The caller must have
    /// disposed of any prior cluster under this id.
    pub fn set(&self, session_id: &str, cluster: Arc<Cluster>, ttl: Duration) {
        let now = Instant::now();
        self.lock().insert(
            session_id.to_string(),
            SessionEntry {
                cluster,
                created_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Cluster>> {
        self.lock()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.cluster))
    }

    pub fn get_entry(&self, session_id: &str) -> Option<SessionEntry> {
        self.lock().get(session_id).cloned()
    }

    /// Atomically take and remove the entry.
    pub fn pop(&self, session_id: &str) -> Option<SessionEntry> {
        self.lock().remove(session_id)
    }

    /// Push the expiry out by `extra` and restart the extension window.
    /// No-op for a missing id or a zero extension.
    pub fn extend(&self, session_id: &str, extra: Duration) {
        if extra.is_zero() {
            return;
        }
        if let Some(entry) = self.lock().get_mut(session_id) {
            entry.created_at = Instant::now();
            entry.expires_at += extra;
        }
    }

    /// Ids whose expiry has passed.
    pub fn expired_sessions(&self) -> Vec<String> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Snapshot of all entries for read-only iteration.
    pub fn items(&self) -> Vec<(String, SessionEntry)> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
