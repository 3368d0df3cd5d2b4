// ingest-core/src/session.rs
// Live command-stream sessions, keyed by (tenant, host).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One authenticated agent currently holding a command stream. The
/// session is a flat record: the RPC task owns the stream halves, the
/// table holds only identity and the cancellation handle.
#[derive(Debug, Clone)]
pub struct CommandSession {
    pub session_id: u64,
    pub agent_version: String,
    pub peer_addr: String,
    pub since: Instant,
    pub cancel: CancellationToken,
}

/// Registry of open command streams. The gateway writes, the command
/// router reads; neither holds the lock across a send.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<(String, String), CommandSession>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new command stream for `(tenant, host)`. An existing
    /// session for the key is supplanted: cancelled and replaced
    /// (last-writer-wins). Returns the new session id.
    pub fn register(
        &self,
        tenant_id: &str,
        host_id: &str,
        agent_version: String,
        peer_addr: String,
        cancel: CancellationToken,
    ) -> u64 {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = CommandSession {
            session_id,
            agent_version,
            peer_addr,
            since: Instant::now(),
            cancel,
        };
        let supplanted = self
            .sessions
            .write()
            .insert((tenant_id.to_string(), host_id.to_string()), session);
        if let Some(old) = supplanted {
            info!(
                "command stream for {tenant_id}/{host_id} supplanted (was session {})",
                old.session_id
            );
            old.cancel.cancel();
        }
        session_id
    }

    /// Remove a session, but only if it is still the registered one; a
    /// supplanting session must survive the old task's teardown.
    pub fn remove(&self, tenant_id: &str, host_id: &str, session_id: u64) -> bool {
        let mut sessions = self.sessions.write();
        let key = (tenant_id.to_string(), host_id.to_string());
        match sessions.get(&key) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, tenant_id: &str, host_id: &str) -> Option<CommandSession> {
        self.sessions
            .read()
            .get(&(tenant_id.to_string(), host_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Cancel every live session; used on server shutdown.
    pub fn cancel_all(&self) {
        for session in self.sessions.read().values() {
            session.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_open_supplants_the_first() {
        let table = SessionTable::new();
        let first_cancel = CancellationToken::new();
        let first = table.register(
            "demo",
            "h1",
            "0.3.0".into(),
            "10.0.0.1:1".into(),
            first_cancel.clone(),
        );
        let second = table.register(
            "demo",
            "h1",
            "0.3.0".into(),
            "10.0.0.1:2".into(),
            CancellationToken::new(),
        );

        assert!(first_cancel.is_cancelled(), "old session must be cancelled");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("demo", "h1").unwrap().session_id, second);

        // the old task's teardown must not evict the new session
        assert!(!table.remove("demo", "h1", first));
        assert!(table.get("demo", "h1").is_some());
        assert!(table.remove("demo", "h1", second));
        assert!(table.is_empty());
    }
}
