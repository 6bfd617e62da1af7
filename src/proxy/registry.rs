//! Registry of live CONNECT tunnels.
//!
//! Every tunnel that reaches the piping stage registers itself and holds a
//! [`TunnelRegistration`] for as long as both ends are open. Dropping the
//! registration removes the entry, so an entry exists only while the tunnel
//! is live. Shutdown calls [`ConnectionRegistry::close_all`], which signals
//! every registered tunnel to tear down.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() {
//! use eden_proxy::proxy::registry::ConnectionRegistry;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ConnectionRegistry::new());
//! let mut registration = registry.register("example.com:443".into());
//!
//! tokio::select! {
//!     _ = registration.torn_down() => { /* forced close */ }
//!     _ = async { /* pipe bytes */ } => {}
//! }
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// A live tunnel.
struct TunnelEntry {
    /// `host:port` the tunnel was opened for.
    key: String,
    /// When the tunnel was registered.
    opened_at: Instant,
    /// Fires when the tunnel must be closed.
    teardown_tx: oneshot::Sender<()>,
}

/// Information about a live tunnel.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Unique identifier.
    pub id: Uuid,
    /// `host:port` of the tunnel.
    pub key: String,
    /// Seconds the tunnel has been open.
    pub open_secs: u64,
}

/// Concurrency-safe table of live tunnels.
#[derive(Default)]
pub struct ConnectionRegistry {
    tunnels: Mutex<HashMap<Uuid, TunnelEntry>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel. The entry lives until the returned registration is dropped.
    pub fn register(self: &Arc<Self>, key: String) -> TunnelRegistration {
        let id = Uuid::new_v4();
        let (teardown_tx, teardown_rx) = oneshot::channel();

        debug!("Registered tunnel {} for {}", id, key);

        self.tunnels.lock().unwrap().insert(
            id,
            TunnelEntry {
                key,
                opened_at: Instant::now(),
                teardown_tx,
            },
        );

        TunnelRegistration {
            id,
            registry: Arc::clone(self),
            teardown_rx,
        }
    }

    /// Remove a tunnel. Returns false if it was already gone.
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.tunnels.lock().unwrap().remove(&id);
        if let Some(entry) = removed {
            debug!("Removed tunnel {} for {}", id, entry.key);
            true
        } else {
            false
        }
    }

    /// Signal every live tunnel to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.tunnels.lock().unwrap().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!("Tearing down tunnel {} for {}", id, entry.key);
            // The receiver may already be gone if the tunnel is finishing.
            let _ = entry.teardown_tx.send(());
        }
        count
    }

    /// List live tunnels.
    pub fn list(&self) -> Vec<TunnelInfo> {
        self.tunnels
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| TunnelInfo {
                id: *id,
                key: entry.key.clone(),
                open_secs: entry.opened_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// Number of live tunnels.
    pub fn count(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }
}

/// Membership of one tunnel in the registry.
pub struct TunnelRegistration {
    id: Uuid,
    registry: Arc<ConnectionRegistry>,
    teardown_rx: oneshot::Receiver<()>,
}

impl TunnelRegistration {
    /// Identifier of the tunnel.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolves when the registry asks this tunnel to close.
    pub async fn torn_down(&mut self) {
        let _ = (&mut self.teardown_rx).await;
    }
}

impl Drop for TunnelRegistration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(ConnectionRegistry::new());

        let registration = registry.register("example.com:443".into());
        assert_eq!(registry.count(), 1);

        drop(registration);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let registration = registry.register("example.com:443".into());
        let id = registration.id();

        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        // Dropping after removal is harmless
        drop(registration);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_signals_tunnels() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut first = registry.register("a.test:443".into());
        let mut second = registry.register("b.test:443".into());

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.count(), 0);

        tokio::time::timeout(Duration::from_secs(1), first.torn_down())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), second.torn_down())
            .await
            .unwrap();
    }

    #[test]
    fn test_list() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _a = registry.register("a.test:443".into());
        let _b = registry.register("b.test:8443".into());

        let keys: Vec<String> = registry.list().into_iter().map(|t| t.key).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a.test:443".to_string()));
        assert!(keys.contains(&"b.test:8443".to_string()));
    }
}
