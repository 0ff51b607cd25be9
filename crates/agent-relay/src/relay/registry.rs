//! Registry of live connections.
//!
//! Connections own their supervisors; the registry only observes them so the
//! health endpoint and shutdown logic can count clients and running turns.
//! Entries are added and removed exclusively through [`Registration`], which
//! the connection task holds for its whole lifetime.

use std::sync::Arc;

use dashmap::DashMap;
use log::info;

use crate::supervisor::SessionSupervisor;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, SessionSupervisor>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections with a running tool process.
    pub fn active_sessions(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub(crate) fn register(self: &Arc<Self>, supervisor: SessionSupervisor) -> Registration {
        let connection_id = supervisor.connection_id().to_string();
        self.connections.insert(connection_id.clone(), supervisor);
        info!(
            "Registered connection {} ({} open)",
            connection_id,
            self.connections.len()
        );
        Registration {
            registry: Arc::clone(self),
            connection_id,
        }
    }
}

/// Keeps a connection listed while alive. Dropping it removes the entry and
/// stops any turn the connection still has running.
#[derive(Debug)]
pub(crate) struct Registration {
    registry: Arc<ConnectionRegistry>,
    connection_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some((_, supervisor)) = self.registry.connections.remove(&self.connection_id) {
            supervisor.shutdown();
        }
        info!(
            "Unregistered connection {} ({} open)",
            self.connection_id,
            self.registry.connections.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::process::LocalToolRuntime;
    use tokio::sync::mpsc;

    fn supervisor(id: &str) -> SessionSupervisor {
        let (tx, _rx) = mpsc::channel(1);
        SessionSupervisor::new(
            id,
            Arc::new(LocalToolRuntime),
            ToolConfig::default(),
            tx,
        )
    }

    #[test]
    fn test_registration_lifecycle() {
        let registry = Arc::new(ConnectionRegistry::new());
        assert!(registry.is_empty());

        let first = registry.register(supervisor("a"));
        let second = registry.register(supervisor("b"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_sessions(), 0);

        let mut ids = registry.connection_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        drop(first);
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_shuts_supervisor_down() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sup = supervisor("c");
        let registration = registry.register(sup.clone());
        drop(registration);

        let err = sup
            .start(crate::supervisor::TurnRequest {
                correlation_id: "msg_x".into(),
                input: "hi".into(),
                continuation: None,
                extra_dirs: Vec::new(),
                work_dir: std::env::temp_dir(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::TurnError::Io(_)));
    }
}
