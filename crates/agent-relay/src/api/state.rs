//! Application state shared across handlers.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::WorkspaceResolver;
use crate::config::AppConfig;
use crate::process::{LocalToolRuntime, ToolRuntime};
use crate::relay::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Live connections, for health reporting and shutdown.
    pub registry: Arc<ConnectionRegistry>,
    pub runtime: Arc<dyn ToolRuntime>,
    pub resolver: Arc<dyn WorkspaceResolver>,
    /// Parent directory of the per-connection attachment directories.
    pub attachments_root: PathBuf,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        resolver: Arc<dyn WorkspaceResolver>,
        attachments_root: PathBuf,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            runtime: Arc::new(LocalToolRuntime),
            resolver,
            attachments_root,
            shutdown: CancellationToken::new(),
        }
    }
}
