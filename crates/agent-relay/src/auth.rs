//! Connection authentication seam.
//!
//! Token verification lives outside the relay. A [`WorkspaceResolver`] maps
//! the optional `?token=` query parameter to the workspace a connection works
//! in; the shipped [`StaticWorkspaceResolver`] accepts every connection and
//! serves one configured project directory.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Who a connection belongs to and where its turns run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceContext {
    pub user_id: String,
    /// Working directory for the tool.
    pub project_path: PathBuf,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A token is required but none was given.
    #[error("missing token")]
    MissingToken,

    /// Invalid token.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Internal error.
    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Resolves a connection's workspace from its credentials.
#[async_trait]
pub trait WorkspaceResolver: Send + Sync {
    async fn resolve(&self, token: Option<&str>) -> Result<WorkspaceContext, AuthError>;
}

/// Serves a single fixed workspace to everyone.
#[derive(Debug, Clone)]
pub struct StaticWorkspaceResolver {
    context: WorkspaceContext,
}

impl StaticWorkspaceResolver {
    pub fn new(project_path: PathBuf) -> Self {
        Self {
            context: WorkspaceContext {
                user_id: "local".to_string(),
                project_path,
            },
        }
    }
}

#[async_trait]
impl WorkspaceResolver for StaticWorkspaceResolver {
    async fn resolve(&self, _token: Option<&str>) -> Result<WorkspaceContext, AuthError> {
        Ok(self.context.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_ignores_token() {
        let resolver = StaticWorkspaceResolver::new(PathBuf::from("/srv/project"));
        let with = resolver.resolve(Some("abc")).await.unwrap();
        let without = resolver.resolve(None).await.unwrap();
        assert_eq!(with, without);
        assert_eq!(with.project_path, PathBuf::from("/srv/project"));
    }
}
