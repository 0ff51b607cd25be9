//! Error types for turn execution.

use std::time::Duration;

use thiserror::Error;

/// Failures of a single chat turn.
///
/// Every variant is fatal for the turn it belongs to and for nothing else:
/// the relay reports it to the owning connection and keeps the socket open.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The tool binary could not be located or executed.
    #[error("failed to spawn '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The turn ran past its wall-clock ceiling and was killed.
    #[error("{binary} timed out after {}s", .after.as_secs())]
    Timeout { binary: String, after: Duration },

    /// The tool exited with a code that is neither success nor our own
    /// graceful-termination signal.
    #[error("process exited with code {code}")]
    ProcessExit { code: i32 },

    /// A second turn was requested while one is still running.
    #[error("a turn is already running ({active})")]
    SessionBusy { active: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnError {
    /// Text shown to the chat user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::Spawn { binary, source } if source.kind() == std::io::ErrorKind::NotFound => {
                format!(
                    "{binary} CLI is not installed. Please make sure you can run '{binary}' in your terminal."
                )
            }
            TurnError::Spawn { binary, source } => format!("Failed to start {binary}: {source}"),
            other => other.to_string(),
        }
    }
}

/// Failures while persisting image attachments.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("image '{name}' is not valid base64: {source}")]
    Decode {
        name: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("failed to write attachment: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_missing_binary_message() {
        let err = TurnError::Spawn {
            binary: "claude".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(
            err.user_message(),
            "claude CLI is not installed. Please make sure you can run 'claude' in your terminal."
        );
    }

    #[test]
    fn test_other_spawn_failure_message() {
        let err = TurnError::Spawn {
            binary: "claude".to_string(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(err.user_message().starts_with("Failed to start claude"));
    }

    #[test]
    fn test_timeout_message() {
        let err = TurnError::Timeout {
            binary: "claude".to_string(),
            after: Duration::from_secs(600),
        };
        assert_eq!(err.to_string(), "claude timed out after 600s");
    }
}
