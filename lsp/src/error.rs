//! Error type shared by the client and the manager.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::ResponseError;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The language server executable could not be found or spawned.
    #[error("failed to start language server `{command}`: {reason}")]
    Startup { command: String, reason: String },

    /// No response arrived within the request window.
    #[error("LSP request `{method}` timed out after {}s", timeout.as_secs_f32())]
    Timeout { method: String, timeout: Duration },

    /// The server answered with a JSON-RPC error object.
    #[error("LSP request `{method}` failed: {error}")]
    Remote { method: String, error: ResponseError },

    /// The client stopped or failed while (or before) the operation ran.
    #[error("language server connection is closed")]
    ClientClosed,

    /// The client has not finished starting.
    #[error("language server is not running")]
    NotRunning,

    #[error("cannot convert path to file URI: {}", path.display())]
    InvalidPath { path: PathBuf },

    /// Lines are 1-based at the API boundary.
    #[error("invalid position: line {line} (lines are 1-based)")]
    InvalidPosition { line: u32 },

    #[error("serializing JSON-RPC message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LspError {
    /// Whether retrying with a fresh request can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_and_retry() {
        let err = LspError::Timeout {
            method: "textDocument/hover".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(
            err.to_string(),
            "LSP request `textDocument/hover` timed out after 10s"
        );
        assert!(err.is_retryable());
        assert!(!LspError::ClientClosed.is_retryable());
    }

    #[test]
    fn test_remote_display_includes_server_message() {
        let err = LspError::Remote {
            method: "textDocument/definition".to_string(),
            error: ResponseError::new(-32602, "invalid params"),
        };
        let text = err.to_string();
        assert!(text.contains("textDocument/definition"));
        assert!(text.contains("invalid params"));
        assert!(text.contains("-32602"));
    }
}
