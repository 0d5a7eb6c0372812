//! Process launch abstraction for language servers.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::LspError;

/// What to run for one language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Overrides applied on top of the inherited environment.
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The streams of a launched server, plus the process handle when there is one.
pub struct ServerIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Option<Child>,
}

/// Starts language servers. [`SubprocessLauncher`] spawns real processes;
/// tests substitute in-memory servers.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec) -> Result<ServerIo, LspError>;
}

/// Spawns the server as an OS child process with piped standard streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessLauncher;

impl Launcher for SubprocessLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<ServerIo, LspError> {
        let startup_error = |reason: String| LspError::Startup {
            command: spec.command.clone(),
            reason,
        };

        // The child searches its own PATH, so an overridden PATH is searched here too.
        let resolved = match spec.env.get("PATH") {
            Some(path) => {
                let cwd = std::env::current_dir()
                    .map_err(|e| startup_error(format!("no working directory: {e}")))?;
                which::which_in(&spec.command, Some(path), cwd)
            }
            None => which::which(&spec.command),
        };
        let resolved_cmd =
            resolved.map_err(|e| startup_error(format!("not found in PATH: {e}")))?;

        let mut child = Command::new(&resolved_cmd)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| startup_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| startup_error("no stdin from child".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| startup_error("no stdout from child".to_string()))?;
        let stderr = child.stderr.take();

        tracing::debug!(
            command = %resolved_cmd.display(),
            pid = ?child.id(),
            "Spawned language server"
        );

        Ok(ServerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let env = HashMap::from([("RUST_LOG".to_string(), "debug".to_string())]);
        let spec = ProcessSpec::new("rust-analyzer")
            .args(["--log-file", "/tmp/ra.log"])
            .env(env.clone());
        assert_eq!(spec.command, "rust-analyzer");
        assert_eq!(spec.args, vec!["--log-file", "/tmp/ra.log"]);
        assert_eq!(spec.env, env);
    }

    #[tokio::test]
    async fn test_missing_executable_is_startup_error() {
        let spec = ProcessSpec::new("nanobot-no-such-language-server-xyz");
        match SubprocessLauncher.launch(&spec) {
            Err(LspError::Startup { command, reason }) => {
                assert_eq!(command, "nanobot-no-such-language-server-xyz");
                assert!(reason.contains("not found"));
            }
            Err(other) => panic!("expected Startup error, got {other:?}"),
            Ok(_) => panic!("expected Startup error, got a server"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_resolved_in_overridden_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("nanobot-override-only-ls");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Not on the ambient PATH.
        assert!(SubprocessLauncher
            .launch(&ProcessSpec::new("nanobot-override-only-ls"))
            .is_err());

        let env = HashMap::from([(
            "PATH".to_string(),
            dir.path().display().to_string(),
        )]);
        let spec = ProcessSpec::new("nanobot-override-only-ls").env(env);
        let mut io = match SubprocessLauncher.launch(&spec) {
            Ok(io) => io,
            Err(e) => panic!("launch with overridden PATH failed: {e}"),
        };
        let status = io.child.as_mut().unwrap().wait().await.unwrap();
        assert!(status.success());
    }
}
