//! LspManager: one lazily started client per language.
//!
//! Tools ask for a client by file path; the manager maps the extension to a
//! language, starts that language's server on first use and hands out the
//! same `Arc<LspClient>` afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::client::LspClient;
use crate::error::LspError;
use crate::process::{Launcher, ProcessSpec, SubprocessLauncher};
use crate::protocol;
use crate::types::{ClientState, LspConfig, ServerConfig};

type ClientSlot = Arc<OnceCell<Arc<LspClient>>>;

/// Pool of language-server clients keyed by language identifier.
pub struct LspManager {
    config: LspConfig,
    workspace_root: PathBuf,
    /// Maps file extension (e.g. "rs") → language identifier (e.g. "rust").
    extension_map: HashMap<String, String>,
    launcher: Arc<dyn Launcher>,
    clients: Mutex<HashMap<String, ClientSlot>>,
}

impl LspManager {
    #[must_use]
    pub fn new(config: LspConfig, workspace_root: impl Into<PathBuf>) -> Self {
        Self::with_launcher(config, workspace_root, Arc::new(SubprocessLauncher))
    }

    #[must_use]
    pub fn with_launcher(
        config: LspConfig,
        workspace_root: impl Into<PathBuf>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let extension_map = config.extension_map();
        Self {
            config,
            workspace_root: workspace_root.into(),
            extension_map,
            launcher,
            clients: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Language identifier for `path`, by extension.
    #[must_use]
    pub fn language_for_path(&self, path: &Path) -> Option<&str> {
        let ext = path.extension()?.to_str()?;
        self.extension_map.get(ext).map(String::as_str)
    }

    /// Client for the language `path` belongs to, started if necessary.
    pub async fn client_for_file(&self, path: &Path) -> Option<Arc<LspClient>> {
        let language = self.language_for_path(path)?;
        self.client_for_language(language).await
    }

    /// Client for `language_id`, started on first use.
    ///
    /// `None` when the language has no configured server or its server fails
    /// to start. A failed start is not remembered; the next call tries again.
    pub async fn client_for_language(&self, language_id: &str) -> Option<Arc<LspClient>> {
        let Some(server) = self.config.servers.get(language_id) else {
            tracing::trace!("No LSP server configured for '{language_id}'");
            return None;
        };

        let slot = self
            .clients
            .lock()
            .await
            .entry(language_id.to_string())
            .or_default()
            .clone();

        let started = slot
            .get_or_try_init(|| self.start_client(language_id, server))
            .await;
        let client = match started {
            Ok(client) => client.clone(),
            Err(e) => {
                tracing::warn!("Failed to start LSP server for '{language_id}': {e}");
                return None;
            }
        };

        // shutdown_all may have drained the slot while the server was starting.
        let registered = self
            .clients
            .lock()
            .await
            .get(language_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !registered {
            tracing::info!("LSP pool shut down while '{language_id}' was starting; stopping it");
            client.stop().await;
            return None;
        }
        Some(client)
    }

    async fn start_client(
        &self,
        language_id: &str,
        server: &ServerConfig,
    ) -> Result<Arc<LspClient>, LspError> {
        let root_uri = match &server.root_uri {
            Some(uri) => uri.clone(),
            None => protocol::path_to_file_uri(&self.workspace_root)?.to_string(),
        };
        let spec = ProcessSpec::new(&server.command)
            .args(server.args.iter().cloned())
            .env(server.env.clone());

        let client = Arc::new(LspClient::with_launcher(
            language_id,
            spec,
            root_uri,
            self.launcher.clone(),
        ));
        client.start().await?;
        tracing::info!("LSP server for '{language_id}' started successfully");
        Ok(client)
    }

    /// Stop every started client concurrently and empty the registry.
    pub async fn shutdown_all(&self) {
        let slots: Vec<ClientSlot> = self.clients.lock().await.drain().map(|(_, s)| s).collect();
        let clients: Vec<Arc<LspClient>> = slots.iter().filter_map(|s| s.get().cloned()).collect();
        if clients.is_empty() {
            return;
        }

        tracing::info!("Shutting down {} LSP server(s)", clients.len());
        for client in &clients {
            if let ClientState::Failed(reason) = client.state() {
                tracing::warn!(
                    "LSP server for '{}' had failed before shutdown: {reason}",
                    client.language_id()
                );
            }
        }
        futures_util::future::join_all(clients.iter().map(|c| c.stop())).await;
    }

    #[cfg(test)]
    async fn registered(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}
