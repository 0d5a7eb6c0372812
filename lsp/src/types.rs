//! Public types consumed by tools and the host application.
//!
//! The host constructs [`LspConfig`], hands it to the manager, and observes
//! each client's [`ClientState`]. [`ServerCapabilities`] is informational.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

/// Extension table used when the configuration does not override it.
const DEFAULT_EXTENSIONS: &[(&str, &str)] = &[
    ("py", "python"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("rs", "rust"),
    ("go", "go"),
    ("c", "c"),
    ("cpp", "cpp"),
    ("java", "java"),
];

/// Configuration for the LSP subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LspConfig {
    /// Launch configuration per language identifier (e.g. "python").
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Extra or overriding extension → language identifier entries.
    /// Merged over the built-in table by [`LspConfig::extension_map`].
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

impl LspConfig {
    /// The effective extension table: built-in defaults, then configured entries.
    ///
    /// Keys are stored without a leading dot.
    #[must_use]
    pub fn extension_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = DEFAULT_EXTENSIONS
            .iter()
            .map(|(ext, lang)| ((*ext).to_string(), (*lang).to_string()))
            .collect();
        for (ext, lang) in &self.extensions {
            let ext = ext.trim_start_matches('.');
            if ext.is_empty() {
                tracing::warn!("Ignoring empty extension mapping for language '{lang}'");
                continue;
            }
            map.insert(ext.to_string(), lang.clone());
        }
        map
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Root URI sent in `initialize`. Defaults to the workspace root.
    #[serde(default)]
    pub root_uri: Option<String>,
    /// Environment overrides, applied over the inherited process environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Lifecycle state of a single client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    NotStarted,
    Starting,
    Handshaking,
    Ready,
    ShuttingDown,
    Stopped,
    Failed(String),
}

impl ClientState {
    /// No further requests can succeed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }

    /// Start has been requested but the handshake has not completed.
    #[must_use]
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting | Self::Handshaking)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Starting => f.write_str("starting"),
            Self::Handshaking => f.write_str("handshaking"),
            Self::Ready => f.write_str("ready"),
            Self::ShuttingDown => f.write_str("shutting down"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Capabilities reported by the server in its `initialize` result.
///
/// Opaque: the client never gates calls on these flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerCapabilities(serde_json::Map<String, serde_json::Value>);

impl ServerCapabilities {
    /// Extract `capabilities` from an `initialize` result; anything else is empty.
    pub(crate) fn from_initialize_result(result: &serde_json::Value) -> Self {
        match result.get("capabilities") {
            Some(serde_json::Value::Object(map)) => Self(map.clone()),
            _ => Self::default(),
        }
    }

    #[must_use]
    pub fn get(&self, feature: &str) -> Option<&serde_json::Value> {
        self.0.get(feature)
    }

    /// Names of the advertised features.
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
