//! TOML loading for [`LspConfig`].

use std::path::Path;

use anyhow::{Context, Result};

use crate::types::LspConfig;

impl LspConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parsing LSP configuration")?;
        for (language, server) in &config.servers {
            if server.command.trim().is_empty() {
                anyhow::bail!("language server for '{language}' has an empty command");
            }
        }
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[servers.python]
command = "pyright-langserver"
args = ["--stdio"]
env = { PYTHONPATH = "src" }

[servers.rust]
command = "rust-analyzer"
root_uri = "file:///work/crate"

[extensions]
".pyi" = "python"
"#;

    #[test]
    fn test_from_toml_str() {
        let config = LspConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers["python"].args, vec!["--stdio"]);
        assert_eq!(config.servers["python"].env["PYTHONPATH"], "src");
        assert_eq!(
            config.servers["rust"].root_uri.as_deref(),
            Some("file:///work/crate")
        );
        assert_eq!(
            config.extension_map().get("pyi").map(String::as_str),
            Some("python")
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = LspConfig::from_toml_str("[servers.go]\ncommand = \"  \"\n").unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lsp.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = LspConfig::load(&path).unwrap();
        assert!(config.servers.contains_key("rust"));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = LspConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/definitely/not/here.toml"));
    }
}
