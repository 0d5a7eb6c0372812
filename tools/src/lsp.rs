//! Code-navigation tools backed by language servers.
//!
//! Each tool resolves a client through the shared [`LspManager`], opens the
//! file in the server, runs one positional query and renders the result as
//! plain text for the model.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nanobot_lsp::{LspError, LspManager, file_uri_to_path};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{ToolError, ToolExecutor, ToolFut, ToolRegistry, parse_args};

const NO_SERVER: &str = "No LSP server available for this file type.";
const NO_RESULTS: &str = "No results.";
const FALLBACK_LANGUAGE_ID: &str = "plaintext";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PositionArgs {
    file_path: String,
    line: u32,
    character: u32,
}

fn position_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "file_path": {
                "type": "string",
                "description": "Path to the file. Relative paths resolve against the workspace root."
            },
            "line": {
                "type": "integer",
                "minimum": 1,
                "description": "Line number (1-based)."
            },
            "character": {
                "type": "integer",
                "minimum": 0,
                "description": "Character offset (0-based)."
            }
        },
        "required": ["file_path", "line", "character"]
    })
}

#[derive(Debug, Clone, Copy)]
enum Query {
    Definition,
    References,
    Hover,
}

impl Query {
    fn tool_name(self) -> &'static str {
        match self {
            Self::Definition => "lsp_definition",
            Self::References => "lsp_references",
            Self::Hover => "lsp_hover",
        }
    }
}

/// Register the three LSP tools against one shared manager.
pub fn register_lsp_tools(
    registry: &mut ToolRegistry,
    manager: &Arc<LspManager>,
) -> Result<(), ToolError> {
    registry.register(Box::new(LspDefinitionTool::new(manager.clone())))?;
    registry.register(Box::new(LspReferencesTool::new(manager.clone())))?;
    registry.register(Box::new(LspHoverTool::new(manager.clone())))?;
    Ok(())
}

/// `lsp_definition`: where the symbol under the cursor is defined.
pub struct LspDefinitionTool {
    manager: Arc<LspManager>,
}

impl LspDefinitionTool {
    #[must_use]
    pub fn new(manager: Arc<LspManager>) -> Self {
        Self { manager }
    }
}

impl ToolExecutor for LspDefinitionTool {
    fn name(&self) -> &'static str {
        Query::Definition.tool_name()
    }

    fn description(&self) -> &'static str {
        "Find the definition of a symbol at the specified line and character. \
         Returns the file path and position of the definition."
    }

    fn schema(&self) -> Value {
        position_schema()
    }

    fn execute(&self, args: Value) -> ToolFut<'_> {
        Box::pin(run_query(&self.manager, Query::Definition, args))
    }
}

/// `lsp_references`: every use of the symbol, its declaration included.
pub struct LspReferencesTool {
    manager: Arc<LspManager>,
}

impl LspReferencesTool {
    #[must_use]
    pub fn new(manager: Arc<LspManager>) -> Self {
        Self { manager }
    }
}

impl ToolExecutor for LspReferencesTool {
    fn name(&self) -> &'static str {
        Query::References.tool_name()
    }

    fn description(&self) -> &'static str {
        "Find all references to the symbol at the specified position."
    }

    fn schema(&self) -> Value {
        position_schema()
    }

    fn execute(&self, args: Value) -> ToolFut<'_> {
        Box::pin(run_query(&self.manager, Query::References, args))
    }
}

/// `lsp_hover`: type information and documentation.
pub struct LspHoverTool {
    manager: Arc<LspManager>,
}

impl LspHoverTool {
    #[must_use]
    pub fn new(manager: Arc<LspManager>) -> Self {
        Self { manager }
    }
}

impl ToolExecutor for LspHoverTool {
    fn name(&self) -> &'static str {
        Query::Hover.tool_name()
    }

    fn description(&self) -> &'static str {
        "Get documentation or type information for the symbol at the position."
    }

    fn schema(&self) -> Value {
        position_schema()
    }

    fn execute(&self, args: Value) -> ToolFut<'_> {
        Box::pin(run_query(&self.manager, Query::Hover, args))
    }
}

async fn run_query(manager: &LspManager, query: Query, args: Value) -> Result<String, ToolError> {
    let typed: PositionArgs = parse_args(&args)?;
    if typed.line == 0 {
        return Err(ToolError::BadArgs {
            message: "line is 1-based and must be at least 1".to_string(),
        });
    }

    let path = resolve_path(manager.workspace_root(), &typed.file_path);
    let Some(client) = manager.client_for_file(&path).await else {
        return Ok(NO_SERVER.to_string());
    };

    let failed = |message: String| ToolError::ExecutionFailed {
        tool: query.tool_name().to_string(),
        message,
    };
    let lsp_failed = |e: LspError| match e {
        LspError::InvalidPath { .. } | LspError::InvalidPosition { .. } => ToolError::BadArgs {
            message: e.to_string(),
        },
        other => failed(other.to_string()),
    };

    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| failed(format!("cannot read {}: {e}", path.display())))?;
    let language_id = manager
        .language_for_path(&path)
        .unwrap_or(FALLBACK_LANGUAGE_ID);
    client
        .document_open(&path, language_id, &text)
        .await
        .map_err(lsp_failed)?;

    let result = match query {
        Query::Definition => client.go_to_definition(&path, typed.line, typed.character).await,
        Query::References => client.find_references(&path, typed.line, typed.character).await,
        Query::Hover => client.hover(&path, typed.line, typed.character).await,
    }
    .map_err(lsp_failed)?;

    Ok(match query {
        Query::Definition | Query::References => render_locations(&result),
        Query::Hover => render_hover(&result),
    })
}

fn resolve_path(root: &Path, file_path: &str) -> PathBuf {
    let path = Path::new(file_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Render `Location`, `Location[]` or `LocationLink[]` as `path:line:character` lines.
fn render_locations(result: &Value) -> String {
    let items: Vec<&Value> = match result {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![result],
        _ => Vec::new(),
    };

    let mut out = String::new();
    for item in items {
        // LocationLink carries targetUri/targetSelectionRange instead of uri/range.
        let uri = item
            .get("uri")
            .or_else(|| item.get("targetUri"))
            .and_then(Value::as_str);
        let start = item
            .get("range")
            .or_else(|| item.get("targetSelectionRange"))
            .or_else(|| item.get("targetRange"))
            .and_then(|r| r.get("start"));
        let (Some(uri), Some(start)) = (uri, start) else {
            continue;
        };

        let path = file_uri_to_path(uri).map_or_else(|| uri.to_string(), |p| p.display().to_string());
        let line = start.get("line").and_then(Value::as_u64).unwrap_or(0) + 1;
        let character = start.get("character").and_then(Value::as_u64).unwrap_or(0);
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = write!(out, "{path}:{line}:{character}");
    }

    if out.is_empty() {
        NO_RESULTS.to_string()
    } else {
        out
    }
}

/// Flatten hover `contents` (`MarkupContent`, `MarkedString` or an array of them).
fn render_hover(result: &Value) -> String {
    fn flatten(contents: &Value, parts: &mut Vec<String>) {
        match contents {
            Value::String(s) => parts.push(s.clone()),
            Value::Array(items) => {
                for item in items {
                    flatten(item, parts);
                }
            }
            Value::Object(map) => match (map.get("language"), map.get("value")) {
                (Some(Value::String(lang)), Some(Value::String(value))) => {
                    parts.push(format!("```{lang}\n{value}\n```"));
                }
                (_, Some(Value::String(value))) => parts.push(value.clone()),
                _ => {}
            },
            _ => {}
        }
    }

    let mut parts = Vec::new();
    if let Some(contents) = result.get("contents") {
        flatten(contents, &mut parts);
    }
    parts.retain(|p| !p.trim().is_empty());

    if parts.is_empty() {
        NO_RESULTS.to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_lsp::LspConfig;
    use nanobot_lsp::testing::{FakeLauncher, Reply};

    const SOURCE: &str = "def greet(name):\n    return name\n\ngreet('x')\n";

    fn config() -> LspConfig {
        LspConfig::from_toml_str("[servers.python]\ncommand = \"pyright-langserver\"\n").unwrap()
    }

    struct Fixture {
        dir: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        registry: ToolRegistry,
        manager: Arc<LspManager>,
    }

    fn fixture(launcher: FakeLauncher) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), SOURCE).unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes\n").unwrap();

        let launcher = Arc::new(launcher);
        let manager = Arc::new(LspManager::with_launcher(
            config(),
            dir.path(),
            launcher.clone(),
        ));
        let mut registry = ToolRegistry::default();
        register_lsp_tools(&mut registry, &manager).unwrap();
        Fixture {
            dir,
            launcher,
            registry,
            manager,
        }
    }

    fn args(file_path: &str, line: u32, character: u32) -> Value {
        json!({ "file_path": file_path, "line": line, "character": character })
    }

    #[tokio::test]
    async fn test_definition_renders_location() {
        let fx = fixture(FakeLauncher::with_handler(|method, params| {
            (method == "textDocument/definition").then(|| {
                let uri = params["textDocument"]["uri"].clone();
                Reply::Result(json!({
                    "uri": uri,
                    "range": {
                        "start": { "line": 0, "character": 4 },
                        "end": { "line": 0, "character": 9 }
                    }
                }))
            })
        }));

        let out = fx
            .registry
            .execute("lsp_definition", args("app.py", 4, 0))
            .await
            .unwrap();
        let expected = format!("{}:1:4", fx.dir.path().join("app.py").display());
        assert_eq!(out, expected);

        let received = fx.launcher.received();
        let open = received
            .iter()
            .find(|m| m["method"] == "textDocument/didOpen")
            .unwrap();
        assert_eq!(open["params"]["textDocument"]["languageId"], "python");
        assert_eq!(open["params"]["textDocument"]["text"], SOURCE);
        let query = received
            .iter()
            .find(|m| m["method"] == "textDocument/definition")
            .unwrap();
        assert_eq!(query["params"]["position"]["line"], 3);

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_references_render_one_per_line() {
        let fx = fixture(FakeLauncher::with_handler(|method, _| {
            (method == "textDocument/references").then(|| {
                Reply::Result(json!([
                    { "uri": "file:///src/app.py",
                      "range": { "start": { "line": 0, "character": 4 }, "end": { "line": 0, "character": 9 } } },
                    { "uri": "file:///src/app.py",
                      "range": { "start": { "line": 3, "character": 0 }, "end": { "line": 3, "character": 5 } } }
                ]))
            })
        }));

        let out = fx
            .registry
            .execute("lsp_references", args("app.py", 1, 4))
            .await
            .unwrap();
        assert_eq!(out, "/src/app.py:1:4\n/src/app.py:4:0");

        let query = fx
            .launcher
            .received()
            .into_iter()
            .find(|m| m["method"] == "textDocument/references")
            .unwrap();
        assert_eq!(query["params"]["context"]["includeDeclaration"], true);
    }

    #[tokio::test]
    async fn test_hover_flattens_markup() {
        let fx = fixture(FakeLauncher::with_handler(|method, _| {
            (method == "textDocument/hover").then(|| {
                Reply::Result(json!({
                    "contents": [
                        { "language": "python", "value": "def greet(name) -> str" },
                        "Say hello."
                    ]
                }))
            })
        }));

        let out = fx
            .registry
            .execute("lsp_hover", args("app.py", 1, 5))
            .await
            .unwrap();
        assert_eq!(out, "```python\ndef greet(name) -> str\n```\n\nSay hello.");
    }

    #[tokio::test]
    async fn test_null_result_is_no_results() {
        let fx = fixture(FakeLauncher::default());
        for tool in ["lsp_definition", "lsp_references", "lsp_hover"] {
            let out = fx.registry.execute(tool, args("app.py", 1, 0)).await.unwrap();
            assert_eq!(out, NO_RESULTS, "{tool}");
        }
    }

    #[tokio::test]
    async fn test_unsupported_file_type() {
        let fx = fixture(FakeLauncher::default());
        let out = fx
            .registry
            .execute("lsp_hover", args("notes.md", 1, 0))
            .await
            .unwrap();
        assert_eq!(out, NO_SERVER);
        assert_eq!(fx.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_execution_failure() {
        let fx = fixture(FakeLauncher::with_handler(|method, _| {
            (method == "textDocument/hover").then(|| {
                Reply::Error(nanobot_lsp::ResponseError::new(-32603, "index not ready"))
            })
        }));
        let err = fx
            .registry
            .execute("lsp_hover", args("app.py", 1, 0))
            .await
            .unwrap_err();
        match err {
            ToolError::ExecutionFailed { tool, message } => {
                assert_eq!(tool, "lsp_hover");
                assert!(message.contains("index not ready"));
            }
            other => panic!("expected execution failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_and_bad_line() {
        let fx = fixture(FakeLauncher::default());
        let err = fx
            .registry
            .execute("lsp_definition", args("missing.py", 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));

        let err = fx
            .registry
            .execute("lsp_definition", args("app.py", 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::BadArgs { .. }));
    }

    #[test]
    fn test_render_location_links() {
        let result = json!([{
            "targetUri": "file:///lib/util.py",
            "targetRange": { "start": { "line": 9, "character": 0 }, "end": { "line": 20, "character": 0 } },
            "targetSelectionRange": { "start": { "line": 9, "character": 4 }, "end": { "line": 9, "character": 8 } }
        }]);
        assert_eq!(render_locations(&result), "/lib/util.py:10:4");
        assert_eq!(render_locations(&json!([])), NO_RESULTS);
    }

    #[test]
    fn test_render_hover_markup_content() {
        let result = json!({ "contents": { "kind": "markdown", "value": "**int**" } });
        assert_eq!(render_hover(&result), "**int**");
        assert_eq!(render_hover(&json!({ "contents": "" })), NO_RESULTS);
    }
}
