//! LSP message serde types and JSON-RPC envelope handling.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LspError;

/// JSON-RPC "method not found" error code.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// A JSON-RPC error object as returned by the server.
///
/// Fields default when absent so that any error object is carried through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponseError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Reply sent for server-to-client requests this client does not implement.
pub(crate) fn method_not_found(id: serde_json::Value, method: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

/// Classified inbound message.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        outcome: Result<serde_json::Value, ResponseError>,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification(ServerNotification),
}

pub(crate) fn parse_incoming(frame: &serde_json::Value) -> Option<Incoming> {
    let id = frame.get("id").filter(|id| !id.is_null());
    let method = frame.get("method").and_then(serde_json::Value::as_str);

    match (id, method) {
        (Some(id_val), None) => {
            let outcome = match frame.get("error") {
                Some(error) => Err(serde_json::from_value(error.clone())
                    .unwrap_or_else(|_| ResponseError {
                        code: 0,
                        message: error.to_string(),
                        data: None,
                    })),
                None => Ok(frame
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null)),
            };
            Some(Incoming::Response {
                id: id_val.as_u64()?,
                outcome,
            })
        }
        (Some(id_val), Some(method)) => Some(Incoming::ServerRequest {
            id: id_val.clone(),
            method: method.to_string(),
        }),
        (None, Some(method)) => Some(Incoming::Notification(ServerNotification::parse(
            method,
            frame.get("params"),
        ))),
        (None, None) => None,
    }
}

/// Server-to-client notifications this client recognizes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ServerNotification {
    PublishDiagnostics { uri: String, count: usize },
    ShowMessage { kind: MessageType, message: String },
    LogMessage { kind: MessageType, message: String },
    Other { method: String },
}

#[derive(Debug, Deserialize)]
struct MessageParams {
    #[serde(rename = "type")]
    kind: u64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct DiagnosticsParams {
    uri: String,
    #[serde(default)]
    diagnostics: Vec<serde_json::Value>,
}

impl ServerNotification {
    fn parse(method: &str, params: Option<&serde_json::Value>) -> Self {
        let params = params.cloned().unwrap_or(serde_json::Value::Null);
        let other = || Self::Other {
            method: method.to_string(),
        };
        match method {
            "textDocument/publishDiagnostics" => serde_json::from_value::<DiagnosticsParams>(params)
                .map(|p| Self::PublishDiagnostics {
                    uri: p.uri,
                    count: p.diagnostics.len(),
                })
                .unwrap_or_else(|_| other()),
            "window/showMessage" => serde_json::from_value::<MessageParams>(params)
                .map(|p| Self::ShowMessage {
                    kind: MessageType::from_lsp(p.kind),
                    message: p.message,
                })
                .unwrap_or_else(|_| other()),
            "window/logMessage" => serde_json::from_value::<MessageParams>(params)
                .map(|p| Self::LogMessage {
                    kind: MessageType::from_lsp(p.kind),
                    message: p.message,
                })
                .unwrap_or_else(|_| other()),
            _ => other(),
        }
    }
}

/// `window/showMessage` and `window/logMessage` severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageType {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageType {
    fn from_lsp(value: u64) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Log,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Log => "log",
        }
    }
}

/// A wire position: 0-based line and character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    /// Translate a caller position (1-based line, 0-based character).
    pub fn from_one_based(line: u32, character: u32) -> Result<Self, LspError> {
        let wire_line = line
            .checked_sub(1)
            .ok_or(LspError::InvalidPosition { line })?;
        Ok(Self {
            line: wire_line,
            character,
        })
    }
}

pub(crate) fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "didSave": true,
                    "willSave": false
                },
                "hover": {
                    "contentFormat": ["markdown", "plaintext"]
                },
                "definition": {
                    "linkSupport": true
                }
            }
        }
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn text_document_position_params(uri: &str, position: Position) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": position
    })
}

pub(crate) fn reference_params(uri: &str, position: Position) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": position,
        "context": { "includeDeclaration": true }
    })
}

/// Convert a (possibly relative) path into a `file://` URI.
pub fn path_to_file_uri(path: &Path) -> Result<url::Url, LspError> {
    let invalid = || LspError::InvalidPath {
        path: path.to_path_buf(),
    };
    let absolute = std::path::absolute(path).map_err(|_| invalid())?;
    url::Url::from_file_path(&absolute).map_err(|()| invalid())
}

/// Convert a `file://` URI back to a path; `None` for other schemes.
#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<std::path::PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_params_declares_capabilities() {
        let params = initialize_params("file:///workspace");
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        let text_document = &params["capabilities"]["textDocument"];
        assert_eq!(text_document["synchronization"]["didSave"], true);
        assert_eq!(text_document["synchronization"]["willSave"], false);
        assert_eq!(
            text_document["hover"]["contentFormat"],
            serde_json::json!(["markdown", "plaintext"])
        );
        assert_eq!(text_document["definition"]["linkSupport"], true);
    }

    #[test]
    fn test_did_open_params() {
        let params = did_open_params("file:///test.rs", "rust", 1, "fn main() {}");
        assert_eq!(params["textDocument"]["uri"], "file:///test.rs");
        assert_eq!(params["textDocument"]["languageId"], "rust");
        assert_eq!(params["textDocument"]["version"], 1);
        assert_eq!(params["textDocument"]["text"], "fn main() {}");
    }

    #[test]
    fn test_position_translates_line_to_zero_based() {
        let position = Position::from_one_based(4, 7).unwrap();
        assert_eq!(position, Position { line: 3, character: 7 });

        let params = text_document_position_params("file:///a.py", position);
        assert_eq!(params["position"]["line"], 3);
        assert_eq!(params["position"]["character"], 7);
    }

    #[test]
    fn test_position_rejects_line_zero() {
        assert!(matches!(
            Position::from_one_based(0, 0),
            Err(LspError::InvalidPosition { line: 0 })
        ));
    }

    #[test]
    fn test_reference_params_include_declaration() {
        let position = Position::from_one_based(1, 0).unwrap();
        let params = reference_params("file:///a.py", position);
        assert_eq!(params["position"]["line"], 0);
        assert_eq!(params["context"]["includeDeclaration"], true);
    }

    #[test]
    fn test_parse_response_result() {
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}});
        match parse_incoming(&frame) {
            Some(Incoming::Response { id, outcome }) => {
                assert_eq!(id, 3);
                assert_eq!(outcome.unwrap()["ok"], true);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_null_result() {
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": null});
        match parse_incoming(&frame) {
            Some(Incoming::Response { outcome, .. }) => {
                assert_eq!(outcome.unwrap(), serde_json::Value::Null);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_error() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32600, "message": "invalid request", "data": {"why": "x"}}
        });
        match parse_incoming(&frame) {
            Some(Incoming::Response { id, outcome }) => {
                assert_eq!(id, 2);
                let error = outcome.unwrap_err();
                assert_eq!(error.code, -32600);
                assert_eq!(error.message, "invalid request");
                assert_eq!(error.data, Some(serde_json::json!({"why": "x"})));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_server_request() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "workspace/configuration",
            "params": {}
        });
        match parse_incoming(&frame) {
            Some(Incoming::ServerRequest { id, method }) => {
                assert_eq!(id, "abc");
                assert_eq!(method, "workspace/configuration");
            }
            other => panic!("expected server request, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_notifications() {
        let diagnostics = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {"uri": "file:///a.rs", "diagnostics": [{}, {}]}
        });
        let show = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "window/showMessage",
            "params": {"type": 1, "message": "boom"}
        });
        let unknown = serde_json::json!({"jsonrpc": "2.0", "method": "$/progress"});

        assert!(matches!(
            parse_incoming(&diagnostics),
            Some(Incoming::Notification(ServerNotification::PublishDiagnostics { count: 2, .. }))
        ));
        assert!(matches!(
            parse_incoming(&show),
            Some(Incoming::Notification(ServerNotification::ShowMessage {
                kind: MessageType::Error,
                ..
            }))
        ));
        assert!(matches!(
            parse_incoming(&unknown),
            Some(Incoming::Notification(ServerNotification::Other { ref method })) if method == "$/progress"
        ));
    }

    #[test]
    fn test_parse_rejects_non_integer_response_id_and_empty_frames() {
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": "x", "result": null});
        assert!(parse_incoming(&frame).is_none());
        assert!(parse_incoming(&serde_json::json!({"jsonrpc": "2.0"})).is_none());
    }

    #[test]
    fn test_method_not_found_reply() {
        let reply = method_not_found(serde_json::json!(5), "client/registerCapability");
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("client/registerCapability")
        );
    }

    #[test]
    fn test_path_to_file_uri_and_back() {
        #[cfg(windows)]
        let path = std::path::PathBuf::from(r"C:\Users\test\src\main.rs");
        #[cfg(not(windows))]
        let path = std::path::PathBuf::from("/home/test/src/main.rs");

        let uri = path_to_file_uri(&path).expect("should create URI");
        assert!(uri.as_str().starts_with("file:///"));
        let roundtrip = file_uri_to_path(uri.as_str()).expect("should parse back to path");
        assert_eq!(roundtrip, path);
    }

    #[test]
    fn test_relative_path_is_made_absolute() {
        let uri = path_to_file_uri(Path::new("src/lib.rs")).unwrap();
        let path = file_uri_to_path(uri.as_str()).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("src/lib.rs"));
    }

    #[test]
    fn test_file_uri_to_path_non_file_scheme() {
        assert!(file_uri_to_path("https://example.com/test.rs").is_none());
        assert!(file_uri_to_path("not-a-uri").is_none());
    }

    #[test]
    fn test_request_serialization_without_params() {
        let req = Request::new(1, "shutdown", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "shutdown");
        assert!(
            json.get("params").is_none(),
            "params must be omitted, not null"
        );
    }

    #[test]
    fn test_notification_serialization() {
        let notif = Notification::new("initialized", Some(serde_json::json!({})));
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "initialized");
        assert!(json.get("id").is_none());
        assert_eq!(json["params"], serde_json::json!({}));
    }
}
