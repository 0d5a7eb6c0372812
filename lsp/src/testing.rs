//! In-memory language servers for tests.
//!
//! [`pipe`] gives a test direct control over the server side of a
//! connection; [`FakeLauncher`] runs a scripted server per launch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::process::{BoxedReader, Launcher, ProcessSpec, ServerIo};
use crate::protocol::ResponseError;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Server side of an in-memory connection.
pub struct ServerEnd {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

/// Create a connected client/server stream pair.
#[must_use]
pub fn pipe() -> (ServerIo, ServerEnd) {
    let (client_side, server_side) = tokio::io::duplex(PIPE_CAPACITY);
    let (client_read, client_write) = tokio::io::split(client_side);
    let (server_read, server_write) = tokio::io::split(server_side);
    let io = ServerIo {
        stdin: Box::new(client_write),
        stdout: Box::new(client_read) as BoxedReader,
        stderr: None,
        child: None,
    };
    let end = ServerEnd {
        reader: FrameReader::new(server_read),
        writer: server_write,
    };
    (io, end)
}

impl ServerEnd {
    /// Next message from the client; `None` once the client closed stdin.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.reader
            .read_frame()
            .await
            .expect("client sent a malformed frame")
    }

    /// Next message from the client, which must be a request or notification for `method`.
    pub async fn expect(&mut self, method: &str) -> serde_json::Value {
        let msg = self.recv().await.expect("client closed the connection");
        assert_eq!(msg["method"], method, "unexpected message: {msg}");
        msg
    }

    pub async fn send(&mut self, msg: &serde_json::Value) {
        assert!(self.try_send(msg).await, "writing to client failed");
    }

    async fn try_send(&mut self, msg: &serde_json::Value) -> bool {
        let mut writer = FrameWriter::new(&mut self.writer);
        writer.write_frame(msg).await.is_ok()
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("writing to client");
        self.writer.flush().await.expect("flushing to client");
    }

    pub async fn respond(&mut self, id: &serde_json::Value, result: serde_json::Value) {
        self.send(&response(id, result)).await;
    }

    /// Answer `initialize` and consume `initialized`; returns the initialize request.
    pub async fn complete_handshake(&mut self) -> serde_json::Value {
        let init = self.expect("initialize").await;
        self.respond(&init["id"], initialize_result()).await;
        self.expect("initialized").await;
        init
    }

    /// Close the server's output stream.
    pub async fn hang_up(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn response(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn initialize_result() -> serde_json::Value {
    serde_json::json!({
        "capabilities": {
            "textDocumentSync": 1,
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true
        },
        "serverInfo": { "name": "fake-ls" }
    })
}

/// Launcher that hands out one prepared connection.
pub struct ManualLauncher {
    io: Mutex<Option<ServerIo>>,
}

impl ManualLauncher {
    #[must_use]
    pub fn new(io: ServerIo) -> Arc<Self> {
        Arc::new(Self {
            io: Mutex::new(Some(io)),
        })
    }
}

impl Launcher for ManualLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<ServerIo, LspError> {
        self.io
            .lock()
            .expect("launcher lock poisoned")
            .take()
            .ok_or_else(|| LspError::Startup {
                command: spec.command.clone(),
                reason: "connection already used".to_string(),
            })
    }
}

/// How the scripted server answers a request.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(serde_json::Value),
    Error(ResponseError),
    /// Never answer.
    Silent,
}

type Handler = dyn Fn(&str, &serde_json::Value) -> Option<Reply> + Send + Sync;

/// Launcher whose every launch runs a scripted in-memory server.
///
/// `initialize` and `shutdown` are answered by default; other requests go
/// to the handler, falling back to a `null` result.
pub struct FakeLauncher {
    handler: Arc<Handler>,
    launches: AtomicUsize,
    failures: Mutex<VecDeque<String>>,
    specs: Mutex<Vec<ProcessSpec>>,
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::with_handler(|_, _| None)
    }
}

impl FakeLauncher {
    #[must_use]
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) -> Option<Reply> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            launches: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            specs: Mutex::new(Vec::new()),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the next launch fail with a startup error.
    pub fn fail_next_launch(&self, reason: &str) {
        self.failures
            .lock()
            .expect("launcher lock poisoned")
            .push_back(reason.to_string());
    }

    /// Number of launch attempts, failed ones included.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().expect("launcher lock poisoned").clone()
    }

    /// Every message any launched server received, in arrival order.
    pub fn received(&self) -> Vec<serde_json::Value> {
        self.received.lock().expect("launcher lock poisoned").clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["method"].as_str().map(String::from))
            .collect()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<ServerIo, LspError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.specs
            .lock()
            .expect("launcher lock poisoned")
            .push(spec.clone());
        if let Some(reason) = self
            .failures
            .lock()
            .expect("launcher lock poisoned")
            .pop_front()
        {
            return Err(LspError::Startup {
                command: spec.command.clone(),
                reason,
            });
        }

        let (io, end) = pipe();
        tokio::spawn(serve(end, self.handler.clone(), self.received.clone()));
        Ok(io)
    }
}

async fn serve(
    mut end: ServerEnd,
    handler: Arc<Handler>,
    received: Arc<Mutex<Vec<serde_json::Value>>>,
) {
    while let Ok(Some(msg)) = end.reader.read_frame().await {
        received
            .lock()
            .expect("launcher lock poisoned")
            .push(msg.clone());

        let method = msg["method"].as_str().unwrap_or_default().to_string();
        if method == "exit" {
            break;
        }
        let Some(id) = msg.get("id").cloned() else {
            continue;
        };

        let params = msg.get("params").cloned().unwrap_or_default();
        let reply = handler(&method, &params).unwrap_or_else(|| match method.as_str() {
            "initialize" => Reply::Result(initialize_result()),
            _ => Reply::Result(serde_json::Value::Null),
        });
        let sent = match reply {
            Reply::Result(result) => end.try_send(&response(&id, result)).await,
            Reply::Error(error) => {
                end.try_send(&serde_json::json!({"jsonrpc": "2.0", "id": id, "error": error}))
                    .await
            }
            Reply::Silent => true,
        };
        if !sent {
            break;
        }
    }
    end.hang_up().await;
}
