//! Client for a single language server.
//!
//! Owns the server process and its JSON-RPC channel. Outbound frames go
//! through a writer task fed by an `mpsc` channel, so one frame is written
//! and flushed before the next starts. A reader task owns stdout, resolves
//! pending requests by ID and logs server notifications.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::process::{BoxedReader, BoxedWriter, Launcher, ProcessSpec, ServerIo, SubprocessLauncher};
use crate::protocol::{
    self, Incoming, Notification, Position, Request, ResponseError, ServerNotification,
};
use crate::types::{ClientState, ServerCapabilities};

/// How long a request waits for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on each shutdown step: the `shutdown` reply, the exit after `exit`,
/// and the reap after a kill.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<serde_json::Value, ResponseError>>>;

/// State shared between the client and its background tasks.
struct Shared {
    name: String,
    state: watch::Sender<ClientState>,
    pending: Mutex<PendingMap>,
}

impl Shared {
    /// Move to `Failed` unless the client is already stopping or done.
    fn fail(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| match *state {
            ClientState::ShuttingDown | ClientState::Stopped | ClientState::Failed(_) => false,
            _ => {
                *state = ClientState::Failed(reason.to_string());
                true
            }
        });
        if changed {
            tracing::warn!(server = %self.name, "LSP client failed: {reason}");
        }
    }

    /// Drop every pending sender; waiters observe `ClientClosed`.
    async fn abandon_pending(&self) {
        let abandoned = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        if abandoned > 0 {
            tracing::debug!(
                server = %self.name,
                count = abandoned,
                "Abandoned pending LSP requests"
            );
        }
    }
}

/// Live I/O resources. Dropping it aborts the background tasks; the child
/// has `kill_on_drop` set by the launcher.
struct Connection {
    writer_tx: mpsc::Sender<WriterCommand>,
    child: Option<Child>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        if let Some(handle) = &self.stderr_handle {
            handle.abort();
        }
    }
}

/// A JSON-RPC client bound to one language server process.
///
/// All operations take `&self`; share it behind an `Arc`.
pub struct LspClient {
    language_id: String,
    spec: ProcessSpec,
    root_uri: String,
    launcher: Arc<dyn Launcher>,
    request_timeout: Duration,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    connection: Mutex<Option<Connection>>,
    capabilities: OnceLock<ServerCapabilities>,
}

impl LspClient {
    /// A client that will spawn `spec` as a subprocess.
    pub fn new(language_id: impl Into<String>, spec: ProcessSpec, root_uri: impl Into<String>) -> Self {
        Self::with_launcher(language_id, spec, root_uri, Arc::new(SubprocessLauncher))
    }

    pub fn with_launcher(
        language_id: impl Into<String>,
        spec: ProcessSpec,
        root_uri: impl Into<String>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let language_id = language_id.into();
        let (state, _) = watch::channel(ClientState::NotStarted);
        Self {
            shared: Arc::new(Shared {
                name: language_id.clone(),
                state,
                pending: Mutex::new(HashMap::new()),
            }),
            language_id,
            spec,
            root_uri: root_uri.into(),
            launcher,
            request_timeout: REQUEST_TIMEOUT,
            next_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            capabilities: OnceLock::new(),
        }
    }

    /// Override the response window (defaults to [`REQUEST_TIMEOUT`]).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn root_uri(&self) -> &str {
        &self.root_uri
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.shared.state.borrow().clone()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Capabilities from the `initialize` result; `None` before the handshake.
    #[must_use]
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.get()
    }

    /// Spawn the server, start the I/O tasks and run the handshake.
    pub async fn start(&self) -> Result<(), LspError> {
        let mut begun = false;
        self.shared.state.send_if_modified(|state| {
            if *state == ClientState::NotStarted {
                *state = ClientState::Starting;
                begun = true;
            }
            begun
        });
        if !begun {
            return match self.state() {
                ClientState::Ready => Ok(()),
                ClientState::Starting | ClientState::Handshaking => Err(LspError::NotRunning),
                _ => Err(LspError::ClientClosed),
            };
        }

        tracing::info!(
            server = %self.language_id,
            "Starting LSP server: {} {:?}",
            self.spec.command,
            self.spec.args
        );
        let io = match self.launcher.launch(&self.spec) {
            Ok(io) => io,
            Err(e) => {
                self.shared.fail(&e.to_string());
                return Err(e);
            }
        };
        let writer_tx = self.attach(io).await;

        let handshaking = self.shared.state.send_if_modified(|state| {
            let starting = *state == ClientState::Starting;
            if starting {
                *state = ClientState::Handshaking;
            }
            starting
        });
        if !handshaking {
            // Stopped while spawning.
            self.release(false).await;
            return Err(LspError::ClientClosed);
        }

        if let Err(e) = self.handshake(&writer_tx).await {
            self.shared.fail(&format!("handshake failed: {e}"));
            self.release(false).await;
            return Err(e);
        }

        let ready = self.shared.state.send_if_modified(|state| {
            let handshaking = *state == ClientState::Handshaking;
            if handshaking {
                *state = ClientState::Ready;
            }
            handshaking
        });
        if ready {
            Ok(())
        } else {
            Err(LspError::ClientClosed)
        }
    }

    async fn attach(&self, io: ServerIo) -> mpsc::Sender<WriterCommand> {
        let ServerIo {
            stdin,
            stdout,
            stderr,
            child,
        } = io;
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);

        let writer_handle = tokio::spawn(write_loop(stdin, writer_rx, self.shared.clone()));
        let reader_handle = tokio::spawn(read_loop(stdout, self.shared.clone(), writer_tx.clone()));
        let stderr_handle =
            stderr.map(|stderr| tokio::spawn(drain_stderr(stderr, self.language_id.clone())));

        *self.connection.lock().await = Some(Connection {
            writer_tx: writer_tx.clone(),
            child,
            reader_handle,
            writer_handle,
            stderr_handle,
        });
        writer_tx
    }

    async fn handshake(&self, writer_tx: &mpsc::Sender<WriterCommand>) -> Result<(), LspError> {
        let params = protocol::initialize_params(&self.root_uri);
        let result = self.call_with(writer_tx, "initialize", Some(params)).await?;

        let capabilities = ServerCapabilities::from_initialize_result(&result);
        tracing::info!(
            server = %self.language_id,
            features = ?capabilities.features().collect::<Vec<_>>(),
            "LSP initialized"
        );
        let _ = self.capabilities.set(capabilities);

        self.notify_with(writer_tx, "initialized", Some(serde_json::json!({})))
            .await;
        Ok(())
    }

    /// Send a request and wait for its result.
    ///
    /// Requires a `Ready` client: earlier states fail with `NotRunning`,
    /// later ones with `ClientClosed`.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, LspError> {
        self.ensure_ready()?;
        let writer_tx = self.writer().await.ok_or(LspError::ClientClosed)?;
        self.call_with(&writer_tx, method, params).await
    }

    /// Send a notification. Dropped silently unless the client is `Ready`.
    pub async fn send_notification(&self, method: &str, params: Option<serde_json::Value>) {
        if let Err(e) = self.ensure_ready() {
            tracing::trace!(server = %self.language_id, "Dropping notification {method}: {e}");
            return;
        }
        if let Some(writer_tx) = self.writer().await {
            self.notify_with(&writer_tx, method, params).await;
        }
    }

    /// `textDocument/didOpen` at version 1.
    ///
    /// Servers answer positional queries from their own buffer, so open a
    /// file before querying it.
    pub async fn document_open(
        &self,
        path: &Path,
        language_id: &str,
        text: &str,
    ) -> Result<(), LspError> {
        let uri = protocol::path_to_file_uri(path)?;
        if let Err(e) = self.await_ready().await {
            tracing::trace!(server = %self.language_id, "Skipping didOpen for {}: {e}", path.display());
            return Ok(());
        }
        let params = protocol::did_open_params(uri.as_str(), language_id, 1, text);
        self.send_notification("textDocument/didOpen", Some(params))
            .await;
        Ok(())
    }

    /// `textDocument/definition`. `line` is 1-based, `character` 0-based.
    pub async fn go_to_definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, LspError> {
        let uri = protocol::path_to_file_uri(path)?;
        let position = Position::from_one_based(line, character)?;
        let params = protocol::text_document_position_params(uri.as_str(), position);
        self.query("textDocument/definition", params).await
    }

    /// `textDocument/references`, declaration included. `line` is 1-based.
    pub async fn find_references(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, LspError> {
        let uri = protocol::path_to_file_uri(path)?;
        let position = Position::from_one_based(line, character)?;
        let params = protocol::reference_params(uri.as_str(), position);
        self.query("textDocument/references", params).await
    }

    /// `textDocument/hover`. `line` is 1-based.
    pub async fn hover(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, LspError> {
        let uri = protocol::path_to_file_uri(path)?;
        let position = Position::from_one_based(line, character)?;
        let params = protocol::text_document_position_params(uri.as_str(), position);
        self.query("textDocument/hover", params).await
    }

    async fn query(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, LspError> {
        self.await_ready().await?;
        self.send_request(method, Some(params)).await
    }

    /// Shut the server down. Safe to call repeatedly; only the first call acts.
    pub async fn stop(&self) {
        let mut previous = None;
        self.shared.state.send_if_modified(|state| match *state {
            ClientState::ShuttingDown | ClientState::Stopped => false,
            _ => {
                previous = Some(std::mem::replace(state, ClientState::ShuttingDown));
                true
            }
        });
        let Some(previous) = previous else {
            return;
        };

        let graceful = matches!(previous, ClientState::Ready | ClientState::Handshaking);
        tracing::info!(server = %self.language_id, "Stopping LSP server ({previous})");
        self.release(graceful).await;
        self.shared.abandon_pending().await;

        self.shared.state.send_if_modified(|state| {
            let stopping = *state == ClientState::ShuttingDown;
            if stopping {
                *state = ClientState::Stopped;
            }
            stopping
        });
    }

    /// Take the connection, if any, and shut it down.
    async fn release(&self, graceful: bool) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            self.shutdown_connection(connection, graceful).await;
        }
    }

    async fn shutdown_connection(&self, mut conn: Connection, graceful: bool) {
        // Phase 1: polite shutdown. The outcome is logged and otherwise ignored;
        // termination below runs regardless.
        if graceful {
            let acknowledged = tokio::time::timeout(
                SHUTDOWN_TIMEOUT,
                self.call_with(&conn.writer_tx, "shutdown", None),
            )
            .await;
            match acknowledged {
                Ok(Ok(_)) => {
                    tracing::debug!(server = %self.language_id, "LSP server acknowledged shutdown");
                }
                Ok(Err(e)) => {
                    tracing::debug!(server = %self.language_id, "LSP shutdown request failed: {e}");
                }
                Err(_) => {
                    tracing::debug!(server = %self.language_id, "LSP server didn't answer shutdown in time");
                }
            }
            self.notify_with(&conn.writer_tx, "exit", None).await;
        }

        // Let queued frames flush, then close stdin.
        let _ = conn.writer_tx.send(WriterCommand::Shutdown).await;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut conn.writer_handle)
            .await
            .is_err()
        {
            tracing::debug!(server = %self.language_id, "LSP writer did not drain in time");
        }

        // Phase 2: termination.
        if let Some(child) = conn.child.as_mut() {
            terminate(&self.language_id, child).await;
        }
        // Dropping the connection aborts the reader and stderr tasks.
    }

    async fn writer(&self) -> Option<mpsc::Sender<WriterCommand>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.writer_tx.clone())
    }

    fn ensure_ready(&self) -> Result<(), LspError> {
        match &*self.shared.state.borrow() {
            ClientState::Ready => Ok(()),
            ClientState::NotStarted | ClientState::Starting | ClientState::Handshaking => {
                Err(LspError::NotRunning)
            }
            ClientState::ShuttingDown | ClientState::Stopped | ClientState::Failed(_) => {
                Err(LspError::ClientClosed)
            }
        }
    }

    /// Wait out an in-progress start, bounded by the request timeout.
    async fn await_ready(&self) -> Result<(), LspError> {
        let mut rx = self.shared.state.subscribe();
        let waited = tokio::time::timeout(
            self.request_timeout,
            rx.wait_for(|state| !state.is_starting()),
        )
        .await;
        match waited {
            Ok(Ok(state)) => match &*state {
                ClientState::Ready => Ok(()),
                ClientState::NotStarted => Err(LspError::NotRunning),
                _ => Err(LspError::ClientClosed),
            },
            Ok(Err(_)) => Err(LspError::ClientClosed),
            Err(_) => Err(LspError::NotRunning),
        }
    }

    /// Register a pending entry, enqueue the request, await the outcome.
    /// No state gate: the handshake and shutdown use this directly.
    async fn call_with(
        &self,
        writer_tx: &mpsc::Sender<WriterCommand>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        // A teardown that drained the table before our insert is visible here.
        let closed = self.shared.state.borrow().is_terminal();
        if closed || writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            self.forget(id).await;
            return Err(LspError::ClientClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(LspError::Remote {
                method: method.to_string(),
                error,
            }),
            Ok(Err(_)) => Err(LspError::ClientClosed),
            Err(_) => {
                self.forget(id).await;
                Err(LspError::Timeout {
                    method: method.to_string(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    async fn forget(&self, id: u64) {
        self.shared.pending.lock().await.remove(&id);
    }

    async fn notify_with(
        &self,
        writer_tx: &mpsc::Sender<WriterCommand>,
        method: &str,
        params: Option<serde_json::Value>,
    ) {
        let frame = match serde_json::to_value(Notification::new(method, params)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(server = %self.language_id, "Cannot encode {method}: {e}");
                return;
            }
        };
        if writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            tracing::trace!(server = %self.language_id, "Writer closed; dropped {method}");
        }
    }

    #[cfg(test)]
    async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }
}

/// Wait for the process to exit, killing it if it does not.
async fn terminate(name: &str, child: &mut Child) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server = %name, %status, "LSP server exited");
            return;
        }
        Ok(Err(e)) => tracing::debug!(server = %name, "Waiting for LSP server failed: {e}"),
        Err(_) => tracing::debug!(server = %name, "LSP server didn't exit in time, killing"),
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(server = %name, "Killing LSP server failed: {e}");
        return;
    }
    // Reap so the killed process does not linger.
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait())
        .await
        .is_err()
    {
        tracing::warn!(server = %name, "LSP server still running after kill");
    }
}

async fn write_loop(
    stdin: BoxedWriter,
    mut rx: mpsc::Receiver<WriterCommand>,
    shared: Arc<Shared>,
) {
    let mut writer = FrameWriter::new(stdin);
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    shared.fail(&format!("write failed: {e}"));
                    shared.abandon_pending().await;
                    break;
                }
            }
            WriterCommand::Shutdown => {
                let _ = writer.close().await;
                break;
            }
        }
    }
}

async fn read_loop(
    stdout: BoxedReader,
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<WriterCommand>,
) {
    let mut reader = FrameReader::new(stdout);
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => dispatch_frame(&frame, &shared, &writer_tx).await,
            Ok(None) => {
                tracing::info!(server = %shared.name, "LSP server closed stdout");
                shared.fail("server closed its output stream");
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(server = %shared.name, "Discarding malformed LSP frame: {e}");
            }
            Err(e) => {
                shared.fail(&format!("read failed: {e}"));
                break;
            }
        }
    }
    shared.abandon_pending().await;
}

async fn dispatch_frame(
    frame: &serde_json::Value,
    shared: &Shared,
    writer_tx: &mpsc::Sender<WriterCommand>,
) {
    let Some(incoming) = protocol::parse_incoming(frame) else {
        tracing::trace!(server = %shared.name, "Ignoring unrecognized JSON-RPC frame");
        return;
    };

    match incoming {
        Incoming::Response { id, outcome } => {
            let sender = shared.pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => {
                    tracing::trace!(server = %shared.name, id, "Dropping response with no pending request");
                }
            }
        }
        Incoming::ServerRequest { id, method } => {
            // Servers block on registerCapability and friends until answered.
            tracing::debug!(
                server = %shared.name,
                "LSP server sent request: {method}; replying method not found"
            );
            let reply = protocol::method_not_found(id, &method);
            // Queue without blocking the reader: a full writer channel must not stall dispatch.
            let writer_tx = writer_tx.clone();
            let server = shared.name.clone();
            tokio::spawn(async move {
                if writer_tx.send(WriterCommand::Send(reply)).await.is_err() {
                    tracing::debug!(server = %server, "Writer closed; dropped reply to {method}");
                }
            });
        }
        Incoming::Notification(notification) => handle_notification(&shared.name, notification),
    }
}

fn handle_notification(server: &str, notification: ServerNotification) {
    match notification {
        ServerNotification::PublishDiagnostics { uri, count } => {
            tracing::debug!(server = %server, %uri, count, "Diagnostics published");
        }
        ServerNotification::ShowMessage { kind, message } => {
            tracing::info!(server = %server, kind = kind.label(), "LSP message: {message}");
        }
        ServerNotification::LogMessage { kind, message } => {
            tracing::debug!(server = %server, kind = kind.label(), "LSP log: {message}");
        }
        ServerNotification::Other { method } => {
            tracing::trace!(server = %server, "Ignoring notification: {method}");
        }
    }
}

/// Log stderr line by line until EOF. Lines need not be UTF-8; the pipe stays
/// open as long as the process does.
async fn drain_stderr(stderr: BoxedReader, name: String) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!(server = %name, "stderr: {}", line.trim_end());
            }
            Err(e) => {
                tracing::debug!(server = %name, "Reading stderr failed: {e}");
                break;
            }
        }
    }
}
