//! A single tool-server connection: subprocess, stdio transport, and
//! request/response correlation.
//!
//! One background reader task per connection demultiplexes incoming lines
//! to waiting callers by request id; concurrent outstanding requests may
//! therefore complete in any order.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::protocol::{
    self, ClientInfo, InitializeResult, Message, RequestId, RpcError, ServerCapabilities, ToolInfo,
    codes, methods,
};

/// Grace period between closing stdin and killing the subprocess
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No subprocess
    Disconnected,
    /// Subprocess spawned, handshake in flight
    Connecting,
    /// Handshake complete, requests accepted
    Connected,
    /// The manager's sweep is retrying the connection
    Reconnecting,
    /// Terminal until manually retried
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Per-connection request metrics
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    /// When the connection last completed its handshake
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last request was issued
    pub last_request_at: Option<DateTime<Utc>>,
    /// Requests issued on this connection
    pub total_requests: u64,
    /// Requests that failed (error envelope, timeout, or transport loss)
    pub failed_requests: u64,
    /// Running average round-trip time in seconds
    pub average_response_time: f64,
}

impl ConnectionMetrics {
    /// Fraction of requests that failed
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

type PendingSender = oneshot::Sender<Result<Message, McpError>>;

/// State shared with the background reader task
struct Shared {
    name: String,
    state: RwLock<ConnectionState>,
    pending: Mutex<HashMap<RequestId, PendingSender>>,
    metrics: Mutex<ConnectionMetrics>,
    capabilities: RwLock<ServerCapabilities>,
    last_error: Mutex<Option<String>>,
}

struct ReaderHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One tool-server connection owning at most one live subprocess
pub struct Connection {
    config: ServerConfig,
    shared: Arc<Shared>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    reader: Mutex<Option<ReaderHandle>>,
    next_id: AtomicU64,
    retry_count: AtomicU32,
}

impl Connection {
    /// Create a connection in the `Disconnected` state
    pub fn new(config: ServerConfig) -> Self {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            state: RwLock::new(ConnectionState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            metrics: Mutex::new(ConnectionMetrics::default()),
            capabilities: RwLock::new(ServerCapabilities::default()),
            last_error: Mutex::new(None),
        });
        Self {
            config,
            shared,
            stdin: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            next_id: AtomicU64::new(1),
            retry_count: AtomicU32::new(0),
        }
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write() = state;
    }

    /// Snapshot of the request metrics
    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.metrics.lock().clone()
    }

    /// Capabilities parsed from the `initialize` handshake
    pub fn capabilities(&self) -> ServerCapabilities {
        self.shared.capabilities.read().clone()
    }

    /// Last connect/teardown failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Requests currently awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Bump the sweep's reconnect counter; returns the attempt number
    pub(crate) fn record_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Establish the connection: spawn the subprocess, complete the
    /// `initialize`/`initialized` handshake on the raw pipe, then start the
    /// background reader. No-op when already connecting or connected.
    pub async fn connect(&self) -> Result<(), McpError> {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Ok(());
        }

        // A previous subprocess may still be around on the reconnect path.
        self.teardown(ConnectionState::Disconnected, McpError::Cancelled)
            .await;
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to server: {}", self.config.name);

        match self.spawn_and_initialize().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.shared.metrics.lock().connected_at = Some(Utc::now());
                self.retry_count.store(0, Ordering::SeqCst);
                *self.shared.last_error.lock() = None;
                info!("Connected to server: {}", self.config.name);
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.config.name, e);
                *self.shared.last_error.lock() = Some(e.to_string());
                self.teardown(ConnectionState::Error, McpError::Cancelled)
                    .await;
                Err(e)
            }
        }
    }

    /// Disconnect: cancel the reader, terminate the subprocess, and fail
    /// every still-pending request with a cancellation.
    pub async fn disconnect(&self) {
        info!("Disconnecting from server: {}", self.config.name);
        self.teardown(ConnectionState::Disconnected, McpError::Cancelled)
            .await;
    }

    /// Send a request and await its response with the connection's
    /// configured timeout.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        self.send_request_with_timeout(method, params, None).await
    }

    /// Send a request with an explicit per-call timeout override
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpError> {
        if self.state() != ConnectionState::Connected {
            return Err(McpError::server_unavailable(&self.config.name));
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst) as i64);
        let mut request = protocol::Request::with_id(id.clone(), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }

        // Register before writing so a fast response can't race past us.
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);

        let started = Instant::now();
        let write_result = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => write_line(stdin, &Message::Request(request)).await,
                None => Err(McpError::server_unavailable(&self.config.name)),
            }
        };
        if let Err(e) = write_result {
            self.shared.pending.lock().remove(&id);
            self.record_failure();
            return Err(e);
        }

        let wait = timeout.unwrap_or_else(|| self.config.timeout());
        let message = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(Ok(message))) => message,
            Ok(Ok(Err(e))) => {
                self.record_failure();
                return Err(e);
            }
            Ok(Err(_)) => {
                self.record_failure();
                return Err(McpError::transport("response channel closed"));
            }
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                self.record_failure();
                warn!("Request '{}' to {} timed out", method, self.config.name);
                return Err(McpError::timeout(wait.as_secs()));
            }
        };

        match message {
            Message::Response(response) => {
                self.record_success(started.elapsed().as_secs_f64());
                Ok(response.result)
            }
            Message::Error(response) => {
                self.record_failure();
                Err(remote_error(&self.config.name, method, response.error))
            }
            other => {
                self.record_failure();
                Err(McpError::protocol(format!(
                    "unexpected {} in response position",
                    other.kind()
                )))
            }
        }
    }

    /// Healthy means connected, subprocess alive, and an error rate at or
    /// below 50% over all requests so far.
    pub async fn is_healthy(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        {
            let mut child = self.child.lock().await;
            match child.as_mut() {
                Some(child) => {
                    if !matches!(child.try_wait(), Ok(None)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        self.metrics().error_rate() <= 0.5
    }

    /// Round-trip a `ping` request
    pub async fn ping(&self) -> Result<(), McpError> {
        self.send_request(methods::PING, None).await.map(|_| ())
    }

    /// List the tools the server exposes
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let result = self.send_request(methods::TOOLS_LIST, None).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(tools).unwrap_or_default())
    }

    /// Invoke a named tool with an arguments object
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.send_request(
            methods::TOOLS_CALL,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    async fn spawn_and_initialize(&self) -> Result<(), McpError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env_clear()
            .envs(build_environment(&self.config.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection(format!("failed to spawn '{}': {}", self.config.command, e))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection("failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection("failed to get stdout handle"))?;
        let mut reader = BufReader::new(stdout);

        // Handshake happens on the raw pipe, before the reader task exists,
        // so exactly one response is read with no other traffic interleaved.
        let init = protocol::initialize_request(&ClientInfo::default());
        let init_id = init.id.clone();
        write_line(&mut stdin, &Message::Request(init)).await?;

        let line = tokio::time::timeout(self.config.timeout(), read_handshake_line(&mut reader))
            .await
            .map_err(|_| McpError::timeout(self.config.timeout_secs))??;
        let result = match Message::parse(&line)? {
            Message::Response(response) if response.id == init_id => response.result,
            Message::Error(response) => {
                return Err(McpError::server(
                    response.error.code,
                    format!("initialize failed: {}", response.error.message),
                ));
            }
            other => {
                return Err(McpError::protocol(format!(
                    "unexpected {} during handshake",
                    other.kind()
                )));
            }
        };
        let init_result: InitializeResult = serde_json::from_value(result)?;
        debug!(
            "Server {} capabilities: tools={} resources={} prompts={}",
            self.config.name,
            init_result.capabilities.tools.is_some(),
            init_result.capabilities.resources.is_some(),
            init_result.capabilities.prompts.is_some(),
        );
        *self.shared.capabilities.write() = init_result.capabilities;

        write_line(
            &mut stdin,
            &Message::Notification(protocol::initialized_notification()),
        )
        .await?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.spawn_reader(reader);
        Ok(())
    }

    fn spawn_reader(&self, reader: BufReader<ChildStdout>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(read_loop(reader, shared, token));
        *self.reader.lock() = Some(ReaderHandle { cancel, task });
    }

    /// Stop the reader, terminate the subprocess, fail all pending
    /// requests, and land in `final_state`.
    async fn teardown(&self, final_state: ConnectionState, pending_error: McpError) {
        let reader = { self.reader.lock().take() };
        if let Some(reader) = reader {
            reader.cancel.cancel();
            let _ = reader.task.await;
        }

        // Closing stdin asks the server to exit on its own; kill after the
        // grace period if it doesn't.
        self.stdin.lock().await.take();
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                    warn!("Server {} did not exit, killing", self.config.name);
                    let _ = child.kill().await;
                }
            }
        }

        let drained: Vec<(RequestId, PendingSender)> =
            { self.shared.pending.lock().drain().collect() };
        for (id, sender) in drained {
            debug!("Cancelling pending request {} on {}", id, self.config.name);
            let _ = sender.send(Err(pending_error.clone()));
        }

        self.set_state(final_state);
    }

    fn record_success(&self, response_time: f64) {
        let mut metrics = self.shared.metrics.lock();
        metrics.total_requests += 1;
        metrics.last_request_at = Some(Utc::now());
        let total = metrics.total_requests as f64;
        metrics.average_response_time =
            ((metrics.average_response_time * (total - 1.0)) + response_time) / total;
    }

    fn record_failure(&self) {
        let mut metrics = self.shared.metrics.lock();
        metrics.total_requests += 1;
        metrics.failed_requests += 1;
        metrics.last_request_at = Some(Utc::now());
    }
}

/// Reader task: route each incoming line to the caller waiting on its id.
/// Parse failures and unmatched ids are logged and dropped; the loop only
/// exits on cancellation or a dead pipe.
async fn read_loop(
    mut reader: BufReader<ChildStdout>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => {
                debug!("Server {} closed stdout", shared.name);
                break;
            }
            Ok(_) => dispatch_line(&shared, line.trim()),
            Err(e) => {
                error!("Read error on server {} stdout: {}", shared.name, e);
                break;
            }
        }
    }

    // The pipe is gone. Fail in-flight callers now instead of letting each
    // of them run out its own timeout.
    let drained: Vec<(RequestId, PendingSender)> = { shared.pending.lock().drain().collect() };
    for (id, sender) in drained {
        warn!(
            "Failing pending request {} on {}: transport closed",
            id, shared.name
        );
        let _ = sender.send(Err(McpError::transport("connection closed by server")));
    }
    *shared.state.write() = ConnectionState::Error;
}

fn dispatch_line(shared: &Shared, line: &str) {
    if line.is_empty() {
        return;
    }
    let message = match Message::parse(line) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping undecodable line from {}: {}", shared.name, e);
            return;
        }
    };
    if message.is_request() {
        warn!(
            "Unexpected server-initiated request from {}: {}",
            shared.name,
            message.method().unwrap_or("?")
        );
        return;
    }
    if message.is_notification() {
        debug!(
            "Notification from {}: {}",
            shared.name,
            message.method().unwrap_or("?")
        );
        return;
    }
    let Some(id) = message.id().cloned() else {
        return;
    };
    let sender = shared.pending.lock().remove(&id);
    match sender {
        Some(sender) => {
            if sender.send(Ok(message)).is_err() {
                debug!("Caller for request {} on {} went away", id, shared.name);
            }
        }
        None => warn!("Response for unknown request {} from {}", id, shared.name),
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &Message) -> Result<(), McpError> {
    let line = message.to_line()?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_handshake_line(reader: &mut BufReader<ChildStdout>) -> Result<String, McpError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(McpError::transport("server closed stdout during handshake"));
    }
    Ok(line)
}

/// Re-raise a remote error envelope with readable text for the well-known
/// codes.
fn remote_error(server: &str, method: &str, error: RpcError) -> McpError {
    let message = match error.code {
        codes::INVALID_PARAMS => format!("invalid parameters for {}: {}", method, error.message),
        codes::METHOD_NOT_FOUND => format!("method {} not found on server {}", method, server),
        codes::INVALID_REQUEST => {
            format!("invalid request to server {}: {}", server, error.message)
        }
        _ => error.message,
    };
    McpError::server(error.code, message)
}

/// Merge the process environment with the server's overrides and prepend
/// the conventional tool directories to PATH when they exist.
fn build_environment(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut extra = vec!["/usr/local/bin".to_string()];
    if let Some(home) = dirs::home_dir() {
        extra.insert(0, home.join(".cargo/bin").to_string_lossy().into_owned());
        extra.insert(0, home.join(".local/bin").to_string_lossy().into_owned());
    }

    let mut path = env.get("PATH").cloned().unwrap_or_default();
    for dir in extra {
        if Path::new(&dir).is_dir() && !path.split(':').any(|p| p == dir) {
            path = if path.is_empty() {
                dir
            } else {
                format!("{}:{}", dir, path)
            };
        }
    }
    env.insert("PATH".to_string(), path);
    env
}
