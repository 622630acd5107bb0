//! Request-port server.

use crate::{Hello, IpcError, IpcResult, Request, Response, StatusCode};
use daemon_registry::Handle;
use daemon_sessions::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The daemon side of the request port.
///
/// The server owns no daemon state; it attaches connections to processes
/// and forwards requests through this seam. Handler calls run on the
/// blocking pool (they take object-graph locks and may stall on
/// collaborators).
pub trait RequestHandler: Send + Sync {
    /// Handshake: create the process for this connection.
    fn attach(&self, hello: &Hello) -> Result<Handle, StatusCode>;

    /// Execute one request on behalf of `process`.
    fn handle(&self, process: Handle, request: Request) -> Response;

    /// The connection is gone; tear down its process.
    fn detach(&self, process: Handle);
}

/// Request-port server on a Unix domain socket.
pub struct IpcServer {
    socket_path: PathBuf,
    handler: Arc<dyn RequestHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<PathBuf>, handler: Arc<dyn RequestHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket_path: socket_path.into(),
            handler,
            shutdown_tx,
        }
    }

    /// Get a shutdown sender (for handlers that need to trigger shutdown).
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Trigger shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start the server and listen for connections.
    pub async fn run(&self) -> IpcResult<()> {
        let socket_path = Path::new(&self.socket_path);
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "request port listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    error!(error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("request port shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

/// One active request stream bound to a process.
struct ActiveConnection {
    process: Handle,
}

impl Connection for ActiveConnection {
    fn process(&self) -> Handle {
        self.process
    }

    fn mark_long_term(&self) {
        // Requests run on the blocking pool, so a stalled collaborator only
        // costs a blocking-pool thread, never an IO worker.
        debug!(process = %self.process, "request marked long-term");
    }
}

async fn handle_connection(
    stream: UnixStream,
    handler: Arc<dyn RequestHandler>,
) -> IpcResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // First frame must be the handshake.
    if reader.read_line(&mut line).await? == 0 {
        debug!("client went away before handshake");
        return Ok(());
    }
    let hello: Hello = match serde_json::from_str(line.trim()) {
        Ok(hello) => hello,
        Err(e) => {
            warn!(error = %e, "malformed handshake");
            let response = Response::failure("", StatusCode::InvalidRequest, "malformed handshake");
            writer.write_all(response.to_json()?.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            return Ok(());
        }
    };

    let attach_handler = handler.clone();
    let attach_hello = hello.clone();
    let attached = tokio::task::spawn_blocking(move || attach_handler.attach(&attach_hello))
        .await
        .map_err(|e| IpcError::Socket(e.to_string()))?;

    let process = match attached {
        Ok(process) => {
            let response =
                Response::success("", serde_json::json!({ "process": process }));
            writer.write_all(response.to_json()?.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            process
        }
        Err(status) => {
            warn!(?status, pid = hello.pid, "handshake rejected");
            let response = Response::failure("", status, "handshake rejected");
            writer.write_all(response.to_json()?.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            return Ok(());
        }
    };
    let connection = ActiveConnection { process };
    debug!(process = %connection.process(), pid = hello.pid, "client attached");

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request = match Request::from_json(trimmed) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                let response =
                    Response::failure("", StatusCode::InvalidRequest, "malformed request");
                writer.write_all(response.to_json()?.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
                continue;
            }
        };

        // Requests take object-graph locks and may block on collaborators
        // (authority, agent, storage): long-term work off the IO thread.
        connection.mark_long_term();
        let request_handler = handler.clone();
        let response =
            tokio::task::spawn_blocking(move || request_handler.handle(process, request))
                .await
                .map_err(|e| IpcError::Socket(e.to_string()))?;

        writer.write_all(response.to_json()?.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    debug!(process = %process, "client disconnected");
    let detach_handler = handler.clone();
    let _ = tokio::task::spawn_blocking(move || detach_handler.detach(process)).await;
    Ok(())
}

/// Client side of the request port (CLI tools, tests).
pub struct IpcClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
    /// Process handle assigned by the handshake.
    pub process: Handle,
}

impl IpcClient {
    /// Connect and perform the handshake.
    pub async fn connect(socket_path: impl AsRef<Path>, hello: &Hello) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .await
            .map_err(|e| IpcError::Socket(format!("failed to connect: {e}")))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer
            .write_all(serde_json::to_string(hello)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let response = Response::from_json(line.trim())?;
        if !response.is_success() {
            return Err(IpcError::HandshakeRejected(response.status));
        }
        let process = response
            .result
            .as_ref()
            .and_then(|result| result.get("process"))
            .and_then(|value| value.as_u64())
            .map(Handle::from_raw)
            .ok_or_else(|| IpcError::Socket("handshake reply missing process".into()))?;

        Ok(Self {
            reader,
            writer,
            process,
        })
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: Request) -> IpcResult<Response> {
        self.writer
            .write_all(request.to_json()?.as_bytes())
            .await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(IpcError::Socket("server closed the connection".into()));
        }
        Ok(Response::from_json(line.trim())?)
    }
}
