//! Local-socket endpoint pairing a supervisor with exactly one worker.
//!
//! A [`WorkerChannel`] owns the listening socket and the state machine and is
//! driven by [`WorkerChannel::run`] on a single task. Everything else talks to
//! it through a cloneable [`ChannelHandle`]: requests go in over an mpsc
//! queue, responses come back on a oneshot, and the current
//! [`ChannelStatus`] is published on a watch channel.

pub mod state;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, DocumentReader, Inbound};

pub use state::{ChannelStatus, Machine, Step};

const COMMAND_QUEUE_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not ready (state: {0:?})")]
    NotReady(ChannelStatus),
    #[error("worker disconnected")]
    Disconnected,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("a worker is already connected")]
    AlreadyConnected,
    #[error("channel command queue is full")]
    Busy,
    #[error("channel event loop is not running")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

type Reply = oneshot::Sender<Result<String, ChannelError>>;

enum Command {
    Send { document: String, reply: Reply },
    DropClient { done: oneshot::Sender<()> },
    Restart {
        path: PathBuf,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long an accepted worker has to answer the ping (and any init
    /// documents) before it is dropped.
    pub handshake_timeout: Duration,
    /// Sent in order after the ping handshake, before the channel is `Ready`.
    pub init_documents: Vec<Value>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            init_documents: Vec::new(),
        }
    }
}

struct Connection {
    reader: DocumentReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct WorkerChannel {
    listener: UnixListener,
    path: PathBuf,
    machine: Machine<Reply>,
    connection: Option<Connection>,
    handshake_timeout: Duration,
    handshake_deadline: Option<Instant>,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ChannelStatus>,
    endpoint_tx: watch::Sender<PathBuf>,
}

impl WorkerChannel {
    /// Bind the endpoint at `path` and build the channel plus its handle.
    ///
    /// Fails with `AddrInUse` if another live process is already listening on
    /// the path; a stale socket file is removed.
    pub async fn listen(
        path: impl AsRef<Path>,
        config: ChannelConfig,
    ) -> Result<(Self, ChannelHandle), ChannelError> {
        let path = path.as_ref().to_path_buf();
        let listener = bind_endpoint(&path).await?;
        tracing::info!(path = %path.display(), "worker channel listening");

        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Disconnected);
        let (endpoint_tx, endpoint_rx) = watch::channel(path.clone());

        let init_documents = config
            .init_documents
            .iter()
            .map(Value::to_string)
            .collect();

        let channel = Self {
            listener,
            path,
            machine: Machine::with_init_documents(init_documents),
            connection: None,
            handshake_timeout: config.handshake_timeout,
            handshake_deadline: None,
            commands,
            status_tx,
            endpoint_tx,
        };
        let handle = ChannelHandle {
            commands: command_tx,
            status: status_rx,
            endpoint: endpoint_rx,
        };
        Ok((channel, handle))
    }

    pub fn endpoint(&self) -> &Path {
        &self.path
    }

    /// Drive the channel until `cancel` fires or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("worker channel received cancel signal");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.on_accept(stream).await,
                        Err(e) => {
                            tracing::error!(?e, "failed to accept worker connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                line = next_line(&mut self.connection) => self.on_line(line).await,
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        None => {
                            tracing::debug!("all channel handles dropped");
                            break;
                        }
                    }
                }
                _ = sleep_until_deadline(self.handshake_deadline) => {
                    tracing::warn!(timeout = ?self.handshake_timeout, "worker did not complete handshake in time");
                    self.disconnect();
                }
            }
        }
        self.disconnect();
        tracing::info!(path = %self.path.display(), "worker channel stopped");
    }

    async fn on_accept(&mut self, stream: UnixStream) {
        if self.connection.is_some() {
            tracing::warn!("rejecting second worker connection, channel is single-tenant");
            drop(stream);
            return;
        }

        let ping = match self.machine.on_accept() {
            Ok(ping) => ping,
            Err(e) => {
                tracing::warn!(%e, "rejecting worker connection");
                return;
            }
        };

        let (read, write) = stream.into_split();
        let mut connection = Connection {
            reader: DocumentReader::new(read),
            writer: write,
        };
        tracing::trace!(document = %ping, "-> worker");
        if let Err(e) = protocol::write_line(&mut connection.writer, &ping).await {
            tracing::warn!(?e, "failed to send ping to worker");
            self.machine.on_disconnect();
            self.publish();
            return;
        }

        tracing::info!("worker connected, waiting for ping response");
        self.connection = Some(connection);
        self.handshake_deadline = Some(Instant::now() + self.handshake_timeout);
        self.publish();
    }

    async fn on_line(&mut self, line: io::Result<Option<String>>) {
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("worker disconnected");
                self.disconnect();
                return;
            }
            Err(e) => {
                tracing::warn!(?e, "worker connection failed");
                self.disconnect();
                return;
            }
        };

        let text = match protocol::classify(line) {
            Inbound::Output(output) => {
                tracing::info!(%output, "worker output");
                return;
            }
            Inbound::Document(text) => text,
        };
        tracing::trace!(document = %text, "<- worker");

        match self.machine.on_document(&text) {
            Step::Ignore => {
                tracing::warn!(document = %text, "discarding unsolicited worker message");
            }
            Step::Write(document) => {
                if let Err(e) = self.write(&document).await {
                    tracing::warn!(?e, "failed to send initialization document");
                    self.disconnect();
                    return;
                }
                self.publish();
            }
            Step::Ready => {
                self.handshake_deadline = None;
                tracing::info!("worker handshake complete");
                self.publish();
            }
            Step::ResponseReceived => {
                if let Some((reply, payload)) = self.machine.consume_response() {
                    self.publish();
                    if reply.send(Ok(payload)).is_err() {
                        tracing::debug!("requester gave up, discarding stale response");
                    }
                }
            }
            Step::Drop(reason) => {
                tracing::warn!(%reason, "dropping worker connection");
                self.disconnect();
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { document, reply } => {
                if let Err((reply, e)) = self.machine.begin_request(reply) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.publish();
                if let Err(e) = self.write(&document).await {
                    tracing::warn!(?e, "failed to send request to worker");
                    self.disconnect();
                }
            }
            Command::DropClient { done } => {
                if self.connection.is_some() {
                    tracing::info!("discarding worker connection state");
                }
                self.disconnect();
                let _ = done.send(());
            }
            Command::Restart { path, reply } => {
                let _ = reply.send(self.restart(path).await);
            }
        }
    }

    /// Drop any client and re-bind under a new endpoint name.
    async fn restart(&mut self, path: PathBuf) -> Result<(), ChannelError> {
        self.disconnect();
        let listener = bind_endpoint(&path).await?;
        if path != self.path {
            let _ = std::fs::remove_file(&self.path);
        }
        self.listener = listener;
        self.path = path.clone();
        tracing::info!(path = %path.display(), "worker channel restarted");
        let _ = self.endpoint_tx.send(path);
        Ok(())
    }

    async fn write(&mut self, document: &str) -> io::Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no worker connected"));
        };
        tracing::trace!(%document, "-> worker");
        protocol::write_line(&mut connection.writer, document).await
    }

    fn disconnect(&mut self) {
        let pending = self.machine.on_disconnect();
        self.connection = None;
        self.handshake_deadline = None;
        self.publish();
        if let Some(reply) = pending {
            let _ = reply.send(Err(ChannelError::Disconnected));
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.machine.status());
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn next_line(connection: &mut Option<Connection>) -> io::Result<Option<String>> {
    match connection {
        Some(connection) => connection.reader.next_line().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Bind a Unix listener at `path`, clearing a stale socket file first.
async fn bind_endpoint(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        // connect() may hang on a live but unresponsive peer.
        let probe_path = path.to_path_buf();
        let is_active = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || {
                std::os::unix::net::UnixStream::connect(&probe_path).is_ok()
            }),
        )
        .await;

        match is_active {
            Ok(Ok(true)) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another process is already listening on {}", path.display()),
                ));
            }
            _ => std::fs::remove_file(path)?,
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Cloneable front end of a running [`WorkerChannel`].
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ChannelStatus>,
    endpoint: watch::Receiver<PathBuf>,
}

impl ChannelHandle {
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn endpoint(&self) -> PathBuf {
        self.endpoint.borrow().clone()
    }

    /// Send a request and wait up to `timeout` for the response text.
    ///
    /// A timeout leaves the channel in `WaitingForResponse`: the worker may
    /// still be processing, so the outcome is unknown rather than failed.
    pub async fn send(&self, document: &Value, timeout: Duration) -> Result<String, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                document: serde_json::to_string(document)?,
                reply,
            })
            .await
            .map_err(|_| ChannelError::Closed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }

    /// Queue a request without waiting. For callers outside the runtime that
    /// poll the receiver themselves.
    pub fn request(
        &self,
        document: &Value,
    ) -> Result<oneshot::Receiver<Result<String, ChannelError>>, ChannelError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Send {
            document: serde_json::to_string(document)?,
            reply,
        };
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Busy,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })?;
        Ok(rx)
    }

    /// Discard the current client connection without any shutdown exchange.
    /// The returned receiver resolves once the connection is gone.
    pub fn drop_client(&self) -> Result<oneshot::Receiver<()>, ChannelError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .try_send(Command::DropClient { done })
            .map_err(|_| ChannelError::Closed)?;
        Ok(rx)
    }

    /// Wait until a worker has completed the handshake.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut status = self.status.clone();
        tokio::time::timeout(timeout, status.wait_for(|s| *s == ChannelStatus::Ready))
            .await
            .map_err(|_| ChannelError::Timeout(timeout))?
            .map_err(|_| ChannelError::Closed)?;
        Ok(())
    }

    /// Re-bind the channel under `path`, dropping any connected worker.
    pub async fn restart(&self, path: impl Into<PathBuf>) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Restart {
                path: path.into(),
                reply,
            })
            .await
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }
}

/// Endpoint path for a (session, worker type) pair. Deterministic, so a
/// restarted worker reconnects to the same name.
pub fn endpoint_path(runtime_dir: &Path, session_id: &str, worker_type: &str) -> PathBuf {
    runtime_dir.join(format!(
        "svcd-{}-{}.sock",
        sanitize_component(session_id),
        sanitize_component(worker_type)
    ))
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Directory for channel sockets of this user.
pub fn default_runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(format!("/tmp/svcd-{}", whoami())))
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
