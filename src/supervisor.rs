//! Worker process supervision.
//!
//! A [`SubprocessSupervisor`] owns one worker process and the channel it talks
//! over. The channel runs on a dedicated thread with its own current-thread
//! tokio runtime; the public API is synchronous and blocks the caller with a
//! tick-based poll bounded by the configured timeouts. Every public method
//! takes the same mutex, so concurrent callers are serialized onto the single
//! channel.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, ChannelConfig, ChannelError, ChannelHandle, ChannelStatus, WorkerChannel};
use crate::config::OrchestratorConfig;
use crate::message::ReturnMessage;
use crate::worker::ENDPOINT_ENV;

/// Worker type that never spawns a process. An in-process stand-in connects
/// to the endpoint instead.
pub const TEST_WORKER: &str = "test";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub session_id: String,
    pub worker_type: String,
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub runtime_dir: PathBuf,
    /// Bounds both startup of the event loop and the worker handshake.
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    pub tick: Duration,
    pub init_documents: Vec<Value>,
}

impl SupervisorConfig {
    pub fn new(session_id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            worker_type: worker_type.into(),
            executable: None,
            args: Vec::new(),
            runtime_dir: channel::default_runtime_dir(),
            connection_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            tick: Duration::from_millis(10),
            init_documents: Vec::new(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig, session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            worker_type: config.worker.worker_type.clone(),
            executable: config.worker.executable.clone(),
            args: config.worker.args.clone(),
            runtime_dir: config.worker.runtime_dir(),
            connection_timeout: config.timeouts.connection(),
            response_timeout: config.timeouts.response(),
            tick: config.timeouts.tick(),
            init_documents: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> PathBuf {
        channel::endpoint_path(&self.runtime_dir, &self.session_id, &self.worker_type)
    }

    pub fn is_test_worker(&self) -> bool {
        self.worker_type == TEST_WORKER
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("channel event loop failed to start: {0}")]
    LoopStart(String),
    #[error("worker channel did not come up within {0:?}")]
    ChannelUnavailable(Duration),
    #[error("no worker executable configured")]
    NoExecutable,
    #[error("failed to launch worker {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("worker exited before completing the handshake ({0})")]
    WorkerExited(String),
    #[error("no response within {0:?}; the request outcome is unknown")]
    ResponseTimeout(Duration),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("supervisor has been shut down")]
    ShutDown,
}

type Startup = std_mpsc::Receiver<Result<ChannelHandle, ChannelError>>;

#[derive(Default)]
struct Inner {
    thread: Option<JoinHandle<()>>,
    startup: Option<Startup>,
    channel: Option<ChannelHandle>,
    child: Option<Child>,
    shut_down: bool,
}

pub struct SubprocessSupervisor {
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
}

impl SubprocessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn endpoint(&self) -> PathBuf {
        self.config.endpoint()
    }

    pub fn status(&self) -> ChannelStatus {
        let inner = self.inner.lock();
        inner
            .channel
            .as_ref()
            .map_or(ChannelStatus::Disconnected, ChannelHandle::status)
    }

    /// PID of the launched worker, if one is alive or not yet reaped.
    pub fn worker_pid(&self) -> Option<u32> {
        self.inner.lock().child.as_ref().map(Child::id)
    }

    /// Start the background event loop if needed and wait for its channel.
    pub fn ensure_worker_running(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock();
        self.ensure_worker(&mut inner).map(|_| ())
    }

    /// Make sure a worker is connected and `Ready`, launching it if none is
    /// alive. Launch failures are not retried.
    pub fn ensure_subprocess_running(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock();
        let handle = self.ensure_worker(&mut inner)?;
        self.ensure_subprocess(&mut inner, &handle)
    }

    /// Send one request and wait for the raw response text.
    pub fn send_request(&self, document: &Value) -> Result<String, SupervisorError> {
        let mut inner = self.inner.lock();
        self.request(&mut inner, document)
    }

    /// Like [`send_request`](Self::send_request), then tear the worker down
    /// whatever the outcome.
    pub fn send_single_request(&self, document: &Value) -> Result<String, SupervisorError> {
        let mut inner = self.inner.lock();
        let result = self.request(&mut inner, document);
        self.teardown_worker(&mut inner);
        result
    }

    /// [`send_request`](Self::send_request) with every failure folded into a
    /// `Failed` message.
    pub fn execute(&self, document: &Value) -> ReturnMessage {
        match self.send_request(document) {
            Ok(text) => ReturnMessage::from_json(&text),
            Err(e) => ReturnMessage::failed(e.to_string()),
        }
    }

    /// The worker died underneath us. Discard the channel's client state
    /// without any shutdown exchange.
    pub fn stop_connection_handling_after_crash(&self) {
        let mut inner = self.inner.lock();
        tracing::warn!(worker = %self.config.worker_type, "worker crashed, discarding connection");
        if let Some(handle) = inner.channel.as_ref() {
            self.discard_client(handle);
        }
        if let Some(child) = inner.child.take() {
            reap(child);
        }
    }

    /// Stop the event loop, join its thread and release the worker. Safe to
    /// call more than once, and before anything was started.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;

        // The loop must be told to quit before the join.
        self.cancel.cancel();
        inner.channel = None;
        inner.startup = None;
        if let Some(thread) = inner.thread.take() {
            if thread.join().is_err() {
                tracing::error!("channel thread panicked");
            }
        }
        if let Some(child) = inner.child.take() {
            reap(child);
        }
        tracing::info!(
            session = %self.config.session_id,
            worker = %self.config.worker_type,
            "supervisor shut down"
        );
    }

    fn request(&self, inner: &mut Inner, document: &Value) -> Result<String, SupervisorError> {
        let handle = self.ensure_worker(inner)?;
        self.ensure_subprocess(inner, &handle)?;
        let response = self.exchange(&handle, document);
        if let Err(e) = &response {
            tracing::warn!(%e, "worker request failed");
        }
        response
    }

    fn ensure_worker(&self, inner: &mut Inner) -> Result<ChannelHandle, SupervisorError> {
        if inner.shut_down {
            return Err(SupervisorError::ShutDown);
        }
        if let Some(handle) = inner.channel.as_ref() {
            return Ok(handle.clone());
        }

        if inner.thread.is_none() {
            let (startup_tx, startup_rx) = std_mpsc::channel();
            let endpoint = self.config.endpoint();
            let channel_config = ChannelConfig {
                handshake_timeout: self.config.connection_timeout,
                init_documents: self.config.init_documents.clone(),
            };
            let cancel = self.cancel.clone();
            let thread = std::thread::Builder::new()
                .name(format!("svcd-{}", self.config.worker_type))
                .spawn(move || run_event_loop(endpoint, channel_config, cancel, startup_tx))
                .map_err(|e| SupervisorError::LoopStart(e.to_string()))?;
            inner.thread = Some(thread);
            inner.startup = Some(startup_rx);
        }

        let deadline = Instant::now() + self.config.connection_timeout;
        loop {
            let Some(startup) = inner.startup.as_ref() else {
                return Err(SupervisorError::LoopStart("startup channel missing".into()));
            };
            let failure = match startup.try_recv() {
                Ok(Ok(handle)) => {
                    inner.startup = None;
                    inner.channel = Some(handle.clone());
                    return Ok(handle);
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(std_mpsc::TryRecvError::Disconnected) => {
                    Some("event loop exited during startup".to_string())
                }
                Err(std_mpsc::TryRecvError::Empty) => None,
            };
            if let Some(reason) = failure {
                tracing::error!(%reason, "channel event loop failed to start");
                inner.startup = None;
                if let Some(thread) = inner.thread.take() {
                    let _ = thread.join();
                }
                return Err(SupervisorError::LoopStart(reason));
            }
            if Instant::now() >= deadline {
                tracing::error!(timeout = ?self.config.connection_timeout, "channel event loop did not start in time");
                return Err(SupervisorError::ChannelUnavailable(self.config.connection_timeout));
            }
            std::thread::sleep(self.config.tick);
        }
    }

    fn ensure_subprocess(
        &self,
        inner: &mut Inner,
        handle: &ChannelHandle,
    ) -> Result<(), SupervisorError> {
        let status = handle.status();
        match status {
            ChannelStatus::Ready => return Ok(()),
            ChannelStatus::WaitingForResponse | ChannelStatus::ResponseReceived => {
                return Err(ChannelError::NotReady(status).into());
            }
            ChannelStatus::WaitingForPing | ChannelStatus::Disconnected => {}
        }

        let launch = match inner.child.as_mut() {
            Some(child) => match child.try_wait() {
                // Alive but without a connection: it lost the channel.
                Ok(None) => handle.status() == ChannelStatus::Disconnected,
                Ok(Some(status)) => {
                    tracing::info!(%status, "worker process has exited");
                    true
                }
                Err(e) => {
                    tracing::warn!(?e, "failed to query worker process");
                    true
                }
            },
            // A peer mid-handshake holds the channel; a new worker would be turned away.
            None => !self.config.is_test_worker() && status == ChannelStatus::Disconnected,
        };

        if launch {
            if let Some(old) = inner.child.take() {
                reap(old);
            }
            inner.child = Some(self.launch(handle)?);
        }

        self.wait_for_handshake(inner, handle)
    }

    fn launch(&self, handle: &ChannelHandle) -> Result<Child, SupervisorError> {
        let executable = self
            .config
            .executable
            .as_ref()
            .ok_or(SupervisorError::NoExecutable)?;
        let endpoint = handle.endpoint();

        let child = Command::new(executable)
            .args(&self.config.args)
            .env(ENDPOINT_ENV, &endpoint)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| {
                tracing::error!(path = %executable.display(), %source, "failed to launch worker");
                SupervisorError::Launch {
                    path: executable.clone(),
                    source,
                }
            })?;

        tracing::info!(
            pid = child.id(),
            path = %executable.display(),
            endpoint = %endpoint.display(),
            "worker process launched"
        );
        Ok(child)
    }

    fn wait_for_handshake(
        &self,
        inner: &mut Inner,
        handle: &ChannelHandle,
    ) -> Result<(), SupervisorError> {
        let timeout = self.config.connection_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if handle.status() == ChannelStatus::Ready {
                return Ok(());
            }
            if let Some(child) = inner.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::warn!(%status, "worker exited during startup");
                    inner.child = None;
                    return Err(SupervisorError::WorkerExited(status.to_string()));
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(?timeout, "worker did not complete the handshake");
                if let Some(child) = inner.child.take() {
                    reap(child);
                }
                self.discard_client(handle);
                return Err(SupervisorError::HandshakeTimeout(timeout));
            }
            std::thread::sleep(self.config.tick);
        }
    }

    fn exchange(&self, handle: &ChannelHandle, document: &Value) -> Result<String, SupervisorError> {
        let mut reply = handle.request(document)?;
        let timeout = self.config.response_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            match reply.try_recv() {
                Ok(result) => return result.map_err(SupervisorError::from),
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(ChannelError::Closed.into());
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::ResponseTimeout(timeout));
            }
            std::thread::sleep(self.config.tick);
        }
    }

    /// Drop the channel's client and wait until the channel has done so.
    fn discard_client(&self, handle: &ChannelHandle) {
        let Ok(mut done) = handle.drop_client() else {
            return;
        };
        let deadline = Instant::now() + self.config.connection_timeout;
        while matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty))
            && Instant::now() < deadline
        {
            std::thread::sleep(self.config.tick);
        }
    }

    fn teardown_worker(&self, inner: &mut Inner) {
        if let Some(handle) = inner.channel.as_ref() {
            self.discard_client(handle);
        }
        if let Some(child) = inner.child.take() {
            reap(child);
        }
        tracing::debug!(worker = %self.config.worker_type, "single-request worker torn down");
    }
}

impl Drop for SubprocessSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_event_loop(
    endpoint: PathBuf,
    config: ChannelConfig,
    cancel: CancellationToken,
    startup: std_mpsc::Sender<Result<ChannelHandle, ChannelError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = startup.send(Err(ChannelError::Io(e)));
            return;
        }
    };

    runtime.block_on(async move {
        match WorkerChannel::listen(&endpoint, config).await {
            Ok((channel, handle)) => {
                if startup.send(Ok(handle)).is_err() {
                    return;
                }
                channel.run(cancel).await;
            }
            Err(e) => {
                tracing::error!(%e, endpoint = %endpoint.display(), "failed to open worker channel");
                let _ = startup.send(Err(e));
            }
        }
    });
}

/// Kill (if still running) and wait for a worker process.
fn reap(mut child: Child) {
    let pid = child.id();
    let _ = child.kill();
    match child.wait() {
        Ok(status) => tracing::debug!(pid, %status, "worker process reaped"),
        Err(e) => tracing::warn!(pid, ?e, "failed to reap worker process"),
    }
}
