#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use svcd::channel::{ChannelConfig, ChannelHandle, ChannelStatus, WorkerChannel};
use svcd::worker::{self, EchoHandler};

pub const PING: &str = r#"{"Action":"Ping"}"#;
pub const PONG: &str = r#"{"Status":"Ok","What":"Ping"}"#;

/// A channel running on the current runtime, listening in a fresh temp dir.
pub struct TestChannel {
    pub path: PathBuf,
    pub handle: ChannelHandle,
    pub cancel: CancellationToken,
    _dir: TempDir,
}

impl Drop for TestChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn start_channel(config: ChannelConfig) -> TestChannel {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("worker.sock");
    let (channel, handle) = WorkerChannel::listen(&path, config).await.unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(channel.run(cancel.clone()));
    TestChannel {
        path,
        handle,
        cancel,
        _dir: dir,
    }
}

pub async fn start_default_channel() -> TestChannel {
    start_channel(ChannelConfig::default()).await
}

/// Poll until the channel reports `status`.
pub async fn wait_for_status(handle: &ChannelHandle, status: ChannelStatus) {
    for _ in 0..500 {
        if handle.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel never reached {status:?}, still {:?}", handle.status());
}

/// A hand-driven worker speaking the line protocol directly.
pub struct RawWorker {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawWorker {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// Next line from the channel, or `None` on EOF.
    pub async fn read_line(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a line from the channel")
            .unwrap_or(None)
    }

    pub async fn write_line(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Answer the ping.
    pub async fn handshake(&mut self) {
        assert_eq!(self.read_line().await.as_deref(), Some(PING));
        self.write_line(PONG).await;
    }
}

/// An in-process worker on its own thread, reconnecting whenever its
/// connection ends, until dropped.
pub struct StandIn {
    stop: Arc<AtomicBool>,
}

impl Drop for StandIn {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub fn spawn_stand_in(endpoint: PathBuf) -> StandIn {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            while !flag.load(Ordering::SeqCst) {
                match worker::connect(&endpoint).await {
                    Ok(stream) => {
                        let mut handler = EchoHandler;
                        let _ = worker::serve_connection(stream, &mut handler).await;
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        });
    });
    StandIn { stop }
}

/// Spawn an echo worker task on the current runtime and wait until the
/// channel is ready.
pub async fn connect_echo_worker(channel: &TestChannel) -> tokio::task::JoinHandle<std::io::Result<worker::ServeEnd>> {
    let stream = worker::connect(&channel.path).await.unwrap();
    let task = tokio::spawn(async move {
        let mut handler = EchoHandler;
        worker::serve_connection(stream, &mut handler).await
    });
    channel
        .handle
        .wait_ready(Duration::from_secs(5))
        .await
        .unwrap();
    task
}
