//! Worker side of the channel protocol.
//!
//! A worker connects to the endpoint its supervisor listens on, answers the
//! ping handshake and then serves one request at a time through an
//! [`ActionHandler`].

use std::io;
use std::path::Path;

use serde_json::Value;
use tokio::net::UnixStream;

use crate::message::{self, action, param, ReturnMessage};
use crate::protocol::{self, DocumentReader};

/// Environment variable carrying the endpoint path to a launched worker.
pub const ENDPOINT_ENV: &str = "SVCD_WORKER_ENDPOINT";

/// Result of handling one action.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Reply(ReturnMessage),
    /// Terminate the connection without replying.
    Exit,
}

/// Console output collected while handling an action. Relayed to the
/// supervisor as `OUTPUT:` lines ahead of the reply.
#[derive(Debug, Default)]
pub struct Console {
    lines: Vec<String>,
}

impl Console {
    pub fn print(&mut self, text: impl Into<String>) {
        self.lines.push(text.into());
    }

    fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }
}

pub trait ActionHandler: Send {
    /// Handle a request whose `"Action"` member is `action`. `Ping` never
    /// reaches the handler.
    fn handle(&mut self, action: &str, document: &Value, console: &mut Console) -> Outcome;
}

/// Answers `Echo` with its `Value`, stops on `Exit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl ActionHandler for EchoHandler {
    fn handle(&mut self, name: &str, document: &Value, _console: &mut Console) -> Outcome {
        match name {
            action::ECHO => {
                let what = match document.get(param::VALUE) {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Outcome::Reply(ReturnMessage::ok(what))
            }
            action::EXIT => Outcome::Exit,
            action::INIT => Outcome::Reply(ReturnMessage::ok("")),
            other => Outcome::Reply(ReturnMessage::failed(format!("Unknown action: {other}"))),
        }
    }
}

/// How [`serve_connection`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeEnd {
    /// The handler asked to exit.
    Exit,
    /// The supervisor closed the connection.
    Disconnected,
}

pub async fn connect(endpoint: &Path) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(endpoint).await?;
    tracing::debug!(endpoint = %endpoint.display(), "connected to supervisor");
    Ok(stream)
}

/// Serve requests on `stream` until the supervisor disconnects or the handler
/// returns [`Outcome::Exit`].
pub async fn serve_connection(
    stream: UnixStream,
    handler: &mut dyn ActionHandler,
) -> io::Result<ServeEnd> {
    let (read, mut write) = stream.into_split();
    let mut reader = DocumentReader::new(read);
    let mut console = Console::default();

    while let Some(line) = reader.next_line().await? {
        tracing::trace!(document = %line, "<- supervisor");
        let reply = match serde_json::from_str::<Value>(&line) {
            Err(e) => ReturnMessage::failed(format!("Invalid JSON: {e}")),
            Ok(document) => match message::action_of(&document) {
                Some(action::PING) => ReturnMessage::ok(action::PING),
                Some(name) => match handler.handle(name, &document, &mut console) {
                    Outcome::Reply(reply) => reply,
                    Outcome::Exit => {
                        tracing::info!("exit requested, closing connection");
                        return Ok(ServeEnd::Exit);
                    }
                },
                None => ReturnMessage::failed("Missing \"Action\" member"),
            },
        };

        for output in console.take() {
            protocol::write_output(&mut write, &output).await?;
        }
        let text = reply.to_json();
        tracing::trace!(document = %text, "-> supervisor");
        protocol::write_line(&mut write, &text).await?;
    }

    tracing::info!("supervisor closed the connection");
    Ok(ServeEnd::Disconnected)
}

/// Connect to `endpoint` and serve it.
pub async fn run(endpoint: &Path, handler: &mut dyn ActionHandler) -> io::Result<ServeEnd> {
    let stream = connect(endpoint).await?;
    serve_connection(stream, handler).await
}
