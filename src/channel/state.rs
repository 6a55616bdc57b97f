//! Connection state machine of a worker channel, free of any I/O.
//!
//! ```text
//! Disconnected -> WaitingForPing -> [Initializing] -> Ready
//!                                                      |  ^
//!                             begin_request ----------+  | consume_response
//!                                                      v  |
//!                          WaitingForResponse -> ResponseReceived
//! ```
//!
//! Any state goes back to `Disconnected` when the connection drops. The
//! driver owning the socket feeds events in and performs the returned
//! [`Step`]; invalid calls are rejected here instead of being checked at each
//! call site.

use std::collections::VecDeque;

use crate::message::{self, ReturnMessage, Status};

use super::ChannelError;

/// Externally observable channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    /// Connected, handshake (and initialization, if configured) not complete.
    WaitingForPing,
    Ready,
    WaitingForResponse,
    ResponseReceived,
}

enum State<R> {
    Disconnected,
    WaitingForPing,
    Initializing { remaining: VecDeque<String> },
    Ready,
    WaitingForResponse { reply: R },
    ResponseReceived { reply: R, payload: String },
}

/// What the driver must do after feeding a received document.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do; the message was unsolicited and has been discarded.
    Ignore,
    /// Write this document to the worker.
    Write(String),
    /// The handshake completed; the channel accepts requests.
    Ready,
    /// A response is waiting in `ResponseReceived`; call
    /// [`Machine::consume_response`].
    ResponseReceived,
    /// Protocol violation; close the connection.
    Drop(String),
}

/// State machine for one channel. `R` is whatever the driver uses to hand a
/// response back to the requester.
pub struct Machine<R> {
    state: State<R>,
    init_documents: Vec<String>,
}

impl<R> Machine<R> {
    pub fn new() -> Self {
        Self::with_init_documents(Vec::new())
    }

    /// Documents to send, in order, after the ping handshake and before the
    /// channel reports `Ready`.
    pub fn with_init_documents(init_documents: Vec<String>) -> Self {
        Self {
            state: State::Disconnected,
            init_documents,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        match self.state {
            State::Disconnected => ChannelStatus::Disconnected,
            State::WaitingForPing | State::Initializing { .. } => ChannelStatus::WaitingForPing,
            State::Ready => ChannelStatus::Ready,
            State::WaitingForResponse { .. } => ChannelStatus::WaitingForResponse,
            State::ResponseReceived { .. } => ChannelStatus::ResponseReceived,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state, State::Disconnected)
    }

    /// A worker connected. Returns the ping document to send.
    pub fn on_accept(&mut self) -> Result<String, ChannelError> {
        if !matches!(self.state, State::Disconnected) {
            return Err(ChannelError::AlreadyConnected);
        }
        self.state = State::WaitingForPing;
        Ok(message::action_document(message::action::PING).to_string())
    }

    /// Start a request. Only valid in `Ready`; otherwise the reply handle is
    /// given back untouched together with the error.
    pub fn begin_request(&mut self, reply: R) -> Result<(), (R, ChannelError)> {
        match self.state {
            State::Ready => {
                self.state = State::WaitingForResponse { reply };
                Ok(())
            }
            _ => {
                let status = self.status();
                Err((reply, ChannelError::NotReady(status)))
            }
        }
    }

    /// Feed one received protocol document.
    pub fn on_document(&mut self, text: &str) -> Step {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::WaitingForPing => {
                if !is_pong(text) {
                    return Step::Drop(format!("invalid ping response: {text}"));
                }
                let mut remaining: VecDeque<String> = self.init_documents.iter().cloned().collect();
                match remaining.pop_front() {
                    Some(first) => {
                        self.state = State::Initializing { remaining };
                        Step::Write(first)
                    }
                    None => {
                        self.state = State::Ready;
                        Step::Ready
                    }
                }
            }
            State::Initializing { mut remaining } => {
                let response = ReturnMessage::from_json(text);
                if !response.is_ok() {
                    return Step::Drop(format!("worker rejected initialization: {}", response.what()));
                }
                match remaining.pop_front() {
                    Some(next) => {
                        self.state = State::Initializing { remaining };
                        Step::Write(next)
                    }
                    None => {
                        self.state = State::Ready;
                        Step::Ready
                    }
                }
            }
            State::WaitingForResponse { reply } => match ReturnMessage::parse(text) {
                Ok(_) => {
                    self.state = State::ResponseReceived {
                        reply,
                        payload: text.to_string(),
                    };
                    Step::ResponseReceived
                }
                Err(reason) => {
                    // Left pending so the disconnect fails the requester.
                    self.state = State::WaitingForResponse { reply };
                    Step::Drop(format!("malformed response: {reason}"))
                }
            },
            other => {
                self.state = other;
                Step::Ignore
            }
        }
    }

    /// Take the captured response and return to `Ready`.
    pub fn consume_response(&mut self) -> Option<(R, String)> {
        match std::mem::replace(&mut self.state, State::Ready) {
            State::ResponseReceived { reply, payload } => Some((reply, payload)),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// The connection dropped. Returns the reply handle of an outstanding
    /// request so the driver can fail it.
    pub fn on_disconnect(&mut self) -> Option<R> {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::WaitingForResponse { reply } | State::ResponseReceived { reply, .. } => Some(reply),
            _ => None,
        }
    }

    /// Whether the handshake is still pending and a timeout should drop the
    /// connection.
    pub fn awaiting_handshake(&self) -> bool {
        matches!(self.state, State::WaitingForPing | State::Initializing { .. })
    }
}

impl<R> Default for Machine<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn is_pong(text: &str) -> bool {
    ReturnMessage::parse(text)
        .is_ok_and(|msg| msg.status() == Status::Ok && msg.what() == message::action::PING)
}
