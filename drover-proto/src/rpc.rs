//! Ask-token RPC correlation over a wire.
//!
//! A request carries `_command` and, unless fire-and-forget, a fresh `_ask`
//! token drawn from a per-connection counter. The reply echoes the token in
//! `_answer` on success or `_error` on failure. The protocol is strictly
//! turn-taking: one outstanding call per connection, so the next incoming
//! box must be the reply and any token mismatch is fatal.

use crate::error::ProtocolError;
use crate::message::Message;
use crate::transport::Transport;
use crate::wire::Wire;
use std::collections::HashMap;
use thiserror::Error;

/// Reserved envelope keys.
pub mod keys {
    pub const COMMAND: &str = "_command";
    pub const ASK: &str = "_ask";
    pub const ANSWER: &str = "_answer";
    pub const ERROR: &str = "_error";
    pub const ERROR_DESCRIPTION: &str = "_error_description";
    pub const ERROR_CODE: &str = "_error_code";
}

/// Failure of a single remote call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The peer answered with an error box; recoverable by the caller.
    #[error("remote error: {0}")]
    Remote(String),

    /// The exchange itself went wrong; fatal to the connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An error a call handler declares back to its caller.
///
/// Returning this from a handler makes the layer reply with an `_error`
/// envelope instead of an answer. Because the handler yields either a
/// response box or a fault, never both, a double response cannot happen.
#[derive(Debug)]
pub struct RemoteFault {
    pub description: String,
}

impl RemoteFault {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

type Handler = Box<dyn Fn(Message) -> Result<Message, RemoteFault> + Send + Sync>;

/// Explicit dispatch table for [`Rpc::handle_call`], built once at startup.
#[derive(Default)]
pub struct CallTable {
    handlers: HashMap<String, Handler>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `command`, replacing any previous one.
    pub fn register<F>(&mut self, command: impl Into<String>, handler: F)
    where
        F: Fn(Message) -> Result<Message, RemoteFault> + Send + Sync + 'static,
    {
        self.handlers.insert(command.into(), Box::new(handler));
    }

    fn get(&self, command: &str) -> Option<&Handler> {
        self.handlers.get(command)
    }
}

/// One side of an RPC connection.
pub struct Rpc<T> {
    wire: Wire<T>,
    counter: u64,
}

impl<T: Transport> Rpc<T> {
    pub fn new(wire: Wire<T>) -> Self {
        Self { wire, counter: 0 }
    }

    /// Sends `command` with a fresh ask token and blocks for the reply.
    ///
    /// On success the reply is returned with the correlation key stripped.
    /// An `_error` reply with a matching token becomes [`CallError::Remote`];
    /// a mismatched token on either is a protocol error.
    pub async fn call_remote(
        &mut self,
        command: &str,
        args: Message,
    ) -> Result<Message, CallError> {
        let token = self.next_token();
        let request = args
            .with(keys::COMMAND, command.to_string())
            .with(keys::ASK, token.clone());
        self.wire.send(&request).await?;

        let mut reply = self
            .wire
            .recv()
            .await?
            .ok_or(ProtocolError::UnexpectedEof)?;

        if let Some(answer) = reply.remove(keys::ANSWER) {
            let got = String::from_utf8_lossy(&answer).into_owned();
            if got != token {
                return Err(ProtocolError::TokenMismatch {
                    expected: token,
                    got,
                }
                .into());
            }
            return Ok(reply);
        }

        if let Some(error) = reply.remove(keys::ERROR) {
            let got = String::from_utf8_lossy(&error).into_owned();
            if got != token {
                return Err(ProtocolError::TokenMismatch {
                    expected: token,
                    got,
                }
                .into());
            }
            let description = reply
                .get_str(keys::ERROR_DESCRIPTION)
                .unwrap_or("unspecified remote error")
                .to_string();
            return Err(CallError::Remote(description));
        }

        Err(ProtocolError::MalformedReply.into())
    }

    /// Sends `command` without a reply expected or consumed.
    pub async fn call_remote_no_answer(
        &mut self,
        command: &str,
        args: Message,
    ) -> Result<(), CallError> {
        let token = self.next_token();
        let request = args
            .with(keys::COMMAND, command.to_string())
            .with(keys::ASK, token);
        self.wire.send(&request).await?;
        Ok(())
    }

    /// Receives one call and dispatches it through `table`.
    ///
    /// Returns `Ok(false)` when the peer disconnected cleanly. A malformed
    /// envelope (missing `_ask` or `_command`) or an unknown command is a
    /// protocol error, terminating the owning connection's loop.
    pub async fn handle_call(&mut self, table: &CallTable) -> Result<bool, ProtocolError> {
        let mut request = match self.wire.recv().await? {
            Some(msg) => msg,
            None => return Ok(false),
        };

        let token = request
            .remove(keys::ASK)
            .ok_or(ProtocolError::MissingKey(keys::ASK))?;
        let command = request
            .remove(keys::COMMAND)
            .ok_or(ProtocolError::MissingKey(keys::COMMAND))?;
        let command = std::str::from_utf8(&command)
            .map_err(|_| ProtocolError::ValueNotUtf8(keys::COMMAND.to_string()))?
            .to_string();

        let handler = table
            .get(&command)
            .ok_or_else(|| ProtocolError::UnknownCommand(command.clone()))?;

        match handler(request) {
            Ok(response) => {
                let response = response.with(keys::ANSWER, token);
                self.wire.send(&response).await?;
            }
            Err(fault) => {
                let response = Message::new()
                    .with(keys::ERROR, token)
                    .with(keys::ERROR_DESCRIPTION, fault.description)
                    .with(keys::ERROR_CODE, "0");
                self.wire.send(&response).await?;
            }
        }
        Ok(true)
    }

    /// Consumes the layer, returning the underlying wire.
    pub fn into_wire(self) -> Wire<T> {
        self.wire
    }

    fn next_token(&mut self) -> String {
        self.counter += 1;
        self.counter.to_string()
    }
}
