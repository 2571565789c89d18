//! One proxy per connected slave.
//!
//! A proxy owns the slave's wire behind a single operation lock, so at most
//! one operation is in flight per slave and the strict request/reply
//! turn-taking of the protocol is preserved no matter how many tasks share
//! the proxy. Error boxes become the typed [`OpError`] taxonomy; EOF or a
//! wire failure marks the proxy disconnected and fires its disconnect
//! listeners exactly once.

use crate::error::OpError;
use drover_proto::{BoxedTransport, ErrTag, Message, ProtocolError, Wire, CHUNK_SIZE};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// What a path on the slave turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Missing,
    File,
    Dir,
}

type DisconnectListener = Box<dyn FnOnce(&SlaveProxy) + Send>;

/// Master-side handle for one slave connection.
pub struct SlaveProxy {
    hostname: String,
    version: u32,
    /// The operation lock; holding it is holding the connection.
    wire: Mutex<Wire<BoxedTransport>>,
    disconnected: AtomicBool,
    disconnect_listeners: parking_lot::Mutex<Vec<DisconnectListener>>,
}

impl SlaveProxy {
    /// Wraps a wire whose registration handshake already completed.
    pub fn new(wire: Wire<BoxedTransport>, hostname: String, version: u32) -> Self {
        Self {
            hostname,
            version,
            wire: Mutex::new(wire),
            disconnected: AtomicBool::new(false),
            disconnect_listeners: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Registers a callback for when this slave's connection dies.
    ///
    /// If the slave is already gone the callback runs immediately.
    pub fn on_disconnect(&self, listener: DisconnectListener) {
        if self.is_disconnected() {
            listener(self);
            return;
        }
        self.disconnect_listeners.lock().push(listener);
    }

    fn mark_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("slave {} disconnected", self.hostname);
        let listeners: Vec<_> = std::mem::take(&mut *self.disconnect_listeners.lock());
        for listener in listeners {
            listener(self);
        }
    }

    /// Folds a wire-level failure into the error taxonomy, noting the
    /// connection loss. Every protocol error is terminal for the connection.
    fn connection_failed(&self, err: ProtocolError) -> OpError {
        self.mark_disconnected();
        match err {
            ProtocolError::UnexpectedEof | ProtocolError::Io(_) => OpError::Disconnected,
            other => OpError::Protocol(other),
        }
    }

    // ====================================================================
    // Exchange plumbing
    // ====================================================================

    fn request_for(meth: &'static str) -> Message {
        Message::new().with("meth", meth).with("version", "1")
    }

    async fn roundtrip(
        wire: &mut Wire<BoxedTransport>,
        request: &Message,
    ) -> Result<Message, ProtocolError> {
        wire.send(request).await?;
        wire.recv().await?.ok_or(ProtocolError::UnexpectedEof)
    }

    /// Sends one request and classifies the single reply box.
    async fn simple_call(&self, request: Message) -> Result<Message, OpError> {
        let mut wire = self.wire.lock().await;
        let reply = Self::roundtrip(&mut wire, &request)
            .await
            .map_err(|e| self.connection_failed(e))?;
        classify(reply)
    }

    // ====================================================================
    // Operations
    // ====================================================================

    /// Changes the slave's working directory, or resets it to the start-up
    /// directory when `dir` is `None`. Returns the new absolute path.
    pub async fn set_cwd(&self, dir: Option<&str>) -> Result<String, OpError> {
        let request =
            Self::request_for("set_cwd").maybe_with("cwd", dir.map(str::to_string));
        let reply = self.simple_call(request).await?;
        Ok(reply.require_str("cwd")?.to_string())
    }

    /// Fetches the slave's environment.
    pub async fn getenv(&self) -> Result<HashMap<String, String>, OpError> {
        let reply = self.simple_call(Self::request_for("getenv")).await?;
        let mut env = HashMap::new();
        for (key, value) in reply.iter() {
            if let Some(name) = key.strip_prefix("env_") {
                env.insert(
                    name.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
        Ok(env)
    }

    /// Creates a directory on the slave, including missing parents.
    pub async fn mkdir(&self, dir: &str) -> Result<(), OpError> {
        let request = Self::request_for("mkdir").with("dir", dir.to_string());
        self.simple_call(request).await?;
        Ok(())
    }

    /// Runs a command on the slave, streaming its output to the callbacks
    /// as it arrives, and returns the exit code.
    ///
    /// A stream is only requested when its callback is supplied.
    pub async fn execute(
        &self,
        args: &[String],
        mut on_stdout: Option<&mut (dyn FnMut(&[u8]) + Send)>,
        mut on_stderr: Option<&mut (dyn FnMut(&[u8]) + Send)>,
    ) -> Result<i32, OpError> {
        let request = Self::request_for("execute")
            .with("args", args.join("\0").into_bytes())
            .with("want_stdout", if on_stdout.is_some() { "y" } else { "n" })
            .with("want_stderr", if on_stderr.is_some() { "y" } else { "n" });

        let mut wire = self.wire.lock().await;
        let ack = Self::roundtrip(&mut wire, &request)
            .await
            .map_err(|e| self.connection_failed(e))?;
        expect_ack(classify(ack)?)?;

        loop {
            let msg = wire
                .recv()
                .await
                .map_err(|e| self.connection_failed(e))?
                .ok_or_else(|| self.connection_failed(ProtocolError::UnexpectedEof))?;

            if msg.contains("result") {
                return Ok(msg.require_int("result")?);
            }
            if let Some(e) = error_from(&msg) {
                return Err(e);
            }

            let data = msg.require("data")?.clone();
            match msg.get_str("stream") {
                Some("stdout") => {
                    if let Some(cb) = on_stdout.as_mut() {
                        cb(&data);
                    }
                }
                Some("stderr") => {
                    if let Some(cb) = on_stderr.as_mut() {
                        cb(&data);
                    }
                }
                other => {
                    return Err(OpError::Protocol(ProtocolError::UnexpectedBox(format!(
                        "unknown stream {:?}",
                        other
                    ))))
                }
            }
        }
    }

    /// Uploads a local file to `dest` on the slave.
    ///
    /// The local file is opened before anything is sent, so a missing local
    /// file never starts a remote exchange.
    pub async fn send(&self, local: &Path, dest: &str) -> Result<(), OpError> {
        let mut file = tokio::fs::File::open(local).await?;

        let request = Self::request_for("send").with("dest", dest.to_string());
        let mut wire = self.wire.lock().await;
        let ack = Self::roundtrip(&mut wire, &request)
            .await
            .map_err(|e| self.connection_failed(e))?;
        expect_ack(classify(ack)?)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut read_error: Option<std::io::Error> = None;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    // Terminate the stream cleanly anyway; the slave is
                    // mid-transfer and must see the sentinel.
                    read_error = Some(e);
                    break;
                }
            };
            wire.send(&Message::new().with("data", buf[..n].to_vec()))
                .await
                .map_err(|e| self.connection_failed(e))?;
        }
        wire.send(&Message::new())
            .await
            .map_err(|e| self.connection_failed(e))?;

        let done = wire
            .recv()
            .await
            .map_err(|e| self.connection_failed(e))?
            .ok_or_else(|| self.connection_failed(ProtocolError::UnexpectedEof))?;
        if let Some(e) = read_error {
            return Err(OpError::Io(e));
        }
        expect_ack(classify(done)?)?;
        Ok(())
    }

    /// Downloads `src` from the slave into a new local file.
    ///
    /// Refuses locally if `local` already exists; on a failed transfer the
    /// partial local file is removed.
    pub async fn fetch(&self, src: &str, local: &Path) -> Result<(), OpError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(local)
            .await?;

        let request = Self::request_for("fetch").with("src", src.to_string());
        let mut wire = self.wire.lock().await;

        let result = async {
            wire.send(&request)
                .await
                .map_err(|e| self.connection_failed(e))?;

            let mut write_error: Option<std::io::Error> = None;
            loop {
                let msg = wire
                    .recv()
                    .await
                    .map_err(|e| self.connection_failed(e))?
                    .ok_or_else(|| self.connection_failed(ProtocolError::UnexpectedEof))?;
                if msg.is_empty() {
                    break;
                }
                if let Some(e) = error_from(&msg) {
                    return Err(e);
                }
                // A local write failure must not desync the stream; keep
                // draining data boxes until the sentinel.
                let data = msg.require("data")?.clone();
                if write_error.is_none() {
                    if let Err(e) = file.write_all(&data).await {
                        write_error = Some(e);
                    }
                }
            }

            match write_error {
                Some(e) => Err(OpError::Io(e)),
                None => {
                    file.flush().await?;
                    Ok(())
                }
            }
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(local).await;
        }
        result
    }

    /// Recursively deletes a path on the slave; a missing path is fine.
    pub async fn remove(&self, path: &str) -> Result<(), OpError> {
        let request = Self::request_for("remove").with("path", path.to_string());
        self.simple_call(request).await?;
        Ok(())
    }

    /// Renames `src` to `dest` on the slave.
    pub async fn rename(&self, src: &str, dest: &str) -> Result<(), OpError> {
        let request = Self::request_for("rename")
            .with("src", src.to_string())
            .with("dest", dest.to_string());
        self.simple_call(request).await?;
        Ok(())
    }

    /// Copies `src` to `dest` on the slave.
    pub async fn copy(&self, src: &str, dest: &str) -> Result<(), OpError> {
        let request = Self::request_for("copy")
            .with("src", src.to_string())
            .with("dest", dest.to_string());
        self.simple_call(request).await?;
        Ok(())
    }

    /// Asks what `path` is on the slave.
    pub async fn stat(&self, path: &str) -> Result<StatKind, OpError> {
        let request = Self::request_for("stat").with("path", path.to_string());
        let reply = self.simple_call(request).await?;
        match reply.require_str("result")? {
            "" => Ok(StatKind::Missing),
            "d" => Ok(StatKind::Dir),
            "f" => Ok(StatKind::File),
            other => Err(OpError::Protocol(ProtocolError::UnexpectedBox(format!(
                "unknown stat result {:?}",
                other
            )))),
        }
    }

    /// Closes the connection, notifying disconnect listeners.
    pub async fn close(&self) {
        let mut wire = self.wire.lock().await;
        let _ = wire.close().await;
        drop(wire);
        self.mark_disconnected();
    }
}

impl std::fmt::Debug for SlaveProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveProxy")
            .field("hostname", &self.hostname)
            .field("version", &self.version)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Builds the typed error a tagged failure box carries, if it is one.
fn error_from(reply: &Message) -> Option<OpError> {
    if !reply.contains("errtag") {
        return None;
    }
    let tag = ErrTag::from_wire(reply.get_str("errtag").unwrap_or(""));
    let message = reply.get_str("error").unwrap_or("").to_string();
    Some(OpError::from_reply(tag, message))
}

/// Splits replies into results and tagged failures.
fn classify(reply: Message) -> Result<Message, OpError> {
    match error_from(&reply) {
        Some(err) => Err(err),
        None => Ok(reply),
    }
}

/// The streaming sub-protocols acknowledge with an empty box.
fn expect_ack(reply: Message) -> Result<(), OpError> {
    if reply.is_empty() {
        return Ok(());
    }
    Err(OpError::Protocol(ProtocolError::UnexpectedBox(format!(
        "expected an empty acknowledgement, got {:?}",
        reply
    ))))
}
