//! Operation table and dispatcher loop.
//!
//! Requests arrive as boxes carrying `meth` and `version` plus
//! operation-specific keys. The table maps operation name to version to
//! handler and is built explicitly at startup; failed lookups distinguish an
//! unknown method from a version that is too new or merely unsupported.
//!
//! The dispatcher owns its working directory as explicit state rather than
//! calling into the process-wide one, so several dispatchers can serve from
//! one process (the in-process listener relies on this). Child processes are
//! launched with that directory and relative paths resolve against it.

use crate::error::{OpFault, SlaveError};
use crate::exec;
use drover_proto::{ErrTag, Message, ProtocolError, Transport, Wire, CHUNK_SIZE, MAX_KEY_LEN, MAX_VALUE_LEN, PROTOCOL_VERSION};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Identifies one operation implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    SetCwd,
    Getenv,
    Mkdir,
    Execute,
    Send,
    Fetch,
    Remove,
    Rename,
    Copy,
    Stat,
}

/// Two-level registry: operation name, then version, then handler.
pub struct OpTable {
    ops: HashMap<&'static str, BTreeMap<u32, OpKind>>,
}

impl OpTable {
    /// Builds the full standard operation set.
    pub fn standard() -> Self {
        let mut table = Self {
            ops: HashMap::new(),
        };
        table.register("set_cwd", 1, OpKind::SetCwd);
        table.register("getenv", 1, OpKind::Getenv);
        table.register("mkdir", 1, OpKind::Mkdir);
        table.register("execute", 1, OpKind::Execute);
        table.register("send", 1, OpKind::Send);
        table.register("fetch", 1, OpKind::Fetch);
        table.register("remove", 1, OpKind::Remove);
        table.register("rename", 1, OpKind::Rename);
        table.register("copy", 1, OpKind::Copy);
        table.register("stat", 1, OpKind::Stat);
        table
    }

    /// Registers a handler for one (name, version) pair.
    pub fn register(&mut self, name: &'static str, version: u32, kind: OpKind) {
        let versions = self.ops.entry(name).or_default();
        let previous = versions.insert(version, kind);
        assert!(
            previous.is_none(),
            "duplicate handler for {} v{}",
            name,
            version
        );
    }

    /// Resolves a request to a handler, or to the error box it deserves.
    pub fn lookup(&self, name: &str, version: u32) -> Result<OpKind, (ErrTag, String)> {
        let versions = self
            .ops
            .get(name)
            .ok_or_else(|| (ErrTag::InvalidMethod, "unknown method".to_string()))?;
        if let Some(kind) = versions.get(&version) {
            return Ok(*kind);
        }
        let highest = versions.keys().next_back().copied().unwrap_or(0);
        if version > highest {
            Err((
                ErrTag::VersionTooNew,
                format!("version too new (highest supported: {})", highest),
            ))
        } else {
            Err((
                ErrTag::VersionUnsupported,
                "version not supported".to_string(),
            ))
        }
    }
}

impl Default for OpTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Serves operations for one master connection.
pub struct SlaveServer<T> {
    wire: Wire<T>,
    start_dir: PathBuf,
    cwd: PathBuf,
    ops: OpTable,
}

impl<T: Transport> SlaveServer<T> {
    /// Creates a server whose working directory starts at `start_dir`.
    pub fn new(wire: Wire<T>, start_dir: PathBuf) -> Self {
        Self {
            wire,
            cwd: start_dir.clone(),
            start_dir,
            ops: OpTable::standard(),
        }
    }

    /// Announces this slave to the master and waits for acknowledgement.
    pub async fn register(&mut self, hostname: &str) -> Result<(), SlaveError> {
        let hello = Message::new()
            .with("type", "register")
            .with("hostname", hostname.to_string())
            .with("version", PROTOCOL_VERSION.to_string());
        self.wire.send(&hello).await?;

        let reply = self.wire.recv().await?.ok_or_else(|| {
            SlaveError::Registration("connection closed before acknowledgement".to_string())
        })?;
        if reply.get_str("type") != Some("registered") {
            return Err(SlaveError::Registration(format!(
                "expected a registered box, got {:?}",
                reply
            )));
        }
        Ok(())
    }

    /// Reads and dispatches requests until the master disconnects.
    ///
    /// Client mistakes (bad request shape, unknown method, bad version,
    /// operation rejections) are answered with error boxes and the loop
    /// continues; only wire-level failures end it.
    pub async fn serve(&mut self) -> Result<(), SlaveError> {
        loop {
            let req = match self.wire.recv().await? {
                Some(msg) => msg,
                None => {
                    tracing::info!("master disconnected");
                    return Ok(());
                }
            };

            let meth = req.get_str("meth").map(str::to_string);
            let version = req.get_str("version").and_then(|v| v.parse::<u32>().ok());
            let (meth, version) = match (meth, version) {
                (Some(m), Some(v)) => (m, v),
                _ => {
                    self.send_error(ErrTag::Invalid, "invalid request").await?;
                    continue;
                }
            };

            let kind = match self.ops.lookup(&meth, version) {
                Ok(kind) => kind,
                Err((tag, message)) => {
                    self.send_error(tag, &message).await?;
                    continue;
                }
            };

            tracing::debug!("dispatching {} v{}", meth, version);
            let outcome = match kind {
                OpKind::SetCwd => self.op_set_cwd(&req).await,
                OpKind::Getenv => self.op_getenv().await,
                OpKind::Mkdir => self.op_mkdir(&req).await,
                OpKind::Execute => self.op_execute(&req).await,
                OpKind::Send => self.op_send(&req).await,
                OpKind::Fetch => self.op_fetch(&req).await,
                OpKind::Remove => self.op_remove(&req).await,
                OpKind::Rename => self.op_rename(&req).await,
                OpKind::Copy => self.op_copy(&req).await,
                OpKind::Stat => self.op_stat(&req).await,
            };

            if let Err(fault) = outcome {
                match fault {
                    OpFault::Reject { tag, message } => {
                        tracing::debug!("{} rejected: {} ({})", meth, message, tag);
                        self.send_error(tag, &message).await?;
                    }
                    OpFault::Fatal(e) => return Err(e.into()),
                }
            }
        }
    }

    async fn send_error(&mut self, tag: ErrTag, message: &str) -> Result<(), SlaveError> {
        let reply = Message::new()
            .with("error", message.to_string())
            .with("errtag", tag.as_str().to_string());
        self.wire.send(&reply).await?;
        Ok(())
    }

    /// Extracts a required string parameter.
    fn param<'r>(&self, req: &'r Message, key: &'static str) -> Result<&'r str, OpFault> {
        req.require_str(key)
            .map_err(|_| OpFault::reject(ErrTag::Invalid, "invalid format for this method"))
    }

    /// Extracts a required y/n parameter.
    fn param_bool(&self, req: &Message, key: &'static str) -> Result<bool, OpFault> {
        match req.get_str(key) {
            Some("y") => Ok(true),
            Some("n") => Ok(false),
            _ => Err(OpFault::reject(ErrTag::Invalid, "invalid boolean value")),
        }
    }

    /// Resolves a request path against the current working directory.
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    // ====================================================================
    // Operations
    // ====================================================================

    async fn op_set_cwd(&mut self, req: &Message) -> Result<(), OpFault> {
        let target = match req.get("cwd") {
            Some(_) => {
                let dir = self.param(req, "cwd")?;
                self.resolve(dir)
            }
            None => self.start_dir.clone(),
        };

        let canonical = tokio::fs::canonicalize(&target)
            .await
            .map_err(|e| OpFault::os(ErrTag::NotFound, &e))?;
        let meta = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| OpFault::os(ErrTag::NotFound, &e))?;
        if !meta.is_dir() {
            return Err(OpFault::reject(ErrTag::NotFound, "not a directory"));
        }

        self.cwd = canonical;
        let reply = Message::new().with("cwd", self.cwd.to_string_lossy().into_owned());
        self.wire.send(&reply).await?;
        Ok(())
    }

    async fn op_getenv(&mut self) -> Result<(), OpFault> {
        let mut reply = Message::new();
        for (name, value) in std::env::vars_os() {
            let key = format!("env_{}", name.to_string_lossy());
            if key.len() > MAX_KEY_LEN {
                // cannot be framed; the variable is dropped
                continue;
            }
            let mut bytes = value.to_string_lossy().into_owned().into_bytes();
            bytes.truncate(MAX_VALUE_LEN);
            reply.insert(key, bytes);
        }
        self.wire.send(&reply).await?;
        Ok(())
    }

    async fn op_mkdir(&mut self, req: &Message) -> Result<(), OpFault> {
        let dir = self.param(req, "dir")?;
        let path = self.resolve(dir);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| OpFault::os(ErrTag::Unknown, &e))?;
        self.wire.send(&Message::new()).await?;
        Ok(())
    }

    async fn op_execute(&mut self, req: &Message) -> Result<(), OpFault> {
        let want_stdout = self.param_bool(req, "want_stdout")?;
        let want_stderr = self.param_bool(req, "want_stderr")?;
        let args: Vec<String> = self
            .param(req, "args")?
            .split('\0')
            .map(str::to_string)
            .collect();
        if args.is_empty() || args[0].is_empty() {
            return Err(OpFault::reject(ErrTag::Invalid, "empty argument list"));
        }
        exec::run(&mut self.wire, &self.cwd, &args, want_stdout, want_stderr).await
    }

    async fn op_send(&mut self, req: &Message) -> Result<(), OpFault> {
        let dest = self.param(req, "dest")?;
        let path = self.resolve(dest);

        if tokio::fs::metadata(&path).await.is_ok() {
            return Err(OpFault::reject(
                ErrTag::FileExists,
                "destination file already exists",
            ));
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| OpFault::os(ErrTag::OpenFailed, &e))?;

        // Go ahead; the master streams data boxes, then an empty sentinel.
        self.wire.send(&Message::new()).await?;

        let mut write_error: Option<std::io::Error> = None;
        loop {
            let chunk = self
                .wire
                .recv()
                .await?
                .ok_or(ProtocolError::UnexpectedEof)?;
            if chunk.is_empty() {
                break;
            }
            let data = match chunk.get("data") {
                Some(data) => data.clone(),
                None => {
                    return Err(OpFault::reject(
                        ErrTag::Invalid,
                        "invalid format for this method",
                    ))
                }
            };
            // After a failed write the remaining chunks are drained and
            // dropped so the stream framing stays consistent.
            if write_error.is_none() {
                if let Err(e) = file.write_all(&data).await {
                    write_error = Some(e);
                }
            }
        }

        match write_error {
            Some(e) => Err(OpFault::os(ErrTag::WriteFailed, &e)),
            None => {
                file.flush()
                    .await
                    .map_err(|e| OpFault::os(ErrTag::WriteFailed, &e))?;
                self.wire.send(&Message::new()).await?;
                Ok(())
            }
        }
    }

    async fn op_fetch(&mut self, req: &Message) -> Result<(), OpFault> {
        let src = self.param(req, "src")?;
        let path = self.resolve(src);

        if tokio::fs::metadata(&path).await.is_err() {
            return Err(OpFault::reject(
                ErrTag::NotFound,
                "source file does not exist",
            ));
        }
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| OpFault::os(ErrTag::OpenFailed, &e))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| OpFault::os(ErrTag::ReadFailed, &e))?;
            if n == 0 {
                break;
            }
            self.wire
                .send(&Message::new().with("data", buf[..n].to_vec()))
                .await?;
        }
        self.wire.send(&Message::new()).await?;
        Ok(())
    }

    async fn op_remove(&mut self, req: &Message) -> Result<(), OpFault> {
        let target = self.param(req, "path")?;
        let path = self.resolve(target);

        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => {
                // nothing to remove
                self.wire.send(&Message::new()).await?;
                return Ok(());
            }
        };

        if meta.is_dir() {
            if tokio::fs::remove_dir_all(&path).await.is_err() {
                // Often a directory-permission problem. Make everything
                // under the path writable and retry once.
                make_dirs_writable(&path);
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| OpFault::os(ErrTag::Failed, &e))?;
            }
            if tokio::fs::metadata(&path).await.is_ok() {
                return Err(OpFault::reject(ErrTag::Failed, "tree not removed"));
            }
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| OpFault::os(ErrTag::Failed, &e))?;
        }

        self.wire.send(&Message::new()).await?;
        Ok(())
    }

    async fn op_rename(&mut self, req: &Message) -> Result<(), OpFault> {
        let (src, dest) = self.src_dest(req)?;
        tokio::fs::rename(&src, &dest)
            .await
            .map_err(|e| OpFault::os(ErrTag::Failed, &e))?;
        self.wire.send(&Message::new()).await?;
        Ok(())
    }

    async fn op_copy(&mut self, req: &Message) -> Result<(), OpFault> {
        let (src, dest) = self.src_dest(req)?;
        tokio::fs::copy(&src, &dest)
            .await
            .map_err(|e| OpFault::os(ErrTag::Failed, &e))?;
        self.wire.send(&Message::new()).await?;
        Ok(())
    }

    /// Shared precondition checks for rename and copy.
    fn src_dest(&self, req: &Message) -> Result<(PathBuf, PathBuf), OpFault> {
        let src = self.resolve(self.param(req, "src")?);
        let dest = self.resolve(self.param(req, "dest")?);
        if std::fs::metadata(&src).is_err() {
            return Err(OpFault::reject(
                ErrTag::NotFound,
                "source file does not exist",
            ));
        }
        if std::fs::metadata(&dest).is_ok() {
            return Err(OpFault::reject(
                ErrTag::FileExists,
                "destination file already exists",
            ));
        }
        Ok((src, dest))
    }

    async fn op_stat(&mut self, req: &Message) -> Result<(), OpFault> {
        let target = self.param(req, "path")?;
        let path = self.resolve(target);

        let result = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => "d",
            Ok(_) => "f",
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => "",
            Err(e) => return Err(OpFault::os(ErrTag::Failed, &e)),
        };
        self.wire
            .send(&Message::new().with("result", result.to_string()))
            .await?;
        Ok(())
    }
}

/// Recursively makes every directory under `path` writable.
#[cfg(unix)]
fn make_dirs_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            let child = entry.path();
            let _ = std::fs::set_permissions(&child, std::fs::Permissions::from_mode(0o700));
            make_dirs_writable(&child);
        }
    }
}

#[cfg(not(unix))]
fn make_dirs_writable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_proto::{local_pair, BoxedTransport};
    use tempfile::TempDir;

    fn start_server(dir: &Path) -> Wire<BoxedTransport> {
        let (master, slave) = local_pair();
        let start = dir.to_path_buf();
        tokio::spawn(async move {
            let mut server = SlaveServer::new(Wire::new(slave), start);
            let _ = server.serve().await;
        });
        Wire::new(master)
    }

    fn op(name: &'static str) -> Message {
        Message::new().with("meth", name).with("version", "1")
    }

    async fn recv(wire: &mut Wire<BoxedTransport>) -> Message {
        wire.recv().await.unwrap().unwrap()
    }

    async fn expect_errtag(wire: &mut Wire<BoxedTransport>, tag: &str) {
        let reply = recv(wire).await;
        assert_eq!(reply.get_str("errtag"), Some(tag), "reply: {:?}", reply);
        assert!(reply.contains("error"));
    }

    #[test]
    fn test_table_lookup() {
        let table = OpTable::standard();
        assert_eq!(table.lookup("stat", 1).unwrap(), OpKind::Stat);

        let (tag, _) = table.lookup("teleport", 1).unwrap_err();
        assert_eq!(tag, ErrTag::InvalidMethod);

        let (tag, msg) = table.lookup("stat", 9).unwrap_err();
        assert_eq!(tag, ErrTag::VersionTooNew);
        assert!(msg.contains("highest supported: 1"));

        let (tag, _) = table.lookup("stat", 0).unwrap_err();
        assert_eq!(tag, ErrTag::VersionUnsupported);
    }

    #[test]
    #[should_panic(expected = "duplicate handler")]
    fn test_table_rejects_duplicate_registration() {
        let mut table = OpTable::standard();
        table.register("stat", 1, OpKind::Stat);
    }

    #[tokio::test]
    async fn test_malformed_request_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&Message::new().with("meth", "stat")).await.unwrap();
        expect_errtag(&mut wire, "invalid").await;

        wire.send(&Message::new().with("version", "1")).await.unwrap();
        expect_errtag(&mut wire, "invalid").await;

        wire.send(&op("stat").with("version", "soon").with("path", "x"))
            .await
            .unwrap();
        expect_errtag(&mut wire, "invalid").await;

        // The loop survives all of the above.
        wire.send(&op("stat").with("path", "definitely-missing"))
            .await
            .unwrap();
        let reply = recv(&mut wire).await;
        assert_eq!(reply.get_str("result"), Some(""));
    }

    #[tokio::test]
    async fn test_unknown_method_and_versions() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("teleport")).await.unwrap();
        expect_errtag(&mut wire, "invalid-meth").await;

        wire.send(&Message::new().with("meth", "stat").with("version", "9"))
            .await
            .unwrap();
        expect_errtag(&mut wire, "version-too-new").await;

        wire.send(&Message::new().with("meth", "stat").with("version", "0"))
            .await
            .unwrap();
        expect_errtag(&mut wire, "version-unsupported").await;
    }

    #[tokio::test]
    async fn test_set_cwd_sequence() {
        let dir = TempDir::new().unwrap();
        let start = dir.path().canonicalize().unwrap();
        std::fs::create_dir(start.join("sub")).unwrap();
        let mut wire = start_server(&start);

        // No cwd key: reset to the start directory.
        wire.send(&op("set_cwd")).await.unwrap();
        let reply = recv(&mut wire).await;
        assert_eq!(reply.get_str("cwd"), Some(start.to_str().unwrap()));

        // Relative chdir into an existing directory.
        wire.send(&op("set_cwd").with("cwd", "sub")).await.unwrap();
        let reply = recv(&mut wire).await;
        assert_eq!(
            reply.get_str("cwd"),
            Some(start.join("sub").to_str().unwrap())
        );

        // Missing directory is a notfound rejection.
        wire.send(&op("set_cwd").with("cwd", "nope")).await.unwrap();
        expect_errtag(&mut wire, "notfound").await;

        // And the failed chdir did not move us.
        wire.send(&op("set_cwd").with("cwd", "..")).await.unwrap();
        let reply = recv(&mut wire).await;
        assert_eq!(reply.get_str("cwd"), Some(start.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_getenv_prefixes_variables() {
        std::env::set_var("DROVER_OPS_TEST", "present");
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("getenv")).await.unwrap();
        let reply = recv(&mut wire).await;
        assert_eq!(reply.get_str("env_DROVER_OPS_TEST"), Some("present"));
        // every key carries the prefix
        assert!(reply.keys().all(|k| k.starts_with("env_")));
    }

    #[tokio::test]
    async fn test_mkdir_nested_and_existing() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("mkdir").with("dir", "a/b/c")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());
        assert!(dir.path().join("a/b/c").is_dir());

        // Pre-existing directory is not an error.
        wire.send(&op("mkdir").with("dir", "a/b/c")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());

        wire.send(&op("mkdir")).await.unwrap();
        expect_errtag(&mut wire, "invalid").await;
    }

    #[tokio::test]
    async fn test_execute_streams_both_channels() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        let request = op("execute")
            .with("args", "sh\0-c\0echo hi; echo err >&2")
            .with("want_stdout", "y")
            .with("want_stderr", "y");
        wire.send(&request).await.unwrap();

        // Spawn accepted.
        assert!(recv(&mut wire).await.is_empty());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = loop {
            let msg = recv(&mut wire).await;
            if let Some(result) = msg.get_str("result") {
                break result.parse::<i32>().unwrap();
            }
            let data = msg.get("data").unwrap().to_vec();
            match msg.get_str("stream") {
                Some("stdout") => stdout.extend(data),
                Some("stderr") => stderr.extend(data),
                other => panic!("unexpected stream {:?}", other),
            }
        };

        assert_eq!(stdout, b"hi\n");
        assert_eq!(stderr, b"err\n");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_execute_exit_code_without_output() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        let request = op("execute")
            .with("args", "sh\0-c\0exit 3")
            .with("want_stdout", "y")
            .with("want_stderr", "n");
        wire.send(&request).await.unwrap();

        assert!(recv(&mut wire).await.is_empty());
        let reply = recv(&mut wire).await;
        assert_eq!(reply.get_str("result"), Some("3"));
    }

    #[tokio::test]
    async fn test_execute_runs_in_current_directory() {
        let dir = TempDir::new().unwrap();
        let start = dir.path().canonicalize().unwrap();
        std::fs::create_dir(start.join("sub")).unwrap();
        let mut wire = start_server(&start);

        wire.send(&op("set_cwd").with("cwd", "sub")).await.unwrap();
        recv(&mut wire).await;

        let request = op("execute")
            .with("args", "sh\0-c\0pwd")
            .with("want_stdout", "y")
            .with("want_stderr", "n");
        wire.send(&request).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());

        let mut stdout = Vec::new();
        loop {
            let msg = recv(&mut wire).await;
            if msg.contains("result") {
                break;
            }
            stdout.extend(msg.get("data").unwrap().to_vec());
        }
        let printed = String::from_utf8(stdout).unwrap();
        assert_eq!(printed.trim_end(), start.join("sub").to_str().unwrap());
    }

    #[tokio::test]
    async fn test_execute_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        let request = op("execute")
            .with("args", "/no/such/binary/drover-test")
            .with("want_stdout", "n")
            .with("want_stderr", "n");
        wire.send(&request).await.unwrap();
        expect_errtag(&mut wire, "execfail").await;
    }

    #[tokio::test]
    async fn test_execute_bad_boolean() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        let request = op("execute")
            .with("args", "true")
            .with("want_stdout", "yes")
            .with("want_stderr", "n");
        wire.send(&request).await.unwrap();
        expect_errtag(&mut wire, "invalid").await;
    }

    #[tokio::test]
    async fn test_send_uploads_then_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();

        wire.send(&op("send").with("dest", "up.bin")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());

        for chunk in payload.chunks(CHUNK_SIZE) {
            wire.send(&Message::new().with("data", chunk.to_vec()))
                .await
                .unwrap();
        }
        wire.send(&Message::new()).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());

        let written = std::fs::read(dir.path().join("up.bin")).unwrap();
        assert_eq!(written.len(), payload.len());
        assert_eq!(written, payload);

        // Same destination again: refused before any data flows.
        wire.send(&op("send").with("dest", "up.bin")).await.unwrap();
        expect_errtag(&mut wire, "fileexists").await;
    }

    #[tokio::test]
    async fn test_send_open_failure() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("send").with("dest", "missing-dir/up.bin"))
            .await
            .unwrap();
        expect_errtag(&mut wire, "openfailed").await;
    }

    #[tokio::test]
    async fn test_fetch_streams_file() {
        let dir = TempDir::new().unwrap();
        let payload: Vec<u8> = (0..80 * 1024).map(|i| (i % 97) as u8).collect();
        std::fs::write(dir.path().join("down.bin"), &payload).unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("fetch").with("src", "down.bin")).await.unwrap();

        let mut fetched = Vec::new();
        loop {
            let msg = recv(&mut wire).await;
            if msg.is_empty() {
                break;
            }
            fetched.extend(msg.get("data").unwrap().to_vec());
        }
        assert_eq!(fetched, payload);
    }

    #[tokio::test]
    async fn test_fetch_empty_file_is_just_the_sentinel() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("fetch").with("src", "empty")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_missing_source() {
        let dir = TempDir::new().unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("fetch").with("src", "nope")).await.unwrap();
        expect_errtag(&mut wire, "notfound").await;
    }

    #[tokio::test]
    async fn test_remove_file_dir_and_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join("tree/inner")).unwrap();
        std::fs::write(dir.path().join("tree/inner/f"), b"x").unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("remove").with("path", "f")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());
        assert!(!dir.path().join("f").exists());

        wire.send(&op("remove").with("path", "tree")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());
        assert!(!dir.path().join("tree").exists());

        // Removing something absent is not an error.
        wire.send(&op("remove").with("path", "ghost")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_retries_after_chmod() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("tree/locked");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("f"), b"x").unwrap();
        // Read-only directory: the first remove_dir_all cannot unlink f.
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

        let mut wire = start_server(dir.path());
        wire.send(&op("remove").with("path", "tree")).await.unwrap();
        assert!(recv(&mut wire).await.is_empty());
        assert!(!dir.path().join("tree").exists());
    }

    #[tokio::test]
    async fn test_rename_preconditions() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"one").unwrap();
        std::fs::write(dir.path().join("taken"), b"two").unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("rename").with("src", "ghost").with("dest", "b"))
            .await
            .unwrap();
        expect_errtag(&mut wire, "notfound").await;

        wire.send(&op("rename").with("src", "a").with("dest", "taken"))
            .await
            .unwrap();
        expect_errtag(&mut wire, "fileexists").await;

        wire.send(&op("rename").with("src", "a").with("dest", "b"))
            .await
            .unwrap();
        assert!(recv(&mut wire).await.is_empty());
        assert!(!dir.path().join("a").exists());
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_copy_keeps_source() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"payload").unwrap();
        let mut wire = start_server(dir.path());

        wire.send(&op("copy").with("src", "a").with("dest", "b"))
            .await
            .unwrap();
        assert!(recv(&mut wire).await.is_empty());
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"payload");
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"payload");

        wire.send(&op("copy").with("src", "a").with("dest", "b"))
            .await
            .unwrap();
        expect_errtag(&mut wire, "fileexists").await;
    }

    #[tokio::test]
    async fn test_stat_kinds() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let mut wire = start_server(dir.path());

        for (path, expected) in [("f", "f"), ("d", "d"), ("missing", "")] {
            wire.send(&op("stat").with("path", path.to_string()))
                .await
                .unwrap();
            let reply = recv(&mut wire).await;
            assert_eq!(reply.get_str("result"), Some(expected), "path {}", path);
        }
    }

    #[tokio::test]
    async fn test_register_handshake() {
        let (master, slave) = local_pair();
        let handle = tokio::spawn(async move {
            let mut server = SlaveServer::new(Wire::new(slave), PathBuf::from("/"));
            server.register("worker9").await
        });

        let mut wire = Wire::new(master);
        let hello = wire.recv().await.unwrap().unwrap();
        assert_eq!(hello.get_str("type"), Some("register"));
        assert_eq!(hello.get_str("hostname"), Some("worker9"));
        assert_eq!(hello.get_str("version"), Some("1"));

        wire.send(&Message::new().with("type", "registered"))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_wrong_reply() {
        let (master, slave) = local_pair();
        let handle = tokio::spawn(async move {
            let mut server = SlaveServer::new(Wire::new(slave), PathBuf::from("/"));
            server.register("worker9").await
        });

        let mut wire = Wire::new(master);
        let _hello = wire.recv().await.unwrap().unwrap();
        wire.send(&Message::new().with("type", "rejected"))
            .await
            .unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(SlaveError::Registration(_))
        ));
    }
}
