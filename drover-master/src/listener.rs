//! TCP slave listener.
//!
//! Accepts connections, runs the registration handshake for each in its own
//! task so one slow registrant cannot stall acceptance, optionally runs a
//! caller-supplied setup hook against the new proxy, and hands it to the
//! registry.

use crate::config::MasterConfig;
use crate::error::OpError;
use crate::proxy::SlaveProxy;
use crate::registry::SlaveRegistry;
use drover_proto::{transport, Message, ProtocolError, Transport, Wire};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Future returned by a setup hook.
pub type SetupFuture = Pin<Box<dyn Future<Output = Result<(), OpError>> + Send>>;

/// Hook run against a freshly registered slave before it joins the
/// registry. It may perform operations on the proxy, e.g. probing
/// capabilities; a failure discards the slave.
pub type SetupHook = dyn Fn(Arc<SlaveProxy>) -> SetupFuture + Send + Sync;

/// Runs the registration handshake on a fresh connection.
///
/// The first box must be `{type: "register", hostname, version}`; the reply
/// is `{type: "registered"}`. A connection that closes before sending the
/// opening box ends without error (`Ok(None)`).
pub async fn perform_handshake<T: Transport>(
    wire: &mut Wire<T>,
) -> Result<Option<(String, u32)>, OpError> {
    let hello = match wire.recv().await? {
        Some(msg) => msg,
        None => return Ok(None),
    };

    if hello.get_str("type") != Some("register") {
        return Err(OpError::Protocol(ProtocolError::UnexpectedBox(format!(
            "expected a register box, got {:?}",
            hello
        ))));
    }
    let hostname = hello.require_str("hostname")?.to_string();
    let version: u32 = hello.require_int("version")?;

    wire.send(&Message::new().with("type", "registered")).await?;
    Ok(Some((hostname, version)))
}

/// Listens on a TCP port and feeds registered slaves into a registry.
pub struct TcpSlaveListener {
    registry: SlaveRegistry,
    listener: TcpListener,
    handshake_timeout: Duration,
    max_slaves: usize,
    setup: Option<Arc<SetupHook>>,
}

impl TcpSlaveListener {
    /// Binds according to `config`.
    pub async fn bind(registry: SlaveRegistry, config: &MasterConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self {
            registry,
            listener,
            handshake_timeout: config.handshake_timeout(),
            max_slaves: config.max_slaves,
            setup: None,
        })
    }

    /// Installs a setup hook run on every new slave before registration.
    pub fn with_setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<SlaveProxy>) -> SetupFuture + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
        self
    }

    /// The bound address, useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever.
    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!(
            "listening for slaves on {}",
            self.listener.local_addr()?
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("accept error: {}", e);
                    continue;
                }
            };

            if self.max_slaves > 0 && self.registry.len() >= self.max_slaves {
                tracing::warn!("[{}] slave limit reached, rejecting", addr);
                continue;
            }

            let registry = self.registry.clone();
            let setup = self.setup.clone();
            let timeout = self.handshake_timeout;
            tokio::spawn(async move {
                handle_connection(registry, setup, stream, addr, timeout).await;
            });
        }
    }
}

async fn handle_connection(
    registry: SlaveRegistry,
    setup: Option<Arc<SetupHook>>,
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    timeout: Duration,
) {
    tracing::info!("[{}] slave connected", addr);
    let mut wire = Wire::new(transport::from_tcp(stream));

    let outcome = tokio::time::timeout(timeout, perform_handshake(&mut wire)).await;
    let (hostname, version) = match outcome {
        Ok(Ok(Some(info))) => info,
        Ok(Ok(None)) => {
            tracing::debug!("[{}] closed before registering", addr);
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!("[{}] handshake failed: {}", addr, e);
            return;
        }
        Err(_) => {
            tracing::warn!("[{}] handshake timed out", addr);
            return;
        }
    };

    let proxy = Arc::new(SlaveProxy::new(wire, hostname.clone(), version));

    if let Some(setup) = setup {
        if let Err(e) = setup(proxy.clone()).await {
            tracing::warn!("[{}] setup for {} failed: {}", addr, hostname, e);
            return;
        }
    }

    registry.add_slave(proxy);
    tracing::info!("[{}] slave {} (v{}) registered", addr, hostname, version);
}
