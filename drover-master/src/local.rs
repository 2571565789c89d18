//! In-process slave listener.
//!
//! Wires the two ends of a local duplex transport directly: one end is
//! served by a spawned dispatcher task, the other becomes a normal proxy in
//! the registry. Used for tests and for driving local workers without real
//! sockets.

use crate::error::OpError;
use crate::listener::perform_handshake;
use crate::proxy::SlaveProxy;
use crate::registry::SlaveRegistry;
use drover_proto::{local_pair, Wire};
use drover_slave::SlaveServer;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Spawns in-process slaves and registers them like remote ones.
pub struct LocalSlaveListener {
    registry: SlaveRegistry,
    counter: AtomicU64,
    tasks: parking_lot::Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl LocalSlaveListener {
    pub fn new(registry: SlaveRegistry) -> Self {
        Self {
            registry,
            counter: AtomicU64::new(0),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Starts one slave serving out of `basedir` and adds it to the
    /// registry. Hostnames are generated (`local-1`, `local-2`, ...) so
    /// several local slaves can coexist.
    pub async fn start_slave(&self, basedir: &Path) -> Result<Arc<SlaveProxy>, OpError> {
        assert!(basedir.is_dir(), "basedir {:?} does not exist", basedir);

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let hostname = format!("local-{}", n);
        let (master_end, slave_end) = local_pair();

        let start = basedir.to_path_buf();
        let task_hostname = hostname.clone();
        let task = tokio::spawn(async move {
            let mut server = SlaveServer::new(Wire::new(slave_end), start);
            if let Err(e) = server.register(&task_hostname).await {
                tracing::warn!("local slave {} failed to register: {}", task_hostname, e);
                return;
            }
            if let Err(e) = server.serve().await {
                tracing::debug!("local slave {} ended: {}", task_hostname, e);
            }
        });

        let mut wire = Wire::new(master_end);
        let (registered_as, version) = perform_handshake(&mut wire)
            .await?
            .ok_or(OpError::Disconnected)?;

        let proxy = Arc::new(SlaveProxy::new(wire, registered_as, version));
        self.registry.add_slave(proxy.clone());
        self.tasks.lock().push((hostname, task));
        Ok(proxy)
    }

    /// Tears a local slave down by aborting its task.
    ///
    /// The proxy notices on its next operation, which drops the slave from
    /// the registry the same way a lost TCP connection would.
    pub fn kill_slave(&self, proxy: &SlaveProxy) {
        let mut tasks = self.tasks.lock();
        if let Some(idx) = tasks.iter().position(|(name, _)| name == proxy.hostname()) {
            let (_, task) = tasks.swap_remove(idx);
            task.abort();
        }
    }
}

impl Drop for LocalSlaveListener {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
