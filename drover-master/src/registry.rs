//! The slave registry.
//!
//! A thread-safe hostname-to-proxy map with one wake-all notification that
//! fires on every add and remove. `get_slave` with `block = true` loops:
//! filter, pick, or wait for the next change and retry. Picking among
//! several matches is uniformly random unless the caller supplies a
//! comparator; that randomness is the whole load-spreading policy, with no
//! reservation or fairness beyond the retry loop.

use crate::proxy::SlaveProxy;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Comparator for choosing among several matching slaves; the smallest wins.
pub type TieBreak = dyn Fn(&SlaveProxy, &SlaveProxy) -> Ordering + Send + Sync;

struct Shared {
    slaves: parking_lot::Mutex<HashMap<String, Arc<SlaveProxy>>>,
    changed: Notify,
}

impl Shared {
    fn remove(&self, hostname: &str) {
        let removed = self.slaves.lock().remove(hostname);
        if removed.is_some() {
            tracing::info!("slave {} removed from registry", hostname);
            self.changed.notify_waiters();
        }
    }
}

/// Concurrent collection of currently connected slaves.
///
/// Cheap to clone; clones share one underlying map.
#[derive(Clone)]
pub struct SlaveRegistry {
    shared: Arc<Shared>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slaves: parking_lot::Mutex::new(HashMap::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// Inserts a freshly registered slave and wakes every waiter.
    ///
    /// Hostnames are unique; inserting a duplicate is a programming error
    /// and panics rather than being reported to the peer.
    pub fn add_slave(&self, slave: Arc<SlaveProxy>) {
        {
            let mut slaves = self.shared.slaves.lock();
            assert!(
                !slaves.contains_key(slave.hostname()),
                "duplicate slave hostname {:?}",
                slave.hostname()
            );
            slaves.insert(slave.hostname().to_string(), slave.clone());
        }
        tracing::info!("slave {} added to registry", slave.hostname());

        // The proxy outlives us via Arc, so the removal hook holds the
        // registry weakly to avoid a reference cycle.
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        slave.on_disconnect(Box::new(move |proxy| {
            if let Some(shared) = weak.upgrade() {
                shared.remove(proxy.hostname());
            }
        }));

        self.shared.changed.notify_waiters();
    }

    /// Removes a slave by hostname; a no-op when already absent.
    pub fn remove_slave(&self, hostname: &str) {
        self.shared.remove(hostname);
    }

    /// Finds a slave satisfying `predicate`.
    ///
    /// With `block = false` this returns `None` when nothing matches right
    /// now. With `block = true` it waits for registry changes and retries
    /// until a match appears. Ties go to `tie_break`'s minimum when given,
    /// otherwise to a uniformly random match.
    pub async fn get_slave<P>(
        &self,
        block: bool,
        predicate: P,
        tie_break: Option<&TieBreak>,
    ) -> Option<Arc<SlaveProxy>>
    where
        P: Fn(&SlaveProxy) -> bool,
    {
        loop {
            // Arm the notification before checking, so an add between the
            // check and the await still wakes us.
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let slaves = self.shared.slaves.lock();
                let mut matches: Vec<Arc<SlaveProxy>> = slaves
                    .values()
                    .filter(|slave| predicate(slave.as_ref()))
                    .cloned()
                    .collect();
                if !matches.is_empty() {
                    return Some(match tie_break {
                        Some(cmp) => {
                            matches.sort_by(|a, b| cmp(a.as_ref(), b.as_ref()));
                            matches.swap_remove(0)
                        }
                        None => {
                            let idx = rand::thread_rng().gen_range(0..matches.len());
                            matches.swap_remove(idx)
                        }
                    });
                }
            }

            if !block {
                return None;
            }
            notified.await;
        }
    }

    /// Snapshot of every registered slave.
    pub fn all_slaves(&self) -> Vec<Arc<SlaveProxy>> {
        self.shared.slaves.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.slaves.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slaves.lock().is_empty()
    }
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}
