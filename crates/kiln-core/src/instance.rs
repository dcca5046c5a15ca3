//! Session registry: the owner of every live instance.
//!
//! The registry map is locked only long enough to look up, insert or remove
//! an entry. Each instance carries its own locks, so a long install on one
//! instance never blocks lookups of another.

use crate::index::IndexState;
use crate::{Error, Result};
use kiln_types::InstanceId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State scoped to one client instance
#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    /// Read by discovery, compile and debug; written by init and install
    pub state: RwLock<IndexState>,
    /// Serializes installs so two of them never race on `installed.json`
    pub install_lock: Mutex<()>,
    /// One permit per concurrent debug session
    pub debug_slots: Arc<Semaphore>,
    /// Cancelled when the instance is destroyed; every stream derives from it
    pub closed: CancellationToken,
}

impl Instance {
    fn new(id: InstanceId, max_debug_sessions: usize) -> Self {
        Self {
            id,
            state: RwLock::new(IndexState::default()),
            install_lock: Mutex::new(()),
            debug_slots: Arc::new(Semaphore::new(max_debug_sessions)),
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[derive(Debug)]
pub struct Registry {
    instances: RwLock<HashMap<InstanceId, Arc<Instance>>>,
    next_id: AtomicU32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate a fresh instance. Identifiers are never reused.
    pub async fn create(&self, max_debug_sessions: usize) -> Arc<Instance> {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let instance = Arc::new(Instance::new(id, max_debug_sessions));
        self.instances.write().await.insert(id, instance.clone());
        info!("[{}] Instance created", id);
        instance
    }

    /// Look up a live instance.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInstance` for destroyed or never-issued ids.
    pub async fn get(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidInstance(id))
    }

    /// Remove an instance and cancel everything running on it.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInstance` if the id is not live.
    pub async fn destroy(&self, id: InstanceId) -> Result<()> {
        let instance = self
            .instances
            .write()
            .await
            .remove(&id)
            .ok_or(Error::InvalidInstance(id))?;
        instance.closed.cancel();
        debug!("[{}] Instance destroyed", id);
        Ok(())
    }

    pub async fn ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.instances.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }
}
