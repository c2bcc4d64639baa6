//! Registered client set
//!
//! Transports register and deregister channels from their own tasks; the
//! controller takes snapshots between iterations. Every mutation bumps a
//! membership counter so the controller's wait wakes up promptly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::server::channel::{ChannelId, ClientHandle};

#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    clients: Mutex<BTreeMap<ChannelId, ClientHandle>>,
    membership: watch::Sender<u64>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (membership, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                clients: Mutex::new(BTreeMap::new()),
                membership,
            }),
        }
    }

    pub fn register(&self, channel: ClientHandle) {
        let id = channel.id();
        let count = {
            let mut clients = self.lock();
            clients.insert(id, channel);
            clients.len()
        };
        tracing::debug!("Registered client {} ({} registered)", id, count);
        self.bump();
    }

    /// Remove a channel. Returns false if it was not registered.
    pub fn deregister(&self, id: ChannelId) -> bool {
        let (removed, count) = {
            let mut clients = self.lock();
            let removed = clients.remove(&id).is_some();
            (removed, clients.len())
        };
        if removed {
            tracing::debug!("Deregistered client {} ({} registered)", id, count);
            self.bump();
        }
        removed
    }

    pub fn snapshot(&self) -> BTreeMap<ChannelId, ClientHandle> {
        self.lock().clone()
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.lock().keys().copied().collect()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Receiver that changes on every register/deregister
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.membership.subscribe()
    }

    fn bump(&self) {
        self.inner.membership.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ChannelId, ClientHandle>> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
