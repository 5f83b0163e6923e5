use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::common::ClientId;
use crate::proxy::ClientProxy;

/// Registry of the clients currently available to the coordinator.
#[derive(Default)]
pub struct ClientManager {
    clients: Mutex<BTreeMap<ClientId, Arc<dyn ClientProxy>>>,
    changed: Notify,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client. A second registration under a known id is refused and
    /// the first one stays.
    pub fn register(&self, proxy: Arc<dyn ClientProxy>) -> bool {
        let id = proxy.client_id();
        {
            let mut clients = self.clients.lock();
            if clients.contains_key(&id) {
                return false;
            }
            clients.insert(id, proxy);
            info!("Client {} registered ({} available)", id, clients.len());
        }
        self.changed.notify_waiters();
        true
    }

    pub fn num_available(&self) -> usize {
        self.clients.lock().len()
    }

    /// Every registered client, ordered by id.
    pub fn all(&self) -> Vec<Arc<dyn ClientProxy>> {
        self.clients.lock().values().cloned().collect()
    }

    /// Waits until at least `n` clients are registered. Returns `false` if
    /// that does not happen within `timeout`.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.num_available() >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.num_available() >= n;
            }
        }
    }

    /// Up to `num` distinct clients drawn uniformly without replacement.
    pub fn sample(&self, num: usize, rng: &mut StdRng) -> Vec<Arc<dyn ClientProxy>> {
        let clients = self.all();
        clients.choose_multiple(rng, num).cloned().collect()
    }
}
