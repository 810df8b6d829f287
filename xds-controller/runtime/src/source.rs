use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;
use xds_controller_core::{
    ConfigSnapshot, ConfigWatch, ProxyId, WatchCancel, WatchConfig, WatchError,
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the latest snapshot of every registered proxy.
///
/// Proxies may connect before they are registered; their watches wait for a
/// snapshot. When a registered proxy is removed, its watches end.
#[derive(Debug, Default)]
pub struct Index {
    proxies: HashMap<ProxyId, Proxy>,
}

#[derive(Debug)]
struct Proxy {
    tx: watch::Sender<Option<Arc<ConfigSnapshot>>>,
    watches: usize,
}

/// Serves config watches from a [`SharedIndex`].
#[derive(Clone, Debug)]
pub struct ConfigSource(SharedIndex);

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Replaces the set of registered proxies. Watches only observe proxies
    /// whose snapshot changed.
    pub fn apply(&mut self, snapshots: Vec<ConfigSnapshot>) {
        let mut registered = HashSet::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let id = snapshot.proxy_id.clone();
            registered.insert(id.clone());
            match self.proxies.entry(id) {
                Entry::Occupied(entry) => {
                    let updated = entry.get().tx.send_if_modified(|current| {
                        if current.as_deref() == Some(&snapshot) {
                            return false;
                        }
                        *current = Some(Arc::new(snapshot));
                        true
                    });
                    if updated {
                        debug!(proxy = %entry.key(), "Updated");
                    }
                }
                Entry::Vacant(entry) => {
                    debug!(proxy = %entry.key(), "Registered");
                    let (tx, _) = watch::channel(Some(Arc::new(snapshot)));
                    entry.insert(Proxy { tx, watches: 0 });
                }
            }
        }

        self.proxies.retain(|id, proxy| {
            if registered.contains(id) {
                return true;
            }
            let pending = proxy.tx.borrow().is_none() && proxy.watches > 0;
            if !pending {
                debug!(proxy = %id, "Deregistered");
            }
            pending
        });
    }

    fn watch(&mut self, id: &ProxyId) -> watch::Receiver<Option<Arc<ConfigSnapshot>>> {
        let proxy = self.proxies.entry(id.clone()).or_insert_with(|| Proxy {
            tx: watch::channel(None).0,
            watches: 0,
        });
        proxy.watches += 1;
        proxy.tx.subscribe()
    }

    fn release(&mut self, id: &ProxyId) {
        let Entry::Occupied(mut entry) = self.proxies.entry(id.clone()) else {
            return;
        };
        let proxy = entry.get_mut();
        proxy.watches = proxy.watches.saturating_sub(1);
        if proxy.watches == 0 && proxy.tx.borrow().is_none() {
            entry.remove();
        }
    }
}

// === impl ConfigSource ===

impl ConfigSource {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

impl WatchConfig for ConfigSource {
    fn watch_config(&self, proxy: &ProxyId, _: Option<&str>) -> Result<ConfigWatch, WatchError> {
        let rx = self.0.write().watch(proxy);
        let index = self.0.clone();
        let id = proxy.clone();
        Ok(ConfigWatch {
            snapshots: Box::pin(WatchStream::new(rx).filter_map(future::ready)),
            cancel: WatchCancel::new(move || index.write().release(&id)),
        })
    }
}
