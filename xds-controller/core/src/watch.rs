use crate::{ConfigSnapshot, ProxyId};
use futures::prelude::*;
use std::{fmt, pin::Pin, sync::Arc};

pub type ConfigSnapshotStream =
    Pin<Box<dyn Stream<Item = Arc<ConfigSnapshot>> + Send + 'static>>;

/// Models the upstream config manager.
///
/// A watch yields the latest snapshot for a proxy. Snapshots that were not
/// consumed before a newer one was published are superseded. The stream ends
/// when the proxy can no longer be served (e.g. it was deregistered).
pub trait WatchConfig {
    fn watch_config(&self, proxy: &ProxyId, token: Option<&str>)
        -> Result<ConfigWatch, WatchError>;
}

pub struct ConfigWatch {
    pub snapshots: ConfigSnapshotStream,
    pub cancel: WatchCancel,
}

/// Releases a config watch when dropped.
///
/// The handle is neither `Clone` nor `Copy`: whoever owns it owns the watch,
/// and the release callback runs exactly once on every path that drops it.
pub struct WatchCancel(Option<Box<dyn FnOnce() + Send + Sync>>);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to watch proxy config: {0}")]
    Failed(String),
}

// === impl WatchCancel ===

impl WatchCancel {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    pub fn noop() -> Self {
        Self(None)
    }
}

impl Drop for WatchCancel {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl fmt::Debug for WatchCancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchCancel")
            .field("armed", &self.0.is_some())
            .finish()
    }
}

impl fmt::Debug for ConfigWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigWatch")
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}
