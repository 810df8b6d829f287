use anyhow::Result;
use std::path::PathBuf;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Polls a file and passes its contents to `update` whenever they change.
///
/// Invalid contents are reported once and otherwise ignored, so the last
/// valid contents stay in effect.
pub(crate) async fn poll(
    path: PathBuf,
    interval: Duration,
    mut last: Vec<u8>,
    mut update: impl FnMut(&[u8]) -> Result<()>,
    drain: drain::Watch,
) {
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = &mut shutdown => {
                debug!("Shutting down");
                return;
            }
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(path = %path.display(), %error, "Failed to read file");
                continue;
            }
        };
        if bytes == last {
            continue;
        }
        match update(&bytes) {
            Ok(()) => info!(path = %path.display(), "Reloaded"),
            Err(error) => {
                warn!(path = %path.display(), error = %format_args!("{error:#}"), "Ignoring invalid contents")
            }
        }
        last = bytes;
    }
}
