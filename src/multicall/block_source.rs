//! Block-height event source
//!
//! Polls `eth_blockNumber` and publishes strictly increasing heights on a
//! watch channel. Heights may skip (slow polls, fast chains); a height at or
//! below the last published one is dropped.

use alloy_provider::{Provider, ProviderBuilder};
use eyre::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct BlockWatcher {
    rpc_url: String,
    poll_interval: Duration,
}

impl BlockWatcher {
    pub fn new(rpc_url: String, poll_interval: Duration) -> Self {
        Self { rpc_url, poll_interval }
    }

    /// Start polling on a background task.
    ///
    /// The task stops once every receiver has been dropped.
    pub fn spawn(self) -> Result<(watch::Receiver<u64>, JoinHandle<()>)> {
        let provider = ProviderBuilder::new()
            .connect_http(self.rpc_url.parse()?);
        let (tx, rx) = watch::channel(0u64);
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive_failures = 0u32;

            info!("🧱 Watching blocks every {:?}", poll_interval);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    debug!("No block listeners left, watcher stopping");
                    return;
                }

                match provider.get_block_number().await {
                    Ok(height) => {
                        consecutive_failures = 0;
                        if publish_height(&tx, height) {
                            debug!("🧱 New block {}", height);
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "Block number poll failed ({} in a row): {}",
                            consecutive_failures, e
                        );
                    }
                }
            }
        });

        Ok((rx, handle))
    }
}

/// Publish `height` if it advances the channel. Returns whether it did.
pub fn publish_height(tx: &watch::Sender<u64>, height: u64) -> bool {
    tx.send_if_modified(|current| {
        if height > *current {
            *current = height;
            true
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heights_only_advance() {
        let (tx, mut rx) = watch::channel(0u64);

        assert!(publish_height(&tx, 100));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 100);

        // Regression and repeat are dropped without waking receivers
        assert!(!publish_height(&tx, 99));
        assert!(!publish_height(&tx, 100));
        assert!(!rx.has_changed().unwrap());

        // Gaps are fine
        assert!(publish_height(&tx, 105));
        assert_eq!(*rx.borrow_and_update(), 105);
    }

    #[tokio::test]
    async fn test_bad_url_rejected() {
        let watcher = BlockWatcher::new("not a url".to_string(), Duration::from_secs(1));
        assert!(watcher.spawn().is_err());
    }
}
