use lib_statsync::{ChangeFeed, SnapshotSource, SubscriptionLifecycle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Keeps `topic` attached until shutdown, re-attaching after `reconnect_delay`
/// whenever the feed ends or the attach fails.
pub async fn run<S, F>(
    lifecycle: Arc<SubscriptionLifecycle<S, F>>,
    topic: String,
    reconnect_delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: SnapshotSource,
    F: ChangeFeed,
{
    loop {
        match lifecycle.attach(&topic).await {
            Ok(mut handle) => {
                log::info!("Upstream feed '{}' attached (epoch {}).", topic, handle.epoch());
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            log::info!("Upstream shutting down...");
                            lifecycle.detach(&handle);
                            return;
                        }
                        warning = handle.next_warning() => match warning {
                            Some(w) => log::warn!("Feed '{}' warning: {}", topic, w),
                            // The pump stopped: the feed closed underneath us.
                            None => break,
                        }
                    }
                }
                lifecycle.detach(&handle);
                log::warn!("Feed '{}' closed. Reconnecting in {:?}...", topic, reconnect_delay);
            }
            Err(e) => {
                log::error!("Failed to attach '{}': {}. Retrying in {:?}...", topic, e, reconnect_delay);
            }
        }

        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Upstream shutting down...");
                return;
            }
            _ = sleep(reconnect_delay) => {}
        }
    }
}
