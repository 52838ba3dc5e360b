use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::{enumerate_blocking, publish, HotplugEvent, PortEnumerator, PortTracker};

/// Enumerates every `interval` until the receiver is dropped.
pub(super) async fn run(
    enumerator: Arc<dyn PortEnumerator>,
    interval: Duration,
    tx: mpsc::Sender<HotplugEvent>,
) {
    let mut tracker = PortTracker::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tx.closed() => break,
        }

        let Some(ports) = enumerate_blocking(&enumerator).await else {
            continue;
        };
        if !publish(&mut tracker, ports, &tx).await {
            break;
        }
    }

    log::debug!("Hotplug poller stopped");
}
