use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::{enumerate_blocking, publish, HotplugEvent, PortEnumerator, PortTracker};
use crate::error::HotplugError;

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Filesystem watch on the device directory. Each debounced batch of
/// changes becomes one rescan trigger.
pub(super) struct DirWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    triggers: mpsc::UnboundedReceiver<()>,
}

impl DirWatcher {
    pub(super) fn new(dir: &Path) -> Result<Self, HotplugError> {
        let watch_err = |e: notify::Error| HotplugError::Watch {
            path: PathBuf::from(dir),
            source: e,
        };

        let (tx, triggers) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(DEBOUNCE, move |res: DebounceEventResult| match res {
            Ok(events) => {
                if !events.is_empty() {
                    let _ = tx.send(());
                }
            }
            Err(e) => log::warn!("Device watch error: {:?}", e),
        })
        .map_err(watch_err)?;

        debouncer
            .watcher()
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(watch_err)?;

        Ok(Self {
            _debouncer: debouncer,
            triggers,
        })
    }
}

/// Rescans on every trigger, and every `rescan` as a safety net for
/// platforms where device nodes change without a notification.
pub(super) async fn run(
    mut watcher: DirWatcher,
    enumerator: Arc<dyn PortEnumerator>,
    rescan: Duration,
    tx: mpsc::Sender<HotplugEvent>,
) {
    let mut tracker = PortTracker::new();
    let mut ticker = tokio::time::interval(rescan);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            trigger = watcher.triggers.recv() => {
                if trigger.is_none() {
                    log::warn!("Device watcher stopped");
                    break;
                }
            }
            _ = tx.closed() => break,
        }

        let Some(ports) = enumerate_blocking(&enumerator).await else {
            continue;
        };
        if !publish(&mut tracker, ports, &tx).await {
            break;
        }
    }

    log::debug!("Hotplug watcher stopped");
}
