//! Hotplug source: a restartable stream of serial connect/disconnect events.
//!
//! Two strategies feed the same [`PortTracker`] diff: filesystem
//! notifications on the device directory that trigger a re-enumeration,
//! and plain periodic polling. `Auto` tries notifications and falls back
//! to polling when the watcher cannot be installed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, HotplugStrategy};
use crate::error::HotplugError;

pub mod diff;
pub mod enumerate;
mod poll;
mod watch;

pub use diff::PortTracker;
pub use enumerate::{PortEnumerator, SerialPortEnumerator};

const EVENT_BUFFER: usize = 64;

/// Attributes of one serial port as seen during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port_path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// A port with no USB attributes.
    pub fn from_path(port_path: impl Into<String>) -> Self {
        Self {
            port_path: port_path.into(),
            vendor_id: None,
            product_id: None,
            serial_number: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotplugKind {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugEvent {
    pub kind: HotplugKind,
    pub port: PortInfo,
}

impl HotplugEvent {
    pub fn connect(port: PortInfo) -> Self {
        Self {
            kind: HotplugKind::Connect,
            port,
        }
    }

    pub fn disconnect(port: PortInfo) -> Self {
        Self {
            kind: HotplugKind::Disconnect,
            port,
        }
    }
}

/// Receiving end of a running hotplug source. Dropping it stops the
/// background task.
pub struct HotplugStream {
    rx: mpsc::Receiver<HotplugEvent>,
    task: Option<JoinHandle<()>>,
}

impl HotplugStream {
    /// Wraps a caller-fed channel, for embedders with their own event source.
    pub fn from_receiver(rx: mpsc::Receiver<HotplugEvent>) -> Self {
        Self { rx, task: None }
    }

    /// Next event, or `None` once the source has stopped.
    pub async fn next(&mut self) -> Option<HotplugEvent> {
        self.rx.recv().await
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for HotplugStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Factory for [`HotplugStream`]s. Each [`start`](Self::start) begins from
/// an empty baseline, so already-attached ports are reported as connects.
pub struct HotplugSource {
    enumerator: Arc<dyn PortEnumerator>,
    strategy: HotplugStrategy,
    poll_interval: Duration,
    watch_dir: PathBuf,
}

impl HotplugSource {
    pub fn new(enumerator: Arc<dyn PortEnumerator>, config: &EngineConfig) -> Self {
        Self {
            enumerator,
            strategy: config.hotplug_strategy,
            poll_interval: config.poll_interval(),
            watch_dir: PathBuf::from("/dev"),
        }
    }

    /// Builds a source over the real serial ports using the configured patterns.
    pub fn from_config(config: &EngineConfig) -> Result<Self, HotplugError> {
        let enumerator = SerialPortEnumerator::new(&config.port_patterns)?;
        Ok(Self::new(Arc::new(enumerator), config))
    }

    pub fn with_watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = dir.into();
        self
    }

    pub fn with_strategy(mut self, strategy: HotplugStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<HotplugStream, HotplugError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let enumerator = self.enumerator.clone();

        let task = match self.strategy {
            HotplugStrategy::Poll => self.spawn_poll(enumerator, tx),
            HotplugStrategy::Notify => {
                let watcher = watch::DirWatcher::new(&self.watch_dir)?;
                self.spawn_watch(watcher, enumerator, tx)
            }
            HotplugStrategy::Auto => match watch::DirWatcher::new(&self.watch_dir) {
                Ok(watcher) => self.spawn_watch(watcher, enumerator, tx),
                Err(e) => {
                    log::warn!("Device notifications unavailable ({}), polling instead", e);
                    self.spawn_poll(enumerator, tx)
                }
            },
        };

        Ok(HotplugStream {
            rx,
            task: Some(task),
        })
    }

    fn spawn_poll(
        &self,
        enumerator: Arc<dyn PortEnumerator>,
        tx: mpsc::Sender<HotplugEvent>,
    ) -> JoinHandle<()> {
        log::info!("Polling for serial devices every {:?}", self.poll_interval);
        tokio::spawn(poll::run(enumerator, self.poll_interval, tx))
    }

    fn spawn_watch(
        &self,
        watcher: watch::DirWatcher,
        enumerator: Arc<dyn PortEnumerator>,
        tx: mpsc::Sender<HotplugEvent>,
    ) -> JoinHandle<()> {
        log::info!("Watching {} for serial devices", self.watch_dir.display());
        tokio::spawn(watch::run(watcher, enumerator, self.poll_interval, tx))
    }
}

/// Currently attached ports, sorted by path.
pub fn scan_ports(enumerator: &dyn PortEnumerator) -> Result<Vec<PortInfo>, HotplugError> {
    let mut ports = enumerator.enumerate()?;
    ports.sort_by(|a, b| a.port_path.cmp(&b.port_path));
    Ok(ports)
}

/// Enumerates on the blocking pool. Errors are logged and yield `None`.
async fn enumerate_blocking(enumerator: &Arc<dyn PortEnumerator>) -> Option<Vec<PortInfo>> {
    let enumerator = enumerator.clone();
    match tokio::task::spawn_blocking(move || enumerator.enumerate()).await {
        Ok(Ok(ports)) => Some(ports),
        Ok(Err(e)) => {
            log::warn!("Serial port enumeration failed: {}", e);
            None
        }
        Err(e) => {
            log::error!("Enumeration task failed: {}", e);
            None
        }
    }
}

/// Diffs and forwards one enumeration. Returns `false` once the receiver is gone.
async fn publish(
    tracker: &mut PortTracker,
    ports: Vec<PortInfo>,
    tx: &mpsc::Sender<HotplugEvent>,
) -> bool {
    for event in tracker.observe(ports) {
        log::debug!("Hotplug {:?} {}", event.kind, event.port.port_path);
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}
