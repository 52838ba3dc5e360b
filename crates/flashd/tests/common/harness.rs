//! Test harness wiring a scheduler to a mock or scripted flasher.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use flashd::broadcast::JobEventBroadcaster;
use flashd::config::EngineConfig;
use flashd::device::{Device, DeviceIdentity, DeviceRegistry};
use flashd::flasher::Flasher;
use flashd::metrics::MetricsStore;
use flashd::scheduler::{FirmwareReference, FlashJob, Scheduler};

use super::builders::{connect, disconnect, ConfigBuilder};
use super::mock_flasher::{Behavior, MockFlasher};

/// Isolated engine: temp directory, firmware image, registry, in-memory
/// metrics and a running scheduler.
pub struct EngineHarness<F = MockFlasher> {
    temp_dir: TempDir,
    pub config: EngineConfig,
    pub firmware: FirmwareReference,
    pub registry: Arc<DeviceRegistry>,
    pub flasher: Arc<F>,
    pub metrics: MetricsStore,
    pub scheduler: Scheduler,
}

impl EngineHarness {
    pub fn new(max_workers: usize) -> Self {
        Self::with_builder(ConfigBuilder::new().max_workers(max_workers), Behavior::quick())
    }

    pub fn with_behavior(max_workers: usize, default: Behavior) -> Self {
        Self::with_builder(ConfigBuilder::new().max_workers(max_workers), default)
    }

    /// Must be called inside a tokio runtime.
    pub fn with_builder(builder: ConfigBuilder, default: Behavior) -> Self {
        EngineHarness::with_flasher(builder, MockFlasher::new(default))
    }
}

impl<F: Flasher + 'static> EngineHarness<F> {
    /// Runs the scheduler against any flasher, e.g. a real `EsptoolFlasher`.
    pub fn with_flasher(builder: ConfigBuilder, flasher: F) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let firmware_path = temp_dir.path().join("firmware.bin");
        std::fs::write(&firmware_path, b"\xe9\x03\x02\x20firmware-image")
            .expect("Failed to write firmware");

        let config = builder.firmware_path(&firmware_path).build();
        let firmware = FirmwareReference::from_path(&firmware_path).expect("firmware reference");
        let registry =
            Arc::new(DeviceRegistry::new().with_history_limit(config.device_history_limit));
        let flasher = Arc::new(flasher);
        let metrics = MetricsStore::open_in_memory().expect("metrics store");
        let scheduler = Scheduler::new(
            &config,
            Arc::clone(&registry),
            flasher.clone() as Arc<dyn Flasher>,
            metrics.clone(),
            JobEventBroadcaster::default(),
        );

        Self {
            temp_dir,
            config,
            firmware,
            registry,
            flasher,
            metrics,
            scheduler,
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    pub fn firmware_path(&self) -> PathBuf {
        self.firmware.path.clone()
    }

    /// Plugs in a device and returns its registry record.
    pub fn plug(&self, path: &str, serial: &str) -> Device {
        self.registry.upsert(&connect(path, serial))
    }

    pub fn unplug(&self, path: &str, serial: &str) -> Option<Device> {
        self.registry.remove(&disconnect(path, serial))
    }

    /// Plugs in `count` devices on `/dev/ttyUSB<n>` with serials `SN<n>`.
    pub fn plug_many(&self, count: usize) -> Vec<DeviceIdentity> {
        (0..count)
            .map(|n| {
                self.plug(&format!("/dev/ttyUSB{}", n), &format!("SN{:04}", n))
                    .identity
            })
            .collect()
    }

    pub fn submit(&self, identity: &DeviceIdentity) -> String {
        self.scheduler
            .submit(identity, &self.firmware, &Default::default())
            .expect("submit")
    }

    /// Waits for a job with a generous upper bound.
    pub async fn wait(&self, job_id: &str) -> FlashJob {
        tokio::time::timeout(Duration::from_secs(10), self.scheduler.wait(job_id))
            .await
            .expect("job did not finish in time")
            .expect("job exists")
    }

    /// Polls the scheduler until `running` jobs are in flight.
    pub async fn until_running(&self, running: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.scheduler.snapshot().running < running {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} running jobs, snapshot {:?}",
                running,
                self.scheduler.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
