//! Monitor loop: flashes devices automatically as they are plugged in.
//!
//! Each identity moves Idle → Submitting → Cooldown → Idle. A connect is
//! acted on only from Idle, so a board that re-enumerates right after a
//! flash is not flashed again until its cooldown has passed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::Instrument;

use crate::broadcast::JobEvent;
use crate::config::EngineConfig;
use crate::device::DeviceIdentity;
use crate::error::EngineError;
use crate::hotplug::{HotplugEvent, HotplugKind, HotplugStream};
use crate::scheduler::{FirmwareReference, FlashOptions, Scheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Submitting { job_id: String },
    Cooldown { until: Instant },
}

/// Per-identity admission state. Identities without a slot are idle.
#[derive(Debug, Default)]
struct Slots {
    slots: HashMap<DeviceIdentity, Slot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admit,
    Busy,
    CoolingDown,
}

impl Slots {
    fn admit(&mut self, identity: &DeviceIdentity, now: Instant) -> Admission {
        match self.slots.get(identity) {
            Some(Slot::Submitting { .. }) => Admission::Busy,
            Some(Slot::Cooldown { until }) if now < *until => Admission::CoolingDown,
            Some(Slot::Cooldown { .. }) => {
                self.slots.remove(identity);
                Admission::Admit
            }
            None => Admission::Admit,
        }
    }

    fn submitted(&mut self, identity: DeviceIdentity, job_id: String) {
        self.slots.insert(identity, Slot::Submitting { job_id });
    }

    /// Starts the cooldown if `job_id` is the job this identity waits on.
    fn finished(&mut self, identity: &DeviceIdentity, job_id: &str, until: Instant) -> bool {
        match self.slots.get(identity) {
            Some(Slot::Submitting { job_id: current }) if current == job_id => {
                self.slots
                    .insert(identity.clone(), Slot::Cooldown { until });
                true
            }
            _ => false,
        }
    }

    fn in_flight(&self) -> Vec<(DeviceIdentity, String)> {
        self.slots
            .iter()
            .filter_map(|(identity, slot)| match slot {
                Slot::Submitting { job_id } => Some((identity.clone(), job_id.clone())),
                Slot::Cooldown { .. } => None,
            })
            .collect()
    }
}

/// Counters for one [`Monitor::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub connects: usize,
    pub disconnects: usize,
    pub submitted: usize,
    /// Connects ignored because the identity was cooling down or busy.
    pub skipped: usize,
    /// Submissions the scheduler refused.
    pub rejected: usize,
    pub completed: usize,
}

/// Stops a running [`Monitor`] from another task.
#[derive(Clone)]
pub struct MonitorShutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl MonitorShutdown {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Monitor {
    scheduler: Scheduler,
    firmware_path: PathBuf,
    options: FlashOptions,
    cooldown: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Monitor {
    pub fn new(scheduler: Scheduler, config: &EngineConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            scheduler,
            firmware_path: config.firmware_path.clone(),
            options: FlashOptions::default(),
            cooldown: config.cooldown(),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn with_firmware(mut self, path: impl Into<PathBuf>) -> Self {
        self.firmware_path = path.into();
        self
    }

    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn shutdown_handle(&self) -> MonitorShutdown {
        MonitorShutdown {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Consumes `stream` until it ends or shutdown is triggered.
    ///
    /// Fails only when the firmware image cannot be read. Jobs still
    /// running when the loop stops are left to the scheduler.
    pub async fn run(&self, mut stream: HotplugStream) -> Result<MonitorReport, EngineError> {
        let firmware = FirmwareReference::from_path(&self.firmware_path)?;
        log::info!(
            "Monitor started with {} (sha256 {})",
            firmware.path.display(),
            &firmware.sha256[..12]
        );

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut events = self.scheduler.subscribe();
        let mut events_open = true;
        let mut slots = Slots::default();
        let mut report = MonitorReport::default();

        async {
            loop {
                if *shutdown.borrow_and_update() {
                    log::info!("Monitor shutdown requested");
                    break;
                }

                tokio::select! {
                    biased;

                    _ = shutdown.changed() => continue,

                    received = events.recv(), if events_open => match received {
                        Ok(event) => self.on_job_event(&event, &mut slots, &mut report),
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Monitor missed {} job events, polling job status", skipped);
                            self.poll_in_flight(&mut slots, &mut report);
                        }
                        Err(RecvError::Closed) => events_open = false,
                    },

                    hotplug = stream.next() => match hotplug {
                        Some(event) => {
                            if !self.on_hotplug(&event, &firmware, &mut slots, &mut report) {
                                break;
                            }
                        }
                        None => {
                            log::info!("Hotplug stream ended");
                            break;
                        }
                    },
                }
            }
        }
        .instrument(tracing::info_span!("monitor"))
        .await;

        stream.stop();
        log::info!(
            "Monitor stopped: {} submitted, {} completed, {} skipped, {} rejected",
            report.submitted,
            report.completed,
            report.skipped,
            report.rejected
        );
        Ok(report)
    }

    /// Returns `false` when the scheduler has shut down.
    fn on_hotplug(
        &self,
        event: &HotplugEvent,
        firmware: &FirmwareReference,
        slots: &mut Slots,
        report: &mut MonitorReport,
    ) -> bool {
        let registry = self.scheduler.registry();

        if event.kind == HotplugKind::Disconnect {
            report.disconnects += 1;
            // A running job is left alone; its tool will fail on its own.
            registry.apply(event);
            return true;
        }

        report.connects += 1;
        let Some(device) = registry.apply(event) else {
            return true;
        };

        match slots.admit(&device.identity, Instant::now()) {
            Admission::Admit => {}
            Admission::Busy => {
                log::debug!("{} already has a job in flight", device.identity);
                report.skipped += 1;
                return true;
            }
            Admission::CoolingDown => {
                log::info!("Skipping {}: cooling down after last flash", device.identity);
                report.skipped += 1;
                return true;
            }
        }

        match self
            .scheduler
            .submit(&device.identity, firmware, &self.options)
        {
            Ok(job_id) => {
                report.submitted += 1;
                slots.submitted(device.identity, job_id);
                true
            }
            Err(EngineError::Shutdown) => false,
            Err(e) => {
                log::warn!("Auto-flash of {} rejected: {}", device.identity, e);
                report.rejected += 1;
                true
            }
        }
    }

    fn on_job_event(&self, event: &JobEvent, slots: &mut Slots, report: &mut MonitorReport) {
        if !event.is_terminal() {
            return;
        }
        let until = Instant::now() + self.cooldown;
        if slots.finished(&event.identity, &event.job_id, until) {
            log::debug!("{} finished {} ({})", event.identity, event.job_id, event.status);
            report.completed += 1;
        }
    }

    fn poll_in_flight(&self, slots: &mut Slots, report: &mut MonitorReport) {
        let until = Instant::now() + self.cooldown;
        for (identity, job_id) in slots.in_flight() {
            match self.scheduler.status(&job_id) {
                Ok(job) if job.is_terminal() => {
                    if slots.finished(&identity, &job_id, until) {
                        report.completed += 1;
                    }
                }
                Ok(_) => {}
                // Only finished jobs are ever forgotten.
                Err(e) => {
                    log::debug!("Job {} no longer tracked ({}), treating as finished", job_id, e);
                    if slots.finished(&identity, &job_id, until) {
                        report.completed += 1;
                    }
                }
            }
        }
    }
}
