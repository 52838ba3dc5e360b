//! Flash job model.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::broadcast::JobStatus;
use crate::config::EngineConfig;
use crate::device::{Device, DeviceIdentity};
use crate::error::EngineError;
use crate::flasher::{FlashErrorKind, FlashOutcome, FlashRequest, FlashResult};
use crate::metrics::MetricsRecord;

/// Firmware image path plus the SHA-256 of its content at reference time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareReference {
    pub path: PathBuf,
    pub sha256: String,
}

impl FirmwareReference {
    /// Reads the image once to fingerprint it.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| EngineError::Firmware {
            path: path.to_path_buf(),
            source: e,
        })?;
        let digest = Sha256::digest(&bytes);
        Ok(Self {
            path: path.to_path_buf(),
            sha256: format!("{:x}", digest),
        })
    }
}

/// Per-request overrides. Unset fields come from [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    pub offset: Option<u32>,
    pub baud_rate: Option<u32>,
    pub chip_type: Option<String>,
    pub verify: Option<bool>,
    pub erase: Option<bool>,
}

/// Configured defaults the options resolve against.
#[derive(Debug, Clone)]
pub(crate) struct JobDefaults {
    pub offset: u32,
    pub baud_rate: u32,
    pub chip_type: String,
    pub verify: bool,
    pub erase: bool,
}

impl From<&EngineConfig> for JobDefaults {
    fn from(config: &EngineConfig) -> Self {
        Self {
            offset: config.flash_offset,
            baud_rate: config.baud_rate,
            chip_type: config.chip_type.clone(),
            verify: config.verify,
            erase: config.erase_before_flash,
        }
    }
}

/// One request to flash one device with one image.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashJob {
    pub job_id: String,
    pub device_identity: DeviceIdentity,
    pub device_instance: u64,
    /// Port the job was submitted for, updated to the port it started on.
    pub port_path: String,
    pub firmware: FirmwareReference,
    pub offset: u32,
    pub baud_rate: u32,
    pub verify: bool,
    pub erase: bool,
    pub chip_type: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FlashErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_chip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_log: Option<PathBuf>,
}

impl FlashJob {
    pub(crate) fn new(
        device: &Device,
        firmware: &FirmwareReference,
        options: &FlashOptions,
        defaults: &JobDefaults,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            device_identity: device.identity.clone(),
            device_instance: device.instance,
            port_path: device.port_path.clone(),
            firmware: firmware.clone(),
            offset: options.offset.unwrap_or(defaults.offset),
            baud_rate: options.baud_rate.unwrap_or(defaults.baud_rate),
            verify: options.verify.unwrap_or(defaults.verify),
            erase: options.erase.unwrap_or(defaults.erase),
            chip_type: options
                .chip_type
                .clone()
                .unwrap_or_else(|| defaults.chip_type.clone()),
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_kind: None,
            error_detail: None,
            detected_chip: None,
            mac_address: None,
            session_log: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn request(&self) -> FlashRequest {
        FlashRequest {
            job_id: self.job_id.clone(),
            port_path: self.port_path.clone(),
            firmware_path: self.firmware.path.clone(),
            offset: self.offset,
            baud_rate: self.baud_rate,
            chip_type: self.chip_type.clone(),
            verify: self.verify,
            erase: self.erase,
        }
    }

    /// Time spent running; zero for jobs that never started.
    pub fn duration(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Moves the job into its terminal state from a flasher result.
    pub(crate) fn complete(&mut self, result: &FlashResult) {
        match &result.outcome {
            FlashOutcome::Succeeded => self.status = JobStatus::Succeeded,
            FlashOutcome::Failed { kind, detail } => {
                self.status = JobStatus::Failed;
                self.error_kind = Some(*kind);
                self.error_detail = Some(detail.clone());
            }
            FlashOutcome::Cancelled => self.status = JobStatus::Cancelled,
        }
        self.detected_chip = result.detected_chip.clone();
        self.mac_address = result.mac_address.clone();
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn cancel_pending(&mut self) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, kind: FlashErrorKind, detail: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_kind = Some(kind);
        self.error_detail = Some(detail.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn to_metrics_record(&self) -> MetricsRecord {
        MetricsRecord::new(
            self.job_id.clone(),
            self.device_identity.clone(),
            self.chip_type.clone(),
            u64::try_from(self.duration().as_millis()).unwrap_or(u64::MAX),
            self.status,
            self.error_detail.clone(),
            self.finished_at.unwrap_or_else(Utc::now),
        )
        .with_error_kind(self.error_kind)
        .with_mac_address(self.mac_address.clone())
        .with_firmware(
            self.firmware.path.to_string_lossy(),
            self.firmware.sha256.clone(),
        )
        .with_session_log(
            self.session_log
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
    }
}

/// Per-device result of a batch request.
#[derive(Debug)]
pub struct BatchOutcome {
    pub identity: DeviceIdentity,
    pub result: Result<FlashJob, EngineError>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(job) if job.status == JobStatus::Succeeded)
    }
}

/// Job counts at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
}

impl SchedulerSnapshot {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}
