//! Flasher adapter: runs the vendor tool for one device and reports a
//! domain-level result.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub mod esptool;
pub mod output;

pub use esptool::EsptoolFlasher;

/// Everything the tool needs for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    pub job_id: String,
    pub port_path: String,
    pub firmware_path: PathBuf,
    pub offset: u32,
    pub baud_rate: u32,
    pub chip_type: String,
    pub verify: bool,
    /// Erase the whole chip before writing.
    pub erase: bool,
}

/// Classified reason for a failed flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashErrorKind {
    SyncFailure,
    PermissionDenied,
    Timeout,
    FirmwareNotFound,
    Unknown,
}

impl FlashErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashErrorKind::SyncFailure => "sync_failure",
            FlashErrorKind::PermissionDenied => "permission_denied",
            FlashErrorKind::Timeout => "timeout",
            FlashErrorKind::FirmwareNotFound => "firmware_not_found",
            FlashErrorKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_failure" => Some(FlashErrorKind::SyncFailure),
            "permission_denied" => Some(FlashErrorKind::PermissionDenied),
            "timeout" => Some(FlashErrorKind::Timeout),
            "firmware_not_found" => Some(FlashErrorKind::FirmwareNotFound),
            "unknown" => Some(FlashErrorKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for FlashErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    Succeeded,
    Failed { kind: FlashErrorKind, detail: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FlashResult {
    pub outcome: FlashOutcome,
    /// Captured stdout and stderr lines, interleaved in arrival order.
    pub output: Vec<String>,
    pub detected_chip: Option<String>,
    pub mac_address: Option<String>,
    pub duration: Duration,
}

impl FlashResult {
    pub fn failed(kind: FlashErrorKind, detail: impl Into<String>, duration: Duration) -> Self {
        Self {
            outcome: FlashOutcome::Failed {
                kind,
                detail: detail.into(),
            },
            output: Vec::new(),
            detected_chip: None,
            mac_address: None,
            duration,
        }
    }
}

/// Progress milestones parsed from tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlashProgress {
    Connected { chip: String },
    Writing { percent: u8 },
    Verifying,
}

/// Receives progress milestones while a flash runs.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, job_id: &str, progress: FlashProgress);
}

/// Discards progress.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _job_id: &str, _progress: FlashProgress) {}
}

/// Trigger side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observer side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancellation is requested. Pends forever if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

/// Executes one flash. Implementations never return an error: every
/// failure mode is a [`FlashOutcome`].
#[async_trait]
pub trait Flasher: Send + Sync {
    async fn flash(
        &self,
        request: &FlashRequest,
        cancel: CancelSignal,
        progress: Arc<dyn ProgressReporter>,
    ) -> FlashResult;
}
