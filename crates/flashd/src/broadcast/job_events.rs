//! Job event broadcaster for real-time flash status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::device::DeviceIdentity;

/// Fine-grained phase of a flash job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Connecting,
    Writing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "Queued"),
            JobPhase::Connecting => write!(f, "Connecting"),
            JobPhase::Writing => write!(f, "Writing"),
            JobPhase::Verifying => write!(f, "Verifying"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
            JobPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Status of a flash job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub identity: DeviceIdentity,
    pub port_path: String,
    pub status: JobStatus,
    pub phase: JobPhase,
    /// Write progress in percent, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new(
        job_id: &str,
        identity: &DeviceIdentity,
        port_path: &str,
        status: JobStatus,
        phase: JobPhase,
        message: &str,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            identity: identity.clone(),
            port_path: port_path.to_string(),
            status,
            phase,
            progress: None,
            message: message.to_string(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one job and announces it as queued.
    pub fn start_job(
        &self,
        job_id: &str,
        identity: &DeviceIdentity,
        port_path: &str,
    ) -> JobEventTracker {
        let tracker = JobEventTracker {
            job_id: job_id.to_string(),
            identity: identity.clone(),
            port_path: port_path.to_string(),
            sender: Arc::clone(&self.sender),
        };
        tracker.update(JobStatus::Pending, JobPhase::Queued, "Job queued");
        tracker
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Emits events for a single job.
#[derive(Clone)]
pub struct JobEventTracker {
    job_id: String,
    identity: DeviceIdentity,
    port_path: String,
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventTracker {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn event(&self, status: JobStatus, phase: JobPhase, message: &str) -> JobEvent {
        JobEvent::new(
            &self.job_id,
            &self.identity,
            &self.port_path,
            status,
            phase,
            message,
        )
    }

    pub fn update(&self, status: JobStatus, phase: JobPhase, message: &str) {
        let _ = self.sender.send(self.event(status, phase, message));
    }

    pub fn writing(&self, percent: u8) {
        let mut event = self.event(JobStatus::Running, JobPhase::Writing, "Writing firmware");
        event.progress = Some(percent);
        let _ = self.sender.send(event);
    }

    /// Terminal event. `error` is carried only for failures.
    pub fn finished(&self, status: JobStatus, error: Option<&str>) {
        let (phase, message) = match status {
            JobStatus::Succeeded => (JobPhase::Completed, "Flash completed"),
            JobStatus::Cancelled => (JobPhase::Cancelled, "Flash cancelled"),
            _ => (JobPhase::Failed, "Flash failed"),
        };
        let mut event = self.event(status, phase, message);
        event.error = error.map(str::to_string);
        let _ = self.sender.send(event);
    }
}
