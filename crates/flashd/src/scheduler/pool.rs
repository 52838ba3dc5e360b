//! Worker tasks that pull pending jobs and drive them to a terminal state.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info_span, Instrument};

use super::{FlashJob, Inner};
use crate::broadcast::{JobEventTracker, JobPhase, JobStatus};
use crate::device::{DeviceIdentity, DeviceRegistry, DeviceState};
use crate::flasher::{
    cancel_pair, CancelSignal, FlashErrorKind, FlashProgress, FlashResult, ProgressReporter,
};
use crate::metrics::MetricsRecord;

struct Work {
    job: FlashJob,
    tracker: JobEventTracker,
    cancel: CancelSignal,
    device_missing: bool,
}

pub(super) async fn run_worker(worker_id: usize, inner: Arc<Inner>) {
    log::debug!("Flash worker {} started", worker_id);

    loop {
        let notified = inner.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if inner.is_shutdown() {
            break;
        }

        match next_job(&inner) {
            Some(work) => execute(&inner, work).await,
            None => notified.await,
        }
    }

    log::debug!("Flash worker {} stopped", worker_id);
}

/// Pops the oldest pending job and marks it running.
fn next_job(inner: &Inner) -> Option<Work> {
    let mut state = inner.lock_state();

    while let Some(job_id) = state.queue.pop_front() {
        let identity = match state.jobs.get(&job_id) {
            Some(entry) if entry.job.status == JobStatus::Pending => {
                entry.job.device_identity.clone()
            }
            _ => continue,
        };
        // The device may have moved to another port since submission.
        let device = inner.registry.resolve(&identity).ok();

        let Some(entry) = state.jobs.get_mut(&job_id) else {
            continue;
        };
        entry.job.status = JobStatus::Running;
        entry.job.started_at = Some(Utc::now());
        if let Some(device) = &device {
            entry.job.port_path = device.port_path.clone();
            entry.job.device_instance = device.instance;
        }

        let (handle, signal) = cancel_pair();
        let work = Work {
            job: entry.job.clone(),
            tracker: entry.tracker.clone(),
            cancel: signal,
            device_missing: device.is_none(),
        };
        state.running.insert(job_id, handle);
        return Some(work);
    }

    None
}

async fn execute(inner: &Arc<Inner>, work: Work) {
    let Work {
        mut job,
        tracker,
        cancel,
        device_missing,
    } = work;

    let span = info_span!(
        "flash_job",
        job_id = %job.job_id,
        identity = %job.device_identity,
        port = %job.port_path
    );

    async move {
        if device_missing {
            log::warn!(
                "Device {} disconnected before job {} started",
                job.device_identity,
                job.job_id
            );
            job.fail(
                FlashErrorKind::Unknown,
                "Device disconnected before flashing started",
            );
            settle(inner, job, &tracker).await;
            return;
        }

        let started = Instant::now();
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        inner
            .registry
            .mark(&job.device_identity, job.device_instance, DeviceState::Flashing);
        tracker.update(JobStatus::Running, JobPhase::Connecting, "Connecting to device");

        let reporter: Arc<dyn ProgressReporter> = Arc::new(JobProgress {
            tracker: tracker.clone(),
            registry: Arc::clone(&inner.registry),
            identity: job.device_identity.clone(),
            instance: job.device_instance,
        });
        let request = job.request();
        let flasher = Arc::clone(&inner.flasher);
        let handle = tokio::spawn(
            async move { flasher.flash(&request, cancel, reporter).await }.in_current_span(),
        );

        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                log::error!("Flasher panicked for job {}: {}", job.job_id, message);
                FlashResult::failed(
                    FlashErrorKind::Unknown,
                    format!("Flasher panicked: {}", message),
                    started.elapsed(),
                )
            }
            Err(e) => FlashResult::failed(
                FlashErrorKind::Unknown,
                format!("Flash task aborted: {}", e),
                started.elapsed(),
            ),
        };

        job.complete(&result);
        match &job.error_detail {
            None => log::info!(
                "Job {} on {} finished: {} in {:?}",
                job.job_id,
                job.port_path,
                job.status,
                result.duration
            ),
            Some(detail) => log::warn!(
                "Job {} on {} failed: {}",
                job.job_id,
                job.port_path,
                detail
            ),
        }

        if let Some(writer) = &inner.session_logs {
            match writer.write(&job.port_path, &job.job_id, started_at, &result.output) {
                Ok(path) => job.session_log = Some(path),
                Err(e) => log::warn!("Failed to write session log for {}: {}", job.job_id, e),
            }
        }

        settle(inner, job, &tracker).await;
    }
    .instrument(span)
    .await
}

/// Records a terminal job: metrics first, then the device state, then the
/// job status and lock release, then the terminal event.
pub(super) async fn settle(inner: &Inner, job: FlashJob, tracker: &JobEventTracker) {
    record_metrics(inner, job.to_metrics_record()).await;

    let device_state = match job.status {
        JobStatus::Succeeded => DeviceState::Succeeded,
        JobStatus::Failed => DeviceState::Failed,
        _ => DeviceState::Idle,
    };
    inner
        .registry
        .mark(&job.device_identity, job.device_instance, device_state);

    {
        let mut state = inner.lock_state();
        state.running.remove(&job.job_id);
        if state.locked.get(&job.device_identity) == Some(&job.job_id) {
            state.locked.remove(&job.device_identity);
        }
        tracker.finished(job.status, job.error_detail.as_deref());
        let job_id = job.job_id.clone();
        if let Some(entry) = state.jobs.get_mut(&job_id) {
            entry.job = job;
            state.retire(job_id, inner.job_history_limit);
        }
    }

    inner.settled.notify_waiters();
}

/// Appends with bounded exponential backoff. A record that cannot be
/// stored is logged and dropped; the job outcome stands.
async fn record_metrics(inner: &Inner, record: MetricsRecord) {
    let attempts = inner.retry.attempts.max(1);

    for attempt in 1..=attempts {
        let store = inner.metrics.clone();
        let pending = record.clone();
        match tokio::task::spawn_blocking(move || store.append(&pending)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) if !e.is_retryable() => {
                log::error!("Dropping metrics for job {}: {}", record.job_id, e);
                return;
            }
            Ok(Err(e)) => log::warn!(
                "Metrics write for job {} failed (attempt {}/{}): {}",
                record.job_id,
                attempt,
                attempts,
                e
            ),
            Err(e) => log::warn!("Metrics write task for job {} failed: {}", record.job_id, e),
        }

        if attempt < attempts {
            tokio::time::sleep(inner.retry.delay_for(attempt)).await;
        }
    }

    log::error!(
        "Giving up on metrics for job {} after {} attempts",
        record.job_id,
        attempts
    );
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forwards flasher milestones to job events and the device record.
struct JobProgress {
    tracker: JobEventTracker,
    registry: Arc<DeviceRegistry>,
    identity: DeviceIdentity,
    instance: u64,
}

impl ProgressReporter for JobProgress {
    fn report(&self, _job_id: &str, progress: FlashProgress) {
        match progress {
            FlashProgress::Connected { chip } => self.tracker.update(
                JobStatus::Running,
                JobPhase::Connecting,
                &format!("Connected to {}", chip),
            ),
            FlashProgress::Writing { percent } => self.tracker.writing(percent),
            FlashProgress::Verifying => {
                self.registry
                    .mark(&self.identity, self.instance, DeviceState::Verifying);
                self.tracker
                    .update(JobStatus::Running, JobPhase::Verifying, "Verifying flash");
            }
        }
    }
}
