//! Job scheduler: bounded parallel execution of flash jobs with a
//! per-device exclusivity lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::broadcast::{JobEvent, JobEventBroadcaster, JobEventTracker, JobStatus};
use crate::config::{EngineConfig, MetricsRetryConfig};
use crate::device::{DeviceIdentity, DeviceRegistry, DeviceState};
use crate::error::EngineError;
use crate::flasher::{CancelHandle, Flasher};
use crate::metrics::MetricsStore;
use crate::storage::SessionLogWriter;

pub mod job;
mod pool;

pub use job::{BatchOutcome, FirmwareReference, FlashJob, FlashOptions, SchedulerSnapshot};
use job::JobDefaults;

struct JobEntry {
    job: FlashJob,
    tracker: JobEventTracker,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    /// Pending job ids in submission order.
    queue: VecDeque<String>,
    /// Cancel handles of running jobs.
    running: HashMap<String, CancelHandle>,
    /// Exclusivity lock: identity → job holding it.
    locked: HashMap<DeviceIdentity, String>,
    /// Terminal job ids in settlement order.
    finished: VecDeque<String>,
}

impl SchedulerState {
    /// Marks a job as finished and forgets the oldest finished jobs
    /// beyond `limit`.
    fn retire(&mut self, job_id: String, limit: usize) {
        self.finished.push_back(job_id);
        while self.finished.len() > limit {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }
}

struct Inner {
    state: Mutex<SchedulerState>,
    /// Signalled when work is queued or on shutdown.
    wake: Notify,
    /// Signalled whenever a job reaches a terminal state.
    settled: Notify,
    registry: Arc<DeviceRegistry>,
    flasher: Arc<dyn Flasher>,
    metrics: MetricsStore,
    events: JobEventBroadcaster,
    defaults: JobDefaults,
    retry: MetricsRetryConfig,
    job_history_limit: usize,
    session_logs: Option<SessionLogWriter>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Scheduler state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Accepts flash requests and runs them on `max_workers` tokio tasks.
///
/// Cloning shares the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Starts the worker tasks. Must be called inside a tokio runtime.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<DeviceRegistry>,
        flasher: Arc<dyn Flasher>,
        metrics: MetricsStore,
        events: JobEventBroadcaster,
    ) -> Self {
        let worker_count = config.max_workers.max(1);
        let inner = Arc::new(Inner {
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
            settled: Notify::new(),
            registry,
            flasher,
            metrics,
            events,
            defaults: JobDefaults::from(config),
            retry: config.metrics_retry.clone(),
            job_history_limit: config.job_history_limit.max(1),
            session_logs: config.session_log_dir.as_ref().map(SessionLogWriter::new),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker_id| tokio::spawn(pool::run_worker(worker_id, Arc::clone(&inner))))
            .collect();
        match inner.workers.lock() {
            Ok(mut workers) => workers.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }

        log::info!("Started {} flash workers", worker_count);
        Self { inner }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.inner.metrics
    }

    /// Queues a flash for the live device with `identity`.
    ///
    /// Fails with `DeviceNotFound` when the device is not connected and
    /// with `Conflict` while another job for it is pending or running.
    pub fn submit(
        &self,
        identity: &DeviceIdentity,
        firmware: &FirmwareReference,
        options: &FlashOptions,
    ) -> Result<String, EngineError> {
        if self.inner.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        let device = self.inner.registry.resolve(identity)?;

        let mut state = self.inner.lock_state();
        if let Some(holder) = state.locked.get(identity) {
            return Err(EngineError::Conflict {
                identity: identity.to_string(),
                job_id: holder.clone(),
            });
        }

        let job = FlashJob::new(&device, firmware, options, &self.inner.defaults);
        let job_id = job.job_id.clone();
        let tracker = self
            .inner
            .events
            .start_job(&job_id, identity, &device.port_path);

        state.locked.insert(identity.clone(), job_id.clone());
        state.queue.push_back(job_id.clone());
        state.jobs.insert(job_id.clone(), JobEntry { job, tracker });
        self.inner
            .registry
            .mark(identity, device.instance, DeviceState::Queued);
        drop(state);

        log::info!("Queued job {} for {} on {}", job_id, identity, device.port_path);
        self.inner.wake.notify_one();
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<FlashJob, EngineError> {
        self.inner
            .lock_state()
            .jobs
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| EngineError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Resolves once the job is terminal.
    pub async fn wait(&self, job_id: &str) -> Result<FlashJob, EngineError> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self.status(job_id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    /// Cancels a job. Pending jobs are cancelled immediately; running jobs
    /// have their tool killed and this returns once they are terminal.
    /// Terminal jobs are returned unchanged.
    pub async fn cancel(&self, job_id: &str) -> Result<FlashJob, EngineError> {
        enum Action {
            Done(FlashJob),
            Pending(FlashJob, JobEventTracker),
            Running,
        }

        let action = {
            let mut state = self.inner.lock_state();
            let status = state
                .jobs
                .get(job_id)
                .map(|entry| entry.job.status)
                .ok_or_else(|| EngineError::JobNotFound {
                    job_id: job_id.to_string(),
                })?;

            match status {
                JobStatus::Pending => {
                    state.queue.retain(|id| id != job_id);
                    match state.jobs.get_mut(job_id) {
                        Some(entry) => {
                            entry.job.cancel_pending();
                            Action::Pending(entry.job.clone(), entry.tracker.clone())
                        }
                        None => {
                            return Err(EngineError::JobNotFound {
                                job_id: job_id.to_string(),
                            })
                        }
                    }
                }
                JobStatus::Running => {
                    if let Some(handle) = state.running.get(job_id) {
                        handle.cancel();
                    }
                    Action::Running
                }
                _ => match state.jobs.get(job_id) {
                    Some(entry) => Action::Done(entry.job.clone()),
                    None => {
                        return Err(EngineError::JobNotFound {
                            job_id: job_id.to_string(),
                        })
                    }
                },
            }
        };

        match action {
            Action::Done(job) => Ok(job),
            Action::Pending(job, tracker) => {
                log::info!("Cancelled pending job {}", job_id);
                pool::settle(&self.inner, job.clone(), &tracker).await;
                Ok(job)
            }
            Action::Running => {
                log::info!("Cancelling running job {}", job_id);
                self.wait(job_id).await
            }
        }
    }

    /// Cancels every pending and running job and waits until all of them
    /// are terminal. The queue is emptied in one step, so no pending job
    /// can reach a worker once this has started.
    pub async fn cancel_all(&self) -> Vec<FlashJob> {
        let (pending, running) = {
            let mut state = self.inner.lock_state();
            let queued: Vec<String> = state.queue.drain(..).collect();
            let mut pending = Vec::with_capacity(queued.len());
            for job_id in queued {
                if let Some(entry) = state.jobs.get_mut(&job_id) {
                    if entry.job.status == JobStatus::Pending {
                        entry.job.cancel_pending();
                        pending.push((entry.job.clone(), entry.tracker.clone()));
                    }
                }
            }
            for handle in state.running.values() {
                handle.cancel();
            }
            let running: Vec<String> = state.running.keys().cloned().collect();
            (pending, running)
        };

        if !pending.is_empty() || !running.is_empty() {
            log::info!(
                "Cancelling {} pending and {} running jobs",
                pending.len(),
                running.len()
            );
        }

        let mut finished = Vec::with_capacity(pending.len() + running.len());
        for (job, tracker) in pending {
            pool::settle(&self.inner, job.clone(), &tracker).await;
            finished.push(job);
        }
        for job_id in running {
            match self.wait(&job_id).await {
                Ok(job) => finished.push(job),
                Err(e) => log::warn!("Failed to cancel job {}: {}", job_id, e),
            }
        }
        finished
    }

    /// Outstanding jobs plus the most recent `job_history_limit` finished
    /// ones, oldest submission first.
    pub fn jobs(&self) -> Vec<FlashJob> {
        let mut jobs: Vec<FlashJob> = self
            .inner
            .lock_state()
            .jobs
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.inner.lock_state();
        let mut snapshot = SchedulerSnapshot {
            queue_depth: state.queue.len(),
            ..Default::default()
        };
        for entry in state.jobs.values() {
            match entry.job.status {
                JobStatus::Pending => snapshot.pending += 1,
                JobStatus::Running => snapshot.running += 1,
                JobStatus::Succeeded => snapshot.succeeded += 1,
                JobStatus::Failed => snapshot.failed += 1,
                JobStatus::Cancelled => snapshot.cancelled += 1,
            }
        }
        snapshot
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Flashes every listed device in parallel and reports one outcome per
    /// device, in input order. Rejected submissions appear as errors.
    pub async fn flash_batch(
        &self,
        identities: &[DeviceIdentity],
        firmware: &FirmwareReference,
        options: &FlashOptions,
    ) -> Vec<BatchOutcome> {
        let submitted: Vec<(DeviceIdentity, Result<String, EngineError>)> = identities
            .iter()
            .map(|identity| (identity.clone(), self.submit(identity, firmware, options)))
            .collect();

        let mut outcomes = Vec::with_capacity(submitted.len());
        for (identity, submission) in submitted {
            let result = match submission {
                Ok(job_id) => self.wait(&job_id).await,
                Err(e) => {
                    log::warn!("Batch flash skipped {}: {}", identity, e);
                    Err(e)
                }
            };
            outcomes.push(BatchOutcome { identity, result });
        }

        let ok = outcomes.iter().filter(|o| o.succeeded()).count();
        log::info!("Batch flash finished: {}/{} succeeded", ok, outcomes.len());
        outcomes
    }

    /// [`flash_batch`](Self::flash_batch) over every connected device.
    pub async fn flash_all_active(
        &self,
        firmware: &FirmwareReference,
        options: &FlashOptions,
    ) -> Vec<BatchOutcome> {
        let identities: Vec<DeviceIdentity> = self
            .inner
            .registry
            .active()
            .into_iter()
            .map(|device| device.identity)
            .collect();
        if identities.is_empty() {
            log::warn!("No connected devices to flash");
        }
        self.flash_batch(&identities, firmware, options).await
    }

    /// Rejects new submissions, cancels outstanding work and stops the workers.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down scheduler...");

        self.cancel_all().await;
        self.inner.wake.notify_waiters();

        let workers: Vec<JoinHandle<()>> = match self.inner.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                log::error!("Flash worker {} ended abnormally: {}", i, e);
            }
        }
        // Anything queued after the first sweep never reached a worker.
        self.cancel_all().await;
        log::info!("All flash workers have stopped");
    }
}
