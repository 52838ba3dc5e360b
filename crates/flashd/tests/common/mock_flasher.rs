//! Scripted stand-in for the vendor flashing tool.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use flashd::flasher::{
    CancelSignal, FlashErrorKind, FlashOutcome, FlashProgress, FlashRequest, FlashResult,
    Flasher, ProgressReporter,
};

/// What the mock does for one port.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { after: Duration },
    Fail { after: Duration, kind: FlashErrorKind },
    Panic,
    /// Runs until cancelled.
    Hang,
}

impl Behavior {
    pub fn quick() -> Self {
        Behavior::Succeed {
            after: Duration::from_millis(20),
        }
    }

    pub fn slow(ms: u64) -> Self {
        Behavior::Succeed {
            after: Duration::from_millis(ms),
        }
    }
}

pub struct MockFlasher {
    default: Behavior,
    per_port: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<FlashRequest>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the running count even when the flash panics.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockFlasher {
    pub fn new(default: Behavior) -> Self {
        Self {
            default,
            per_port: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, port_path: &str, behavior: Behavior) {
        self.per_port
            .lock()
            .unwrap()
            .insert(port_path.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<FlashRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of flashes observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, port_path: &str) -> Behavior {
        self.per_port
            .lock()
            .unwrap()
            .get(port_path)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl Flasher for MockFlasher {
    async fn flash(
        &self,
        request: &FlashRequest,
        mut cancel: CancelSignal,
        progress: Arc<dyn ProgressReporter>,
    ) -> FlashResult {
        let started = Instant::now();
        let behavior = self.behavior_for(&request.port_path);
        self.calls.lock().unwrap().push(request.clone());

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        progress.report(
            &request.job_id,
            FlashProgress::Connected {
                chip: "ESP32-D0WD-V3".to_string(),
            },
        );

        let (after, failure) = match behavior {
            Behavior::Panic => panic!("simulated flasher crash on {}", request.port_path),
            Behavior::Hang => (Duration::from_secs(3600), None),
            Behavior::Succeed { after } => (after, None),
            Behavior::Fail { after, kind } => (after, Some(kind)),
        };

        tokio::select! {
            _ = tokio::time::sleep(after) => {}
            _ = cancel.cancelled() => {
                return FlashResult {
                    outcome: FlashOutcome::Cancelled,
                    output: vec!["cancelled".to_string()],
                    detected_chip: None,
                    mac_address: None,
                    duration: started.elapsed(),
                };
            }
        }

        progress.report(&request.job_id, FlashProgress::Writing { percent: 100 });

        match failure {
            Some(kind) => {
                let mut result = FlashResult::failed(
                    kind,
                    format!("simulated {} on {}", kind, request.port_path),
                    started.elapsed(),
                );
                result.output = vec!["A fatal error occurred".to_string()];
                result
            }
            None => FlashResult {
                outcome: FlashOutcome::Succeeded,
                output: vec![
                    "Chip is ESP32-D0WD-V3 (revision 3)".to_string(),
                    "MAC: 24:0a:c4:00:00:01".to_string(),
                    "Hash of data verified.".to_string(),
                ],
                detected_chip: Some("ESP32-D0WD-V3".to_string()),
                mac_address: Some("24:0a:c4:00:00:01".to_string()),
                duration: started.elapsed(),
            },
        }
    }
}
