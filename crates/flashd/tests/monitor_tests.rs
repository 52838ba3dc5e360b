//! Auto-flash monitor driven by a channel-fed hotplug stream.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use flashd::broadcast::{JobEvent, JobStatus};
use flashd::config::HotplugStrategy;
use flashd::device::DeviceState;
use flashd::error::{EngineError, HotplugError};
use flashd::hotplug::{HotplugEvent, HotplugSource, HotplugStream, PortEnumerator, PortInfo};
use flashd::monitor::{Monitor, MonitorReport};

use common::{connect, disconnect, usb_port, Behavior, EngineHarness};

async fn next_terminal(events: &mut broadcast::Receiver<JobEvent>) -> JobEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no terminal event")
            .expect("event channel closed");
        if event.is_terminal() {
            return event;
        }
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Running {
    tx: mpsc::Sender<HotplugEvent>,
    task: tokio::task::JoinHandle<Result<MonitorReport, EngineError>>,
}

impl Running {
    async fn send(&self, event: HotplugEvent) {
        self.tx.send(event).await.expect("monitor stopped early");
    }

    async fn finish(self) -> MonitorReport {
        drop(self.tx);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("monitor did not stop")
            .expect("monitor task panicked")
            .expect("monitor failed")
    }
}

fn start(monitor: Monitor) -> Running {
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(async move { monitor.run(HotplugStream::from_receiver(rx)).await });
    Running { tx, task }
}

#[tokio::test]
async fn test_reconnect_within_cooldown_is_not_reflashed() {
    let harness = EngineHarness::new(2);
    let mut events = harness.scheduler.subscribe();
    let monitor = Monitor::new(harness.scheduler.clone(), &harness.config)
        .with_cooldown(Duration::from_millis(400));
    let running = start(monitor);

    running.send(connect("/dev/ttyUSB0", "SN0001")).await;
    let first = next_terminal(&mut events).await;
    assert_eq!(first.status, JobStatus::Succeeded);

    running.send(disconnect("/dev/ttyUSB0", "SN0001")).await;
    running.send(connect("/dev/ttyUSB0", "SN0001")).await;
    eventually("reconnect to register", || harness.registry.list().len() == 2).await;
    assert_eq!(harness.scheduler.jobs().len(), 1);

    tokio::time::sleep(Duration::from_millis(450)).await;
    running.send(disconnect("/dev/ttyUSB0", "SN0001")).await;
    running.send(connect("/dev/ttyUSB0", "SN0001")).await;
    let second = next_terminal(&mut events).await;
    assert_ne!(second.job_id, first.job_id);
    assert_eq!(harness.scheduler.jobs().len(), 2);

    let report = running.finish().await;
    assert_eq!(report.connects, 3);
    assert_eq!(report.disconnects, 2);
    assert_eq!(report.submitted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.completed, 2);
}

#[tokio::test]
async fn test_disconnect_mid_flash_does_not_cancel() {
    let harness = EngineHarness::with_behavior(1, Behavior::slow(300));
    let mut events = harness.scheduler.subscribe();
    let running = start(Monitor::new(harness.scheduler.clone(), &harness.config));

    running.send(connect("/dev/ttyUSB0", "SN0001")).await;
    harness.until_running(1).await;
    running.send(disconnect("/dev/ttyUSB0", "SN0001")).await;
    eventually("device to disconnect", || harness.registry.active().is_empty()).await;

    let finished = next_terminal(&mut events).await;
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(harness.registry.list()[0].state, DeviceState::Disconnected);
    running.finish().await;
}

#[tokio::test]
async fn test_conflicting_submission_leaves_identity_idle() {
    let harness = EngineHarness::with_behavior(1, Behavior::slow(200));
    let mut events = harness.scheduler.subscribe();
    let id = harness.plug("/dev/ttyUSB0", "SN0001").identity;
    let manual = harness.submit(&id);

    let running = start(
        Monitor::new(harness.scheduler.clone(), &harness.config)
            .with_cooldown(Duration::from_secs(60)),
    );
    running.send(connect("/dev/ttyUSB0", "SN0001")).await;
    let finished = next_terminal(&mut events).await;
    assert_eq!(finished.job_id, manual);

    // Rejected earlier, so not cooling down now.
    running.send(disconnect("/dev/ttyUSB0", "SN0001")).await;
    running.send(connect("/dev/ttyUSB0", "SN0001")).await;
    let auto = next_terminal(&mut events).await;
    assert_ne!(auto.job_id, manual);

    let report = running.finish().await;
    assert_eq!(report.rejected, 1);
    assert_eq!(report.submitted, 1);
}

#[tokio::test]
async fn test_shutdown_stops_monitor() {
    let harness = EngineHarness::new(1);
    let monitor = Monitor::new(harness.scheduler.clone(), &harness.config);
    let shutdown = monitor.shutdown_handle();
    let running = start(monitor);

    shutdown.trigger();
    let report = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("monitor ignored shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(report, MonitorReport::default());
    // The stream was closed on the way out.
    assert!(running.tx.is_closed());
}

#[tokio::test]
async fn test_missing_firmware_fails_at_start() {
    let harness = EngineHarness::new(1);
    let monitor = Monitor::new(harness.scheduler.clone(), &harness.config)
        .with_firmware(harness.dir().join("missing.bin"));
    let running = start(monitor);
    let result = running.task.await.unwrap();
    assert!(matches!(result, Err(EngineError::Firmware { .. })));
}

/// Reports whatever ports the test currently lists.
#[derive(Default)]
struct FakePorts {
    ports: Mutex<Vec<PortInfo>>,
}

impl PortEnumerator for FakePorts {
    fn enumerate(&self) -> Result<Vec<PortInfo>, HotplugError> {
        Ok(self.ports.lock().unwrap().clone())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_polled_ports_are_flashed_once() {
    let harness = EngineHarness::new(2);
    let ports = Arc::new(FakePorts::default());
    *ports.ports.lock().unwrap() = vec![
        usb_port("/dev/ttyUSB0", "SN0001"),
        usb_port("/dev/ttyUSB1", "SN0002"),
    ];

    let source = HotplugSource::new(ports.clone(), &harness.config)
        .with_strategy(HotplugStrategy::Poll);
    let stream = source.start().unwrap();
    let monitor = Monitor::new(harness.scheduler.clone(), &harness.config);
    let shutdown = monitor.shutdown_handle();
    let task = tokio::spawn(async move { monitor.run(stream).await });

    eventually("both devices flashed", || harness.scheduler.snapshot().succeeded == 2).await;
    // Several more poll rounds with nothing new.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.flasher.calls().len(), 2);

    shutdown.trigger();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.connects, 2);
    assert_eq!(report.submitted, 2);
}
