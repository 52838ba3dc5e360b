//! `esptool` subprocess adapter.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::output::{classify_failure, failure_detail, OutputParser};
use super::{
    CancelSignal, FlashErrorKind, FlashOutcome, FlashRequest, FlashResult, Flasher,
    ProgressReporter,
};
use crate::config::EngineConfig;

/// How long to keep reading output after the tool exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Runs `esptool` (or a compatible tool) as a child process.
#[derive(Debug, Clone)]
pub struct EsptoolFlasher {
    tool_path: PathBuf,
    tool_args: Vec<String>,
    timeout: Duration,
}

impl EsptoolFlasher {
    pub fn new(tool_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            tool_path: tool_path.into(),
            tool_args: Vec::new(),
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.tool_path, config.flash_timeout())
            .with_tool_args(config.tool_args.clone())
    }

    pub fn with_tool_args(mut self, args: Vec<String>) -> Self {
        self.tool_args = args;
        self
    }

    /// Full argument list: tool args, then
    /// `--chip C --port P --baud B write_flash [--erase-all] [--verify] -z OFFSET FIRMWARE`.
    pub fn build_args(&self, request: &FlashRequest) -> Vec<String> {
        let mut args = self.tool_args.clone();
        args.extend([
            "--chip".to_string(),
            request.chip_type.clone(),
            "--port".to_string(),
            request.port_path.clone(),
            "--baud".to_string(),
            request.baud_rate.to_string(),
            "write_flash".to_string(),
        ]);
        if request.erase {
            args.push("--erase-all".to_string());
        }
        if request.verify {
            args.push("--verify".to_string());
        }
        args.extend([
            "-z".to_string(),
            format!("{:#x}", request.offset),
            request.firmware_path.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Asks whatever answers on `port_path` to identify itself via
    /// `chip_id`. Succeeds only on a clean exit that names a chip; the
    /// chip and MAC land in `detected_chip` and `mac_address`.
    pub async fn check_port(&self, port_path: &str, baud_rate: u32) -> FlashResult {
        let mut args = self.tool_args.clone();
        args.extend([
            "--port".to_string(),
            port_path.to_string(),
            "--baud".to_string(),
            baud_rate.to_string(),
            "chip_id".to_string(),
        ]);
        self.run_to_completion(port_path, args, true).await
    }

    /// Erases the whole flash of the chip on `port_path`.
    pub async fn erase_flash(
        &self,
        port_path: &str,
        chip_type: &str,
        baud_rate: u32,
    ) -> FlashResult {
        let mut args = self.tool_args.clone();
        args.extend([
            "--chip".to_string(),
            chip_type.to_string(),
            "--port".to_string(),
            port_path.to_string(),
            "--baud".to_string(),
            baud_rate.to_string(),
            "erase_flash".to_string(),
        ]);
        self.run_to_completion(port_path, args, false).await
    }

    /// Runs a short, non-cancellable tool command and classifies its output
    /// the same way a flash run is classified.
    async fn run_to_completion(
        &self,
        port_path: &str,
        args: Vec<String>,
        require_chip: bool,
    ) -> FlashResult {
        let started = Instant::now();
        log::info!("Running {} {}", self.tool_path.display(), args.join(" "));

        let mut cmd = TokioCommand::new(&self.tool_path);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                log::error!("Failed to spawn {}: {}", self.tool_path.display(), e);
                return self.spawn_failure(&e, started);
            }
            Err(_) => {
                log::warn!("{} on {} timed out", args.join(" "), port_path);
                return FlashResult::failed(
                    FlashErrorKind::Timeout,
                    format!("Command timed out after {}s", self.timeout.as_secs_f64()),
                    started.elapsed(),
                );
            }
        };

        let mut parser = OutputParser::new(false);
        for stream in [&output.stdout, &output.stderr] {
            for line in String::from_utf8_lossy(stream).lines() {
                log::debug!("[{}] {}", port_path, line);
                parser.feed(line);
            }
        }

        let answered = !require_chip || parser.chip().is_some();
        let outcome = if output.status.success() && !parser.saw_fatal() && answered {
            FlashOutcome::Succeeded
        } else {
            let kind = classify_failure(parser.lines());
            let detail = failure_detail(parser.lines())
                .unwrap_or_else(|| format!("Tool exited with {}", output.status));
            FlashOutcome::Failed { kind, detail }
        };

        FlashResult {
            outcome,
            detected_chip: parser.chip().map(str::to_string),
            mac_address: parser.mac().map(str::to_string),
            output: parser.into_lines(),
            duration: started.elapsed(),
        }
    }

    fn spawn_failure(&self, e: &std::io::Error, started: Instant) -> FlashResult {
        let kind = match e.kind() {
            std::io::ErrorKind::PermissionDenied => FlashErrorKind::PermissionDenied,
            _ => FlashErrorKind::Unknown,
        };
        FlashResult::failed(
            kind,
            format!("Failed to start {}: {}", self.tool_path.display(), e),
            started.elapsed(),
        )
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

fn handle_line(
    parser: &mut OutputParser,
    line: &str,
    request: &FlashRequest,
    progress: &dyn ProgressReporter,
) {
    log::debug!("[{}] {}", request.port_path, line);
    for change in parser.feed(line) {
        progress.report(&request.job_id, change);
    }
}

#[async_trait]
impl Flasher for EsptoolFlasher {
    async fn flash(
        &self,
        request: &FlashRequest,
        mut cancel: CancelSignal,
        progress: Arc<dyn ProgressReporter>,
    ) -> FlashResult {
        let started = Instant::now();

        if !request.firmware_path.is_file() {
            return FlashResult::failed(
                FlashErrorKind::FirmwareNotFound,
                format!(
                    "Firmware file not found: {}",
                    request.firmware_path.display()
                ),
                started.elapsed(),
            );
        }
        if cancel.is_cancelled() {
            return FlashResult {
                outcome: FlashOutcome::Cancelled,
                output: Vec::new(),
                detected_chip: None,
                mac_address: None,
                duration: started.elapsed(),
            };
        }

        let args = self.build_args(request);
        log::info!(
            "Flashing {} with {} {}",
            request.port_path,
            self.tool_path.display(),
            args.join(" ")
        );

        let mut cmd = TokioCommand::new(&self.tool_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to spawn {}: {}", self.tool_path.display(), e);
                return self.spawn_failure(&e, started);
            }
        };

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut parser = OutputParser::new(request.verify);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let ending = loop {
            tokio::select! {
                Some(line) = line_rx.recv() => {
                    handle_line(&mut parser, &line, request, progress.as_ref());
                }
                status = child.wait() => break Ending::Exited(status),
                _ = cancel.cancelled() => break Ending::Cancelled,
                _ = &mut deadline => break Ending::TimedOut,
            }
        };

        match ending {
            Ending::Exited(_) => {
                let drain = async {
                    while let Some(line) = line_rx.recv().await {
                        handle_line(&mut parser, &line, request, progress.as_ref());
                    }
                };
                if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                    log::warn!("Output of {} still open after exit", request.port_path);
                }
            }
            Ending::Cancelled | Ending::TimedOut => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill flasher for {}: {}", request.port_path, e);
                }
                while let Ok(line) = line_rx.try_recv() {
                    handle_line(&mut parser, &line, request, progress.as_ref());
                }
            }
        }
        for reader in readers {
            reader.abort();
        }

        let outcome = match ending {
            Ending::Cancelled => {
                log::info!("Flash on {} cancelled", request.port_path);
                FlashOutcome::Cancelled
            }
            Ending::TimedOut => {
                log::warn!(
                    "Flash on {} timed out after {:?}",
                    request.port_path,
                    self.timeout
                );
                FlashOutcome::Failed {
                    kind: FlashErrorKind::Timeout,
                    detail: format!("Flash timed out after {}s", self.timeout.as_secs_f64()),
                }
            }
            Ending::Exited(Err(e)) => FlashOutcome::Failed {
                kind: FlashErrorKind::Unknown,
                detail: format!("Failed to wait for flasher: {}", e),
            },
            Ending::Exited(Ok(status)) if status.success() && !parser.saw_fatal() => {
                FlashOutcome::Succeeded
            }
            Ending::Exited(Ok(status)) => {
                let kind = classify_failure(parser.lines());
                let detail = failure_detail(parser.lines())
                    .unwrap_or_else(|| format!("Flasher exited with {}", status));
                FlashOutcome::Failed { kind, detail }
            }
        };

        FlashResult {
            outcome,
            detected_chip: parser.chip().map(str::to_string),
            mac_address: parser.mac().map(str::to_string),
            output: parser.into_lines(),
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flasher::{cancel_pair, FlashProgress, NoopProgress};
    use std::sync::Mutex;

    fn request(firmware: PathBuf) -> FlashRequest {
        FlashRequest {
            job_id: "job-1".to_string(),
            port_path: "/dev/ttyUSB0".to_string(),
            firmware_path: firmware,
            offset: 0x1000,
            baud_rate: 921_600,
            chip_type: "esp32".to_string(),
            verify: true,
            erase: false,
        }
    }

    #[test]
    fn test_build_args() {
        let flasher = EsptoolFlasher::new("esptool.py", Duration::from_secs(1));
        let args = flasher.build_args(&request(PathBuf::from("/fw/app.bin")));
        assert_eq!(
            args,
            vec![
                "--chip", "esp32", "--port", "/dev/ttyUSB0", "--baud", "921600", "write_flash",
                "--verify", "-z", "0x1000", "/fw/app.bin",
            ]
        );
    }

    #[test]
    fn test_build_args_without_verify_and_with_prefix() {
        let flasher = EsptoolFlasher::new("python3", Duration::from_secs(1))
            .with_tool_args(vec!["-m".to_string(), "esptool".to_string()]);
        let mut req = request(PathBuf::from("fw.bin"));
        req.verify = false;
        req.offset = 0;
        let args = flasher.build_args(&req);
        assert_eq!(&args[..2], &["-m", "esptool"]);
        assert!(!args.contains(&"--verify".to_string()));
        assert_eq!(&args[args.len() - 2..], &["0x0", "fw.bin"]);
    }

    #[test]
    fn test_build_args_with_erase() {
        let flasher = EsptoolFlasher::new("esptool.py", Duration::from_secs(1));
        let mut req = request(PathBuf::from("/fw/app.bin"));
        req.erase = true;
        let args = flasher.build_args(&req);
        let write = args.iter().position(|a| a == "write_flash").unwrap();
        assert_eq!(args[write + 1], "--erase-all");
        assert_eq!(args[write + 2], "--verify");
    }

    #[tokio::test]
    async fn test_missing_firmware_does_not_spawn() {
        let flasher = EsptoolFlasher::new("/nonexistent/tool", Duration::from_secs(1));
        let result = flasher
            .flash(
                &request(PathBuf::from("/nonexistent/fw.bin")),
                CancelSignal::never(),
                Arc::new(NoopProgress),
            )
            .await;
        assert!(matches!(
            result.outcome,
            FlashOutcome::Failed {
                kind: FlashErrorKind::FirmwareNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_is_unknown_failure() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"\x00\x01").unwrap();

        let flasher = EsptoolFlasher::new("/nonexistent/esptool", Duration::from_secs(1));
        let result = flasher
            .flash(&request(firmware), CancelSignal::never(), Arc::new(NoopProgress))
            .await;
        match result.outcome {
            FlashOutcome::Failed { kind, detail } => {
                assert_eq!(kind, FlashErrorKind::Unknown);
                assert!(detail.contains("/nonexistent/esptool"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<FlashProgress>>);

    impl ProgressReporter for Recorder {
        fn report(&self, _job_id: &str, progress: FlashProgress) {
            self.0.lock().unwrap().push(progress);
        }
    }

    /// Runs `body` as a shell script standing in for the tool.
    #[cfg(unix)]
    fn script_flasher(dir: &std::path::Path, body: &str, timeout: Duration) -> EsptoolFlasher {
        let script = dir.join("fake_esptool.sh");
        std::fs::write(&script, body).unwrap();
        EsptoolFlasher::new("/bin/sh", timeout)
            .with_tool_args(vec![script.to_string_lossy().into_owned()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_parses_output() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"firmware").unwrap();
        let flasher = script_flasher(
            dir.path(),
            "echo \"args: $*\"\n\
             echo 'Chip is ESP32-D0WD (revision 1)'\n\
             echo 'MAC: 24:0a:c4:00:11:22'\n\
             echo 'Writing at 0x00001000... (50 %)'\n\
             echo 'Writing at 0x00002000... (100 %)'\n\
             echo 'Hash of data verified.' >&2\n\
             exit 0\n",
            Duration::from_secs(10),
        );

        let recorder = Arc::new(Recorder::default());
        let result = flasher
            .flash(&request(firmware.clone()), CancelSignal::never(), recorder.clone())
            .await;

        assert_eq!(result.outcome, FlashOutcome::Succeeded);
        assert_eq!(result.detected_chip.as_deref(), Some("ESP32-D0WD"));
        assert_eq!(result.mac_address.as_deref(), Some("24:0a:c4:00:11:22"));
        let expected_args = format!(
            "args: --chip esp32 --port /dev/ttyUSB0 --baud 921600 write_flash --verify -z 0x1000 {}",
            firmware.display()
        );
        assert!(result.output.contains(&expected_args));

        let events = recorder.0.lock().unwrap();
        assert!(events.contains(&FlashProgress::Writing { percent: 100 }));
        assert!(events.contains(&FlashProgress::Verifying));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_with_sync_error() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"firmware").unwrap();
        let flasher = script_flasher(
            dir.path(),
            "echo 'Connecting........_____'\n\
             echo 'A fatal error occurred: Failed to connect to ESP32: No serial data received.' >&2\n\
             exit 2\n",
            Duration::from_secs(10),
        );

        let result = flasher
            .flash(&request(firmware), CancelSignal::never(), Arc::new(NoopProgress))
            .await;
        match result.outcome {
            FlashOutcome::Failed { kind, detail } => {
                assert_eq!(kind, FlashErrorKind::SyncFailure);
                assert!(detail.contains("Failed to connect"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"firmware").unwrap();
        let flasher = script_flasher(dir.path(), "exec sleep 30\n", Duration::from_secs(60));

        let (handle, signal) = cancel_pair();
        let task = tokio::spawn(async move {
            flasher
                .flash(&request(firmware), signal, Arc::new(NoopProgress))
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.outcome, FlashOutcome::Cancelled);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_reports_timeout_kind() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"firmware").unwrap();
        let flasher = script_flasher(dir.path(), "exec sleep 30\n", Duration::from_millis(300));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            flasher.flash(&request(firmware), CancelSignal::never(), Arc::new(NoopProgress)),
        )
        .await
        .unwrap();
        assert!(matches!(
            result.outcome,
            FlashOutcome::Failed {
                kind: FlashErrorKind::Timeout,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fatal_output_with_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"firmware").unwrap();
        let flasher = script_flasher(
            dir.path(),
            "echo 'A fatal error occurred: Packet content transfer stopped'\nexit 0\n",
            Duration::from_secs(10),
        );

        let result = flasher
            .flash(&request(firmware), CancelSignal::never(), Arc::new(NoopProgress))
            .await;
        assert!(matches!(
            result.outcome,
            FlashOutcome::Failed {
                kind: FlashErrorKind::Unknown,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_port_reports_chip() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = script_flasher(
            dir.path(),
            "echo \"args: $*\"\n\
             echo 'Chip is ESP32-C3 (revision v0.4)'\n\
             echo 'MAC: 58:cf:79:aa:bb:cc'\n\
             echo 'Chip ID: 0x00000000'\n\
             exit 0\n",
            Duration::from_secs(10),
        );

        let result = flasher.check_port("/dev/ttyACM0", 115_200).await;
        assert_eq!(result.outcome, FlashOutcome::Succeeded);
        assert_eq!(result.detected_chip.as_deref(), Some("ESP32-C3"));
        assert_eq!(result.mac_address.as_deref(), Some("58:cf:79:aa:bb:cc"));
        assert!(result
            .output
            .iter()
            .any(|l| l.ends_with("--port /dev/ttyACM0 --baud 115200 chip_id")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_port_without_chip_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let silent = script_flasher(
            dir.path(),
            "echo 'Serial port /dev/ttyACM0'\nexit 0\n",
            Duration::from_secs(10),
        );
        assert!(matches!(
            silent.check_port("/dev/ttyACM0", 115_200).await.outcome,
            FlashOutcome::Failed { .. }
        ));

        let no_sync = script_flasher(
            dir.path(),
            "echo 'A fatal error occurred: Failed to connect to Espressif device: No serial data received.' >&2\n\
             exit 2\n",
            Duration::from_secs(10),
        );
        match no_sync.check_port("/dev/ttyACM0", 115_200).await.outcome {
            FlashOutcome::Failed { kind, .. } => assert_eq!(kind, FlashErrorKind::SyncFailure),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_erase_flash_runs_erase_command() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = script_flasher(
            dir.path(),
            "echo \"args: $*\"\n\
             echo 'Erasing flash (this may take a while)...'\n\
             echo 'Chip erase completed successfully in 3.2s'\n\
             exit 0\n",
            Duration::from_secs(10),
        );

        let result = flasher.erase_flash("/dev/ttyUSB0", "esp32s3", 460_800).await;
        assert_eq!(result.outcome, FlashOutcome::Succeeded);
        assert!(result
            .output
            .iter()
            .any(|l| l.ends_with("--chip esp32s3 --port /dev/ttyUSB0 --baud 460800 erase_flash")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_erase_flash_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = script_flasher(dir.path(), "exec sleep 30\n", Duration::from_millis(200));
        let result = flasher.erase_flash("/dev/ttyUSB0", "esp32", 115_200).await;
        assert!(matches!(
            result.outcome,
            FlashOutcome::Failed {
                kind: FlashErrorKind::Timeout,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hash_check_without_verify_skips_verify_phase() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"firmware").unwrap();
        let flasher = script_flasher(
            dir.path(),
            "echo 'Writing at 0x00001000... (100 %)'\n\
             echo 'Hash of data verified.'\n\
             exit 0\n",
            Duration::from_secs(10),
        );
        let mut req = request(firmware);
        req.verify = false;

        let recorder = Arc::new(Recorder::default());
        let result = flasher.flash(&req, CancelSignal::never(), recorder.clone()).await;
        assert_eq!(result.outcome, FlashOutcome::Succeeded);
        let events = recorder.0.lock().unwrap();
        assert!(events.contains(&FlashProgress::Writing { percent: 100 }));
        assert!(!events.contains(&FlashProgress::Verifying));
    }
}
