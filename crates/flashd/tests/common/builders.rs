//! Builders for test configurations and hotplug observations.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use flashd::config::{EngineConfig, HotplugStrategy};
use flashd::hotplug::{HotplugEvent, PortInfo};

/// Builder for `EngineConfig` with small, test-friendly values.
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let config = EngineConfig {
            max_workers: 4,
            poll_interval_ms: 50,
            cooldown_secs: 1,
            flash_timeout_secs: 10,
            hotplug_strategy: HotplugStrategy::Poll,
            ..EngineConfig::default()
        };
        Self { config }
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    pub fn firmware_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.firmware_path = path.as_ref().to_path_buf();
        self
    }

    pub fn session_log_dir(mut self, dir: PathBuf) -> Self {
        self.config.session_log_dir = Some(dir);
        self
    }

    pub fn chip_type(mut self, chip: &str) -> Self {
        self.config.chip_type = chip.to_string();
        self
    }

    pub fn metrics_retry(mut self, attempts: u32, base_delay_ms: u64) -> Self {
        self.config.metrics_retry.attempts = attempts;
        self.config.metrics_retry.base_delay_ms = base_delay_ms;
        self
    }

    pub fn job_history_limit(mut self, limit: usize) -> Self {
        self.config.job_history_limit = limit;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A USB serial port with a hardware serial number.
pub fn usb_port(path: &str, serial: &str) -> PortInfo {
    PortInfo {
        port_path: path.to_string(),
        vendor_id: Some(0x10c4),
        product_id: Some(0xea60),
        serial_number: Some(serial.to_string()),
    }
}

pub fn connect(path: &str, serial: &str) -> HotplugEvent {
    HotplugEvent::connect(usb_port(path, serial))
}

pub fn disconnect(path: &str, serial: &str) -> HotplugEvent {
    HotplugEvent::disconnect(usb_port(path, serial))
}
