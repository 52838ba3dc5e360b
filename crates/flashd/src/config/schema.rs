use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resolved engine configuration. Every field has a default, so `{}` is a
/// valid config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_chip_type")]
    pub chip_type: String,
    #[serde(default = "default_flash_offset")]
    pub flash_offset: u32,
    #[serde(default = "default_firmware_path")]
    pub firmware_path: PathBuf,
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Erase the whole flash before writing (`write_flash --erase-all`).
    #[serde(default)]
    pub erase_before_flash: bool,
    #[serde(default = "default_tool_path")]
    pub tool_path: PathBuf,
    /// Leading arguments placed before the flash arguments, e.g.
    /// `["-m", "esptool"]` with `tool_path` set to `python3`.
    #[serde(default)]
    pub tool_args: Vec<String>,
    #[serde(default = "default_flash_timeout_secs")]
    pub flash_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_port_patterns")]
    pub port_patterns: Vec<String>,
    #[serde(default)]
    pub hotplug_strategy: HotplugStrategy,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub session_log_dir: Option<PathBuf>,
    #[serde(default)]
    pub metrics_retry: MetricsRetryConfig,
    /// Finished jobs kept in memory for status queries; older ones are
    /// only in the metrics store.
    #[serde(default = "default_job_history_limit")]
    pub job_history_limit: usize,
    /// Disconnected device records kept in the registry.
    #[serde(default = "default_device_history_limit")]
    pub device_history_limit: usize,
}

fn default_max_workers() -> usize {
    10
}

fn default_baud_rate() -> u32 {
    921_600
}

fn default_chip_type() -> String {
    "esp32".to_string()
}

fn default_flash_offset() -> u32 {
    0x1000
}

fn default_firmware_path() -> PathBuf {
    PathBuf::from("static/firmware/firmware.bin")
}

fn default_true() -> bool {
    true
}

fn default_tool_path() -> PathBuf {
    PathBuf::from("esptool.py")
}

fn default_flash_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_job_history_limit() -> usize {
    1000
}

fn default_device_history_limit() -> usize {
    500
}

fn default_port_patterns() -> Vec<String> {
    vec![
        "ttyUSB*".to_string(),
        "ttyACM*".to_string(),
        "cu.usbserial-*".to_string(),
        "cu.SLAB_USBtoUART*".to_string(),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            baud_rate: default_baud_rate(),
            chip_type: default_chip_type(),
            flash_offset: default_flash_offset(),
            firmware_path: default_firmware_path(),
            verify: true,
            erase_before_flash: false,
            tool_path: default_tool_path(),
            tool_args: Vec::new(),
            flash_timeout_secs: default_flash_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            cooldown_secs: default_cooldown_secs(),
            port_patterns: default_port_patterns(),
            hotplug_strategy: HotplugStrategy::default(),
            database_path: None,
            session_log_dir: None,
            metrics_retry: MetricsRetryConfig::default(),
            job_history_limit: default_job_history_limit(),
            device_history_limit: default_device_history_limit(),
        }
    }
}

impl EngineConfig {
    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Configured database path, falling back to `~/.flashd/data/flashd.db`.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}

/// How the hotplug source learns about device changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotplugStrategy {
    /// Filesystem notifications, falling back to polling when unavailable.
    #[default]
    Auto,
    Notify,
    Poll,
}

/// Bounded exponential backoff for metrics writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

impl Default for MetricsRetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl MetricsRetryConfig {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}
