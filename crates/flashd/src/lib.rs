pub mod broadcast;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod flasher;
pub mod hotplug;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod sanitize;
pub mod scheduler;
pub mod storage;

pub use broadcast::{JobEvent, JobEventBroadcaster, JobPhase, JobStatus};
pub use config::{load_config, EngineConfig, HotplugStrategy};
pub use device::{Device, DeviceIdentity, DeviceRegistry, DeviceState, IdentityPolicy};
pub use error::{ConfigError, EngineError, HotplugError, MetricsError, Result, StorageError};
pub use flasher::{EsptoolFlasher, FlashErrorKind, FlashOutcome, FlashRequest, FlashResult, Flasher};
pub use hotplug::{HotplugEvent, HotplugKind, HotplugSource, HotplugStream, PortInfo};
pub use metrics::{ExportFormat, GroupBy, MetricsFilter, MetricsRecord, MetricsStore};
pub use monitor::{Monitor, MonitorReport, MonitorShutdown};
pub use scheduler::{BatchOutcome, FirmwareReference, FlashJob, FlashOptions, Scheduler};
