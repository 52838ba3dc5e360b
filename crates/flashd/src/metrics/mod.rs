//! Metrics store: durable, append-only record of every terminal flash job.
//!
//! Aggregates are computed from stored rows on every read.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::JobStatus;
use crate::db::metrics_repo::{self, FlashRecordRow, RecordFilter};
use crate::db::{Database, DatabaseError};
use crate::device::DeviceIdentity;
use crate::error::MetricsError;
use crate::flasher::FlashErrorKind;

pub mod export;

pub use export::{parse_csv, ExportFormat, CSV_HEADER};

/// Durable projection of one terminal flash job.
///
/// The fields after `timestamp` trace what was written where; they are
/// empty for jobs that never reached the flasher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub job_id: String,
    pub device_identity: DeviceIdentity,
    pub chip_type: String,
    pub duration_ms: u64,
    pub status: JobStatus,
    pub error_detail: Option<String>,
    /// Job finish time, kept at millisecond precision.
    #[serde(with = "timestamp_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error_kind: Option<FlashErrorKind>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub firmware_path: Option<String>,
    #[serde(default)]
    pub firmware_sha256: Option<String>,
    #[serde(default)]
    pub session_log: Option<String>,
}

impl MetricsRecord {
    pub fn new(
        job_id: impl Into<String>,
        device_identity: DeviceIdentity,
        chip_type: impl Into<String>,
        duration_ms: u64,
        status: JobStatus,
        error_detail: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            device_identity,
            chip_type: chip_type.into(),
            duration_ms,
            status,
            error_detail,
            timestamp: timestamp.trunc_subsecs(3),
            error_kind: None,
            mac_address: None,
            firmware_path: None,
            firmware_sha256: None,
            session_log: None,
        }
    }

    pub fn with_error_kind(mut self, kind: Option<FlashErrorKind>) -> Self {
        self.error_kind = kind;
        self
    }

    pub fn with_mac_address(mut self, mac: Option<String>) -> Self {
        self.mac_address = mac;
        self
    }

    pub fn with_firmware(mut self, path: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.firmware_path = Some(path.into());
        self.firmware_sha256 = Some(sha256.into());
        self
    }

    pub fn with_session_log(mut self, path: Option<String>) -> Self {
        self.session_log = path;
        self
    }

    fn to_row(&self) -> FlashRecordRow {
        FlashRecordRow {
            job_id: self.job_id.clone(),
            device_identity: self.device_identity.to_string(),
            chip_type: self.chip_type.clone(),
            duration_ms: i64::try_from(self.duration_ms).unwrap_or(i64::MAX),
            status: self.status.as_str().to_string(),
            error_detail: self.error_detail.clone(),
            timestamp: format_timestamp(&self.timestamp),
            error_kind: self.error_kind.map(|k| k.as_str().to_string()),
            mac_address: self.mac_address.clone(),
            firmware_path: self.firmware_path.clone(),
            firmware_sha256: self.firmware_sha256.clone(),
            session_log: self.session_log.clone(),
        }
    }

    fn from_row(row: FlashRecordRow) -> Result<Self, DatabaseError> {
        let status = JobStatus::parse(&row.status).ok_or(DatabaseError::Corrupt {
            column: "status",
            value: row.status.clone(),
        })?;
        let duration_ms = u64::try_from(row.duration_ms).map_err(|_| DatabaseError::Corrupt {
            column: "duration_ms",
            value: row.duration_ms.to_string(),
        })?;
        let timestamp = parse_timestamp(&row.timestamp).ok_or(DatabaseError::Corrupt {
            column: "timestamp",
            value: row.timestamp.clone(),
        })?;
        let error_kind = match row.error_kind {
            Some(raw) => Some(FlashErrorKind::parse(&raw).ok_or(DatabaseError::Corrupt {
                column: "error_kind",
                value: raw.clone(),
            })?),
            None => None,
        };

        Ok(Self {
            job_id: row.job_id,
            device_identity: DeviceIdentity::new(row.device_identity),
            chip_type: row.chip_type,
            duration_ms,
            status,
            error_detail: row.error_detail,
            timestamp,
            error_kind,
            mac_address: row.mac_address,
            firmware_path: row.firmware_path,
            firmware_sha256: row.firmware_sha256,
            session_log: row.session_log,
        })
    }
}

fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

mod timestamp_millis {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }
}

/// Record selection. All bounds are inclusive.
#[derive(Debug, Default, Clone)]
pub struct MetricsFilter {
    pub device_identity: Option<DeviceIdentity>,
    pub status: Option<JobStatus>,
    pub error_kind: Option<FlashErrorKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

impl MetricsFilter {
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            ..Default::default()
        }
    }

    fn to_record_filter(&self) -> RecordFilter {
        RecordFilter {
            device_identity: self.device_identity.as_ref().map(|i| i.to_string()),
            status: self.status.map(|s| s.as_str().to_string()),
            error_kind: self.error_kind.map(|k| k.as_str().to_string()),
            from: self.from.map(|t| format_timestamp(&t.trunc_subsecs(3))),
            to: self.to.map(|t| format_timestamp(&t.trunc_subsecs(3))),
            limit: self.limit,
            newest_first: false,
        }
    }
}

/// Grouping key for [`MetricsStore::aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    ChipType,
    DeviceIdentity,
    Status,
    /// Failure class; records without one fall under `none`.
    ErrorKind,
    /// UTC calendar day, `YYYY-MM-DD`.
    Day,
    /// A single `all` bucket.
    All,
}

impl GroupBy {
    fn key(&self, record: &MetricsRecord) -> String {
        match self {
            GroupBy::ChipType => record.chip_type.clone(),
            GroupBy::DeviceIdentity => record.device_identity.to_string(),
            GroupBy::Status => record.status.as_str().to_string(),
            GroupBy::ErrorKind => record
                .error_kind
                .map_or("none", |k| k.as_str())
                .to_string(),
            GroupBy::Day => record.timestamp.format("%Y-%m-%d").to_string(),
            GroupBy::All => "all".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub count: u64,
    pub success_count: u64,
    pub mean_duration_ms: f64,
}

impl AggregateStats {
    pub fn failure_count(&self) -> u64 {
        self.count - self.success_count
    }

    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.success_count as f64 * 100.0 / self.count as f64
        }
    }
}

/// Totals over a filtered record set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Percentage of `total` that succeeded.
    pub success_rate: f64,
    pub mean_duration_ms: f64,
}

/// Append-only store of [`MetricsRecord`]s backed by SQLite.
#[derive(Clone)]
pub struct MetricsStore {
    db: Database,
}

impl MetricsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, MetricsError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, MetricsError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Persists a record; committed when this returns. A second append of
    /// the same job id fails and leaves the stored record untouched.
    pub fn append(&self, record: &MetricsRecord) -> Result<(), MetricsError> {
        metrics_repo::insert(&self.db, &record.to_row()).map_err(|e| {
            MetricsError::StoreWriteFailed {
                job_id: record.job_id.clone(),
                source: e,
            }
        })
    }

    /// Matching records, oldest first (ties broken by job id).
    pub fn query(&self, filter: &MetricsFilter) -> Result<Vec<MetricsRecord>, MetricsError> {
        self.fetch(&filter.to_record_filter())
    }

    /// The `limit` most recent records, newest first.
    pub fn recent(&self, limit: u64) -> Result<Vec<MetricsRecord>, MetricsError> {
        let filter = RecordFilter {
            limit: Some(limit),
            newest_first: true,
            ..Default::default()
        };
        self.fetch(&filter)
    }

    pub fn count(&self, filter: &MetricsFilter) -> Result<u64, MetricsError> {
        Ok(metrics_repo::count(&self.db, &filter.to_record_filter())?)
    }

    fn fetch(&self, filter: &RecordFilter) -> Result<Vec<MetricsRecord>, MetricsError> {
        metrics_repo::query(&self.db, filter)?
            .into_iter()
            .map(|row| MetricsRecord::from_row(row).map_err(MetricsError::from))
            .collect()
    }

    pub fn aggregate(
        &self,
        group_by: GroupBy,
        filter: &MetricsFilter,
    ) -> Result<BTreeMap<String, AggregateStats>, MetricsError> {
        let mut totals: BTreeMap<String, (u64, u64, u128)> = BTreeMap::new();
        for record in self.query(filter)? {
            let entry = totals.entry(group_by.key(&record)).or_default();
            entry.0 += 1;
            if record.status == JobStatus::Succeeded {
                entry.1 += 1;
            }
            entry.2 += u128::from(record.duration_ms);
        }

        Ok(totals
            .into_iter()
            .map(|(key, (count, success_count, duration_sum))| {
                let stats = AggregateStats {
                    count,
                    success_count,
                    mean_duration_ms: duration_sum as f64 / count as f64,
                };
                (key, stats)
            })
            .collect())
    }

    pub fn summary(&self, filter: &MetricsFilter) -> Result<MetricsSummary, MetricsError> {
        let mut summary = MetricsSummary::default();
        let mut duration_sum: u128 = 0;
        for record in self.query(filter)? {
            summary.total += 1;
            duration_sum += u128::from(record.duration_ms);
            match record.status {
                JobStatus::Succeeded => summary.succeeded += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
                _ => summary.failed += 1,
            }
        }
        if summary.total > 0 {
            summary.success_rate = summary.succeeded as f64 * 100.0 / summary.total as f64;
            summary.mean_duration_ms = duration_sum as f64 / summary.total as f64;
        }
        Ok(summary)
    }

    pub fn export(
        &self,
        format: ExportFormat,
        filter: &MetricsFilter,
    ) -> Result<Vec<u8>, MetricsError> {
        export::render(format, &self.query(filter)?)
    }
}
