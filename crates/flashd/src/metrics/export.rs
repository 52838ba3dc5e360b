//! CSV and JSON export of flash records.

use serde::{Deserialize, Serialize};

use super::MetricsRecord;
use crate::error::MetricsError;

/// Export columns. Traceability columns trail the core seven so readers
/// keyed on the first seven keep working.
pub const CSV_HEADER: [&str; 12] = [
    "job_id",
    "device_identity",
    "chip_type",
    "duration_ms",
    "status",
    "error_detail",
    "timestamp",
    "error_kind",
    "mac_address",
    "firmware_path",
    "firmware_sha256",
    "session_log",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

pub(super) fn render(
    format: ExportFormat,
    records: &[MetricsRecord],
) -> Result<Vec<u8>, MetricsError> {
    match format {
        ExportFormat::Csv => to_csv(records),
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(records)?),
    }
}

fn to_csv(records: &[MetricsRecord]) -> Result<Vec<u8>, MetricsError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|e| MetricsError::Csv(e.into_error().into()))
}

/// Parses a CSV export back into records.
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<MetricsRecord>, MetricsError> {
    let mut reader = csv::Reader::from_reader(bytes);

    let headers = reader.headers()?.clone();
    if headers.iter().ne(CSV_HEADER.iter().copied()) {
        return Err(MetricsError::Parse {
            field: "header",
            value: headers.iter().collect::<Vec<_>>().join(","),
        });
    }

    let records = reader
        .deserialize::<MetricsRecord>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}
