//! Flash record repository: append and filtered reads over `flash_records`.
//!
//! Rows are write-once: no update or delete path exists.

use rusqlite::{params, ErrorCode, Row};

use super::{Database, DatabaseError};

/// A raw flash record row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRecordRow {
    pub job_id: String,
    pub device_identity: String,
    pub chip_type: String,
    pub duration_ms: i64,
    pub status: String,
    pub error_detail: Option<String>,
    pub timestamp: String,
    pub error_kind: Option<String>,
    pub mac_address: Option<String>,
    pub firmware_path: Option<String>,
    pub firmware_sha256: Option<String>,
    pub session_log: Option<String>,
}

impl FlashRecordRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            device_identity: row.get("device_identity")?,
            chip_type: row.get("chip_type")?,
            duration_ms: row.get("duration_ms")?,
            status: row.get("status")?,
            error_detail: row.get("error_detail")?,
            timestamp: row.get("timestamp")?,
            error_kind: row.get("error_kind")?,
            mac_address: row.get("mac_address")?,
            firmware_path: row.get("firmware_path")?,
            firmware_sha256: row.get("firmware_sha256")?,
            session_log: row.get("session_log")?,
        })
    }
}

/// Filter for record reads. Timestamps compare as canonical RFC 3339 strings.
#[derive(Debug, Default, Clone)]
pub struct RecordFilter {
    pub device_identity: Option<String>,
    pub status: Option<String>,
    pub error_kind: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<u64>,
    pub newest_first: bool,
}

impl RecordFilter {
    fn where_clause(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref identity) = self.device_identity {
            conditions.push(format!("device_identity = ?{}", param_values.len() + 1));
            param_values.push(Box::new(identity.clone()));
        }
        if let Some(ref status) = self.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref kind) = self.error_kind {
            conditions.push(format!("error_kind = ?{}", param_values.len() + 1));
            param_values.push(Box::new(kind.clone()));
        }
        if let Some(ref from) = self.from {
            conditions.push(format!("timestamp >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from.clone()));
        }
        if let Some(ref to) = self.to {
            conditions.push(format!("timestamp <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to.clone()));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        (clause, param_values)
    }
}

/// Inserts a record. A second insert with the same `job_id` fails with
/// [`DatabaseError::Duplicate`].
pub fn insert(db: &Database, record: &FlashRecordRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let result = conn.execute(
            "INSERT INTO flash_records (job_id, device_identity, chip_type, duration_ms,
             status, error_detail, timestamp, error_kind, mac_address, firmware_path,
             firmware_sha256, session_log)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.job_id,
                record.device_identity,
                record.chip_type,
                record.duration_ms,
                record.status,
                record.error_detail,
                record.timestamp,
                record.error_kind,
                record.mac_address,
                record.firmware_path,
                record.firmware_sha256,
                record.session_log,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(DatabaseError::Duplicate {
                    job_id: record.job_id.clone(),
                })
            }
            Err(e) => Err(DatabaseError::Sqlite(e)),
        }
    })
}

/// Returns matching records ordered by timestamp, then job id.
pub fn query(
    db: &Database,
    filter: &RecordFilter,
) -> Result<Vec<FlashRecordRow>, DatabaseError> {
    db.with_conn(|conn| {
        let (where_clause, mut param_values) = filter.where_clause();
        let direction = if filter.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT * FROM flash_records {} ORDER BY timestamp {dir}, job_id {dir}",
            where_clause,
            dir = direction
        );
        if let Some(limit) = filter.limit {
            param_values.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", param_values.len()));
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), FlashRecordRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts matching records. `limit` and ordering are ignored.
pub fn count(db: &Database, filter: &RecordFilter) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let (where_clause, param_values) = filter.where_clause();
        let sql = format!("SELECT COUNT(*) FROM flash_records {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&sql, params_ref.as_slice(), |r| r.get(0))?;
        Ok(total)
    })
}
