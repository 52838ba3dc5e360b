//! Versioned schema migrations.
//!
//! Applied versions are tracked in a `_migrations` table; each pending
//! migration runs once, in order. Column additions are skipped when the
//! column is already present.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_flash_records_table",
        sql: include_str!("sql/001_create_flash_records.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "add_error_kind_to_flash_records",
        sql: include_str!("sql/002_add_error_kind.sql"),
        kind: MigrationKind::AddColumn {
            table: "flash_records",
            column: "error_kind",
        },
    },
    Migration {
        version: 3,
        description: "add_mac_address_to_flash_records",
        sql: include_str!("sql/003_add_mac_address.sql"),
        kind: MigrationKind::AddColumn {
            table: "flash_records",
            column: "mac_address",
        },
    },
    Migration {
        version: 4,
        description: "add_firmware_path_to_flash_records",
        sql: include_str!("sql/004_add_firmware_path.sql"),
        kind: MigrationKind::AddColumn {
            table: "flash_records",
            column: "firmware_path",
        },
    },
    Migration {
        version: 5,
        description: "add_firmware_sha256_to_flash_records",
        sql: include_str!("sql/005_add_firmware_sha256.sql"),
        kind: MigrationKind::AddColumn {
            table: "flash_records",
            column: "firmware_sha256",
        },
    },
    Migration {
        version: 6,
        description: "add_session_log_to_flash_records",
        sql: include_str!("sql/006_add_session_log.sql"),
        kind: MigrationKind::AddColumn {
            table: "flash_records",
            column: "session_log",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version = current_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{}: column already present",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Highest applied migration version, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;
    Ok(version)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        assert_eq!(current_version(&conn).unwrap(), MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_flash_records_job_id_is_primary_key() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let insert = "INSERT INTO flash_records (job_id, device_identity, chip_type, duration_ms, status, timestamp)
                      VALUES ('dup', 'path:/dev/ttyUSB0', 'esp32', 1, 'failed', '2026-01-01T00:00:00.000Z')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_traceability_columns_added() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        for column in [
            "error_kind",
            "mac_address",
            "firmware_path",
            "firmware_sha256",
            "session_log",
        ] {
            assert!(column_exists(&conn, "flash_records", column).unwrap(), "{}", column);
        }
    }

    #[test]
    fn test_existing_column_is_skipped_not_duplicated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("sql/001_create_flash_records.sql"))
            .unwrap();
        conn.execute_batch("ALTER TABLE flash_records ADD COLUMN error_kind TEXT;")
            .unwrap();

        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), MIGRATIONS.len() as u32);
        assert!(column_exists(&conn, "flash_records", "session_log").unwrap());
    }
}
