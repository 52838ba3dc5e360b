//! Per-job session logs holding the flashing tool's full output.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StorageError;
use crate::sanitize::{port_label, short_job_id};

/// Writes one log file per job into a directory.
#[derive(Debug, Clone)]
pub struct SessionLogWriter {
    directory: PathBuf,
}

impl SessionLogWriter {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File name for a job: `<port>_<YYYYmmdd_HHMMSS>_<job>.log`.
    pub fn file_name(port_path: &str, job_id: &str, started_at: DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}.log",
            port_label(port_path),
            started_at.format("%Y%m%d_%H%M%S"),
            short_job_id(job_id)
        )
    }

    /// Writes the log and returns its path. Never overwrites: a taken name
    /// gets a numeric suffix.
    pub fn write(
        &self,
        port_path: &str,
        job_id: &str,
        started_at: DateTime<Utc>,
        lines: &[String],
    ) -> Result<PathBuf, StorageError> {
        std::fs::create_dir_all(&self.directory).map_err(|e| StorageError::CreateDirectory {
            path: self.directory.clone(),
            source: e,
        })?;

        let name = Self::file_name(port_path, job_id, started_at);
        let base = name.trim_end_matches(".log");
        let mut content = format!(
            "# job {}\n# port {}\n# started {}\n",
            job_id,
            port_path,
            started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }

        for counter in 1..=100 {
            let candidate = if counter == 1 {
                self.directory.join(&name)
            } else {
                self.directory.join(format!("{}_{}.log", base, counter))
            };

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())
                        .map_err(|e| StorageError::WriteFile {
                            path: candidate.clone(),
                            source: e,
                        })?;
                    return Ok(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(StorageError::WriteFile {
                        path: candidate,
                        source: e,
                    })
                }
            }
        }

        Err(StorageError::WriteFile {
            path: self.directory.join(&name),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "no free session log name",
            ),
        })
    }
}
