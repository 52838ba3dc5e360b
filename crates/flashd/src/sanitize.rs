//! Helpers for turning device and job identifiers into safe file-name
//! fragments and short log labels.

/// File-name-safe label for a port path.
///
/// - `/dev/ttyUSB0` → `dev_ttyUSB0`
/// - `/dev/cu.usbserial-0001` → `dev_cu.usbserial-0001`
/// - `\\.\COM10` → `COM10`
pub fn port_label(port_path: &str) -> String {
    let mapped: String = port_path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim_start_matches(['_', '.']);
    if trimmed.is_empty() {
        "port".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First eight characters of a job id, enough to correlate log lines.
pub fn short_job_id(job_id: &str) -> &str {
    match job_id.char_indices().nth(8) {
        Some((idx, _)) => &job_id[..idx],
        None => job_id,
    }
}
