//! Parsing of flashing-tool console output.

use std::sync::LazyLock;

use regex::Regex;

use super::{FlashErrorKind, FlashProgress};

static RE_CHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Chip (?:is|type:)\s+(ESP[^\s,]+)").unwrap());
static RE_MAC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"MAC:\s*([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})").unwrap()
});
static RE_PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d{1,3})\s*%\)").unwrap());
static RE_VERIFY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)verifying|hash of data verified").unwrap());
static RE_FATAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)a fatal error occurred|^error:").unwrap());
static RE_SYNC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)failed to connect|timed out waiting for packet header|no serial data received|invalid head of packet").unwrap()
});
static RE_PERMISSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permission denied|access is denied").unwrap());
static RE_TIMEOUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed out|timeout").unwrap());

/// Incremental parser over tool output lines.
#[derive(Debug, Default)]
pub struct OutputParser {
    lines: Vec<String>,
    chip: Option<String>,
    mac: Option<String>,
    last_percent: Option<u8>,
    /// Only a `--verify` run reports a verify phase; esptool prints its
    /// hash check either way.
    verify: bool,
    verifying: bool,
    fatal: bool,
}

impl OutputParser {
    pub fn new(verify: bool) -> Self {
        Self {
            verify,
            ..Self::default()
        }
    }

    /// Records one raw line (which may hold several `\r`-separated
    /// segments) and returns the progress changes it carried.
    pub fn feed(&mut self, raw: &str) -> Vec<FlashProgress> {
        let mut changes = Vec::new();
        for segment in raw.split('\r') {
            let line = segment.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(progress) = self.feed_segment(line) {
                changes.push(progress);
            }
            self.lines.push(line.to_string());
        }
        changes
    }

    fn feed_segment(&mut self, line: &str) -> Option<FlashProgress> {
        if RE_FATAL.is_match(line) {
            self.fatal = true;
        }

        if self.mac.is_none() {
            if let Some(caps) = RE_MAC.captures(line) {
                self.mac = Some(caps[1].to_lowercase());
            }
        }

        if self.chip.is_none() {
            if let Some(caps) = RE_CHIP.captures(line) {
                let chip = caps[1].to_string();
                self.chip = Some(chip.clone());
                return Some(FlashProgress::Connected { chip });
            }
        }

        if let Some(caps) = RE_PERCENT.captures(line) {
            let percent = caps[1].parse::<u8>().ok()?.min(100);
            if self.last_percent != Some(percent) {
                self.last_percent = Some(percent);
                return Some(FlashProgress::Writing { percent });
            }
            return None;
        }

        if self.verify && !self.verifying && RE_VERIFY.is_match(line) {
            self.verifying = true;
            return Some(FlashProgress::Verifying);
        }

        None
    }

    pub fn chip(&self) -> Option<&str> {
        self.chip.as_deref()
    }

    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    /// Whether the tool reported a fatal error, regardless of exit status.
    pub fn saw_fatal(&self) -> bool {
        self.fatal
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Classifies a failed run from its output.
pub fn classify_failure(lines: &[String]) -> FlashErrorKind {
    if lines.iter().any(|l| RE_PERMISSION.is_match(l)) {
        FlashErrorKind::PermissionDenied
    } else if lines.iter().any(|l| RE_SYNC.is_match(l)) {
        FlashErrorKind::SyncFailure
    } else if lines.iter().any(|l| RE_FATAL.is_match(l) && RE_TIMEOUT.is_match(l)) {
        FlashErrorKind::Timeout
    } else {
        FlashErrorKind::Unknown
    }
}

/// Most informative line for an error message: the last fatal line,
/// else the last non-empty line.
pub fn failure_detail(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .find(|l| RE_FATAL.is_match(l))
        .or_else(|| lines.iter().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string())
}
