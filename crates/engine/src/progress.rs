//! Progress extraction from the encoder's diagnostic stream.
//!
//! ffmpeg announces the input length once (`Duration: 00:01:23.45`) and then
//! rewrites a status line ending in `\r` (`... time=00:00:12.34 ...`). Both
//! line endings are treated as separators.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;

/// One parsed progress update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Completed fraction in `[0, 1]`
    pub fraction: f64,
    /// Encoded media time in seconds
    pub encoded_secs: f64,
    /// Remaining wall time, once it can be estimated
    pub eta: Option<String>,
}

fn duration_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").ok())
        .as_ref()
}

fn time_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").ok())
        .as_ref()
}

fn captured_seconds(re: Option<&Regex>, line: &str) -> Option<f64> {
    let caps = re?.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Seconds announced by a `Duration:` line.
pub fn parse_duration_line(line: &str) -> Option<f64> {
    captured_seconds(duration_re(), line).filter(|d| *d > 0.0)
}

/// Encoded time from a status line's `time=` field.
pub fn parse_time_line(line: &str) -> Option<f64> {
    captured_seconds(time_re(), line)
}

/// Format a remaining time as `MM:SS`, or `HH:MM:SS` past an hour.
pub fn format_eta(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Estimate remaining time from elapsed wall time and completed fraction.
pub fn estimate_eta(elapsed: Duration, fraction: f64) -> Option<String> {
    if fraction <= 0.0 || !fraction.is_finite() {
        return None;
    }
    let remaining = elapsed.as_secs_f64() * (1.0 - fraction) / fraction;
    Some(format_eta(remaining))
}

/// Stateful parser fed one diagnostic line at a time.
#[derive(Debug, Clone, Default)]
pub struct ProgressParser {
    total: Option<f64>,
    /// Caller supplied the total; announcements are ignored
    fixed_total: bool,
}

impl ProgressParser {
    pub fn new(expected_total: Option<f64>) -> Self {
        let total = expected_total.filter(|t| t.is_finite() && *t > 0.0);
        Self {
            total,
            fixed_total: total.is_some(),
        }
    }

    pub fn total(&self) -> Option<f64> {
        self.total
    }

    /// Consume a line; returns an update when it carried encoded time and the
    /// total is known.
    pub fn feed(&mut self, line: &str, elapsed: Duration) -> Option<ProgressUpdate> {
        if !self.fixed_total && self.total.is_none() {
            if let Some(total) = parse_duration_line(line) {
                self.total = Some(total);
                return None;
            }
        }

        let encoded = parse_time_line(line)?;
        let total = self.total?;
        let fraction = (encoded / total).clamp(0.0, 1.0);
        Some(ProgressUpdate {
            fraction,
            encoded_secs: encoded,
            eta: estimate_eta(elapsed, fraction),
        })
    }
}

/// Splits a byte stream into lines on `\r` or `\n`, skipping empty ones.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).to_string());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Any trailing partial line.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        Some(line)
    }
}
