//! Action outcomes and exit-code interpretation.
//!
//! A test action always resolves to a [`Status`]: a type tag plus a free-text
//! reason. Statuses travel on the wire as a terminal frame, and map to and
//! from process exit codes so a cooperating test program can report its own
//! result by printing a status line and exiting with the matching code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Base of the canonical exit-code range; `PASSED` exits with this value.
pub const EXIT_CODE_BASE: i32 = 95;

/// Prefix of the status line a cooperating test program may print on stdout,
/// e.g. `RTH-STATUS:passed all 12 checks ok`.
pub const STATUS_LINE_PREFIX: &str = "RTH-STATUS:";

/// The four outcome classes of a test action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StatusKind {
    Passed = 0,
    Failed = 1,
    Error = 2,
    NotRun = 3,
}

impl StatusKind {
    /// Byte used for this kind in a STATUS wire frame.
    pub fn wire_byte(self) -> u8 {
        self as u8
    }

    /// Inverse of [`StatusKind::wire_byte`].
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Passed),
            1 => Some(Self::Failed),
            2 => Some(Self::Error),
            3 => Some(Self::NotRun),
            _ => None,
        }
    }

    /// The canonical process exit code announcing this kind.
    pub fn exit_code(self) -> i32 {
        EXIT_CODE_BASE + self as i32
    }

    /// Inverse of [`StatusKind::exit_code`].
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code - EXIT_CODE_BASE {
            0 => Some(Self::Passed),
            1 => Some(Self::Failed),
            2 => Some(Self::Error),
            3 => Some(Self::NotRun),
            _ => None,
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
            Self::NotRun => write!(f, "not_run"),
        }
    }
}

/// Error returned when a status-kind token cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status kind '{0}'")]
pub struct ParseStatusKindError(String);

impl FromStr for StatusKind {
    type Err = ParseStatusKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            "not_run" => Ok(Self::NotRun),
            other => Err(ParseStatusKindError(other.to_string())),
        }
    }
}

/// A type-tagged action outcome with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub kind: StatusKind,
    pub reason: String,
}

impl Status {
    pub fn new(kind: StatusKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn passed(reason: impl Into<String>) -> Self {
        Self::new(StatusKind::Passed, reason)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(StatusKind::Failed, reason)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(StatusKind::Error, reason)
    }

    pub fn not_run(reason: impl Into<String>) -> Self {
        Self::new(StatusKind::NotRun, reason)
    }

    /// The canonical exit code encoded by this status.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Append the raw exit code to the reason, for unmapped codes.
    pub fn augment_with_exit(mut self, code: i32) -> Self {
        if self.reason.is_empty() {
            self.reason = format!("exit code {code}");
        } else {
            self.reason = format!("{} [exit code {code}]", self.reason);
        }
        self
    }

    /// Render this status as the line a cooperating program would print.
    pub fn to_status_line(&self) -> String {
        if self.reason.is_empty() {
            format!("{STATUS_LINE_PREFIX}{}", self.kind)
        } else {
            format!("{STATUS_LINE_PREFIX}{} {}", self.kind, self.reason)
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.reason)
        }
    }
}

/// Parse one output line as a status line. Returns `None` unless the line
/// starts with [`STATUS_LINE_PREFIX`] and carries a valid kind token.
pub fn parse_status_line(line: &str) -> Option<Status> {
    let rest = line.strip_prefix(STATUS_LINE_PREFIX)?;
    let (kind_token, reason) = match rest.split_once(' ') {
        Some((kind, reason)) => (kind, reason.trim()),
        None => (rest.trim(), ""),
    };
    let kind = kind_token.parse::<StatusKind>().ok()?;
    Some(Status::new(kind, reason))
}

/// Incremental scanner that watches a byte stream for status lines while the
/// stream is being copied elsewhere. Chunks may split lines arbitrarily; the
/// last status line seen wins.
#[derive(Debug, Default)]
pub struct StatusLineScanner {
    partial: Vec<u8>,
    found: Option<Status>,
}

impl StatusLineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of raw output.
    pub fn feed(&mut self, mut chunk: &[u8]) {
        while let Some(nl) = memchr::memchr(b'\n', chunk) {
            self.partial.extend_from_slice(&chunk[..nl]);
            self.scan_partial();
            self.partial.clear();
            chunk = &chunk[nl + 1..];
        }
        self.partial.extend_from_slice(chunk);
    }

    /// Consume the scanner, scanning any unterminated final line.
    pub fn finish(mut self) -> Option<Status> {
        if !self.partial.is_empty() {
            self.scan_partial();
        }
        self.found
    }

    fn scan_partial(&mut self) {
        let line = String::from_utf8_lossy(&self.partial);
        if let Some(status) = parse_status_line(line.trim_end()) {
            self.found = Some(status);
        }
    }
}

/// Exit-code table consulted when a process did not print a status line.
/// Unmapped codes fall back to the default status, augmented with the raw
/// code for diagnosis.
#[derive(Debug, Clone)]
pub struct ExitMap {
    map: HashMap<i32, Status>,
    default: Status,
}

impl ExitMap {
    pub fn new(default: Status) -> Self {
        Self {
            map: HashMap::new(),
            default,
        }
    }

    #[must_use]
    pub fn with(mut self, code: i32, status: Status) -> Self {
        self.map.insert(code, status);
        self
    }

    pub fn status_for(&self, code: i32) -> Status {
        match self.map.get(&code) {
            Some(status) => status.clone(),
            None => self.default.clone().augment_with_exit(code),
        }
    }
}

/// Translate a process exit into a [`Status`].
///
/// A scanned status line must agree with the actual exit code: a process that
/// dies after printing a success line must not be trusted, so a mismatch is
/// an integrity ERROR. Without a status line the exit map decides; without a
/// map, zero passes and anything else fails. `code` is `None` when the
/// process was terminated by a signal.
pub fn interpret_exit(
    code: Option<i32>,
    scanned: Option<&Status>,
    map: Option<&ExitMap>,
) -> Status {
    let Some(code) = code else {
        return Status::error("process terminated by signal");
    };
    if let Some(status) = scanned {
        return if status.exit_code() == code {
            status.clone()
        } else {
            Status::error(format!(
                "exit code {code} does not match reported status '{status}' (expected {})",
                status.exit_code()
            ))
        };
    }
    match map {
        Some(map) => map.status_for(code),
        None if code == 0 => Status::passed("exit code 0"),
        None => Status::failed(format!("exit code {code}")),
    }
}
