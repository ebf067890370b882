//! Line splitting and classification of subprocess output
//!
//! Stdout lines starting with the marker prefix carry `name=value` results
//! and are captured instead of logged. Everything else becomes a [`LogEntry`].

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Captured `name=value` results of one invocation
pub type OutputVars = HashMap<String, Value>;

static ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z0-9_]+)=(.*)$").expect("static regex"));

/// Stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Stdout,
    Stderr,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of subprocess output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogEntry {
    /// Create an entry stamped with the current time
    pub fn now(origin: Origin, text: impl Into<String>) -> Self {
        Self {
            origin,
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Result of classifying a single line
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Ordinary output, to be logged and echoed
    Entry(LogEntry),
    /// A captured result value
    Var { name: String, value: Value },
}

/// Splits lines into log entries and captured variables
#[derive(Debug, Clone)]
pub struct LineClassifier {
    marker: String,
}

impl LineClassifier {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Classify one line. Only stdout is scanned for variables.
    pub fn classify(&self, origin: Origin, text: String) -> Classified {
        if origin == Origin::Stdout {
            if let Some((name, value)) = parse_marker_line(&self.marker, &text) {
                return Classified::Var { name, value };
            }
        }
        Classified::Entry(LogEntry::now(origin, text))
    }
}

/// Parse `<marker> name=value`, returning `None` for anything else.
///
/// The value is trimmed and parsed as a JSON literal; when that fails the
/// raw string is kept.
pub fn parse_marker_line(marker: &str, line: &str) -> Option<(String, Value)> {
    if marker.is_empty() {
        return None;
    }
    let rest = line.strip_prefix(marker)?;
    let caps = ASSIGNMENT.captures(rest)?;
    let name = caps[1].to_string();
    let raw = caps[2].trim();
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Some((name, value))
}

/// Cancel-safe line reader over a byte stream.
///
/// Partial reads survive a dropped `next_line` future, so it can be polled
/// from `tokio::select!`. Invalid UTF-8 is replaced, `\r\n` endings are
/// stripped and a final unterminated line is still returned.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}
