//! Reading back the JSON lines written in file mode.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One log event as exposed to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(rename = "msg")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Structured fields other than the message.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// Line layout produced by `tracing_subscriber::fmt::layer().json()`.
#[derive(Deserialize)]
struct JsonLine {
    timestamp: String,
    level: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl From<JsonLine> for LogEntry {
    fn from(mut line: JsonLine) -> Self {
        let message = match line.fields.remove("message") {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        LogEntry {
            level: line.level.to_ascii_lowercase(),
            timestamp: line.timestamp,
            message,
            target: line.target,
            fields: line.fields,
        }
    }
}

/// Parse one line, `None` if it is not a log event.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    serde_json::from_str::<JsonLine>(line).ok().map(LogEntry::from)
}

/// Every parseable entry of the file at `path`, in file order. Lines that
/// are not JSON log events (headers, partial writes) are skipped.
pub fn read_entries(path: &Path) -> io::Result<Vec<LogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        if let Some(entry) = parse_line(&line?) {
            entries.push(entry);
        }
    }
    Ok(entries)
}
