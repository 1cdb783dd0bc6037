use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub(super) mod background_log;
pub(super) mod multilog;

/// One line of the background log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Lowercase level name, e.g. `warn`.
    pub level: String,
    pub target: String,
    pub message: String,

    /// `file:line` of the log statement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Name of the logging thread. Worker threads carry the pool's naming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl From<&log::Record<'_>> for LogEntry {
    fn from(record: &log::Record) -> Self {
        Self {
            timestamp: Utc::now(),
            level: record.level().as_str().to_ascii_lowercase(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            location: record
                .file()
                .zip(record.line())
                .map(|(file, line)| format!("{file}:{line}")),
            thread: thread::current().name().map(str::to_owned),
        }
    }
}
