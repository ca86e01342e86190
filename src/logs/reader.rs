use crate::config::LogPaths;
use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Options for reading logs
#[derive(Debug, Clone)]
pub struct LogReadOptions {
    /// Number of lines to read from the end of each file
    pub lines: usize,
    /// Optional filter pattern (simple substring match)
    pub filter: Option<String>,
}

impl Default for LogReadOptions {
    fn default() -> Self {
        Self {
            lines: 100,
            filter: None,
        }
    }
}

/// File a log entry was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    Stdout,
    Stderr,
    Combined,
}

/// A single line from a unit's log files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: LogSource,
    pub line: String,
}

impl LogEntry {
    /// Format the entry for display
    pub fn format(&self) -> String {
        match self.source {
            LogSource::Stdout => format!("[OUT] {}", self.line),
            LogSource::Stderr => format!("[ERR] {}", self.line),
            LogSource::Combined => self.line.clone(),
        }
    }
}

/// Read the last `lines` lines of `file_path`
///
/// A missing file reads as empty; the unit may simply not have written yet.
pub async fn read_last_lines(
    file_path: &Path,
    lines: usize,
    source: LogSource,
    filter: Option<&str>,
) -> Result<Vec<LogEntry>> {
    let file = match File::open(file_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(WardenError::LogError(format!(
                "Failed to open log file {}: {}",
                file_path.display(),
                e
            )))
        }
    };

    let mut reader = BufReader::new(file);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(lines.min(1024));
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to read log line: {}", e)))?;
        if read == 0 {
            break;
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();

        if let Some(pattern) = filter {
            if !line.contains(pattern) {
                continue;
            }
        }

        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Ok(tail
        .into_iter()
        .map(|line| LogEntry { source, line })
        .collect())
}

/// Tail of a unit's logs
///
/// The combined file is preferred because it preserves arrival order across
/// both streams; without one, stdout lines are followed by stderr lines.
pub async fn read_logs(paths: &LogPaths, options: &LogReadOptions) -> Result<Vec<LogEntry>> {
    let filter = options.filter.as_deref();

    if let Some(combined) = &paths.combined {
        return read_last_lines(combined, options.lines, LogSource::Combined, filter).await;
    }

    let mut entries = read_last_lines(&paths.out, options.lines, LogSource::Stdout, filter).await?;
    entries.extend(read_last_lines(&paths.err, options.lines, LogSource::Stderr, filter).await?);
    Ok(entries)
}
