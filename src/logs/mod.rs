// Logs module - output capture and tailing

mod reader;
mod sink;

pub use reader::{read_last_lines, read_logs, LogEntry, LogReadOptions, LogSource};
pub use sink::{
    LogLine, LogSink, LogStats, Stream, DEFAULT_QUEUE_BYTES, DEFAULT_QUEUE_CAPACITY, MAX_LINE_BYTES,
};
