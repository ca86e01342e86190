use crate::config::LogPaths;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lines buffered between the pipe readers and the writer
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Bytes buffered between the pipe readers and the writer
pub const DEFAULT_QUEUE_BYTES: usize = 8 * 1024 * 1024;

/// Longest line kept in one piece; longer output is split into chunks
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// How long `close` lets the pipe readers drain before aborting them
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Out,
    Err,
}

/// One captured line, stamped when it was read from the pipe
#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: Stream,
    pub at: DateTime<Local>,
    pub text: Vec<u8>,
}

/// Counters shared between a sink and whoever reports on it
#[derive(Debug, Default)]
pub struct LogStats {
    dropped: AtomicU64,
    dropped_bytes: AtomicU64,
    split_lines: AtomicU64,
    write_failures: AtomicU64,
    failure_episodes: AtomicU64,
}

impl LogStats {
    /// Lines discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Payload bytes of the discarded lines
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Relaxed)
    }

    /// Lines cut at [`MAX_LINE_BYTES`] before their newline arrived
    pub fn split_lines(&self) -> u64 {
        self.split_lines.load(Ordering::Relaxed)
    }

    /// Failed writes across all destinations
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Times a destination went from healthy to failing; one warning each
    pub fn failure_episodes(&self) -> u64 {
        self.failure_episodes.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Buffered {
    lines: VecDeque<LogLine>,
    bytes: usize,
}

/// Queue bounded by line count and payload bytes, dropping its oldest line on overflow
struct LineQueue {
    buffered: Mutex<Buffered>,
    capacity: usize,
    max_bytes: usize,
    notify: Notify,
    closed: AtomicBool,
    stats: Arc<LogStats>,
}

impl LineQueue {
    fn push(&self, line: LogLine) {
        {
            let mut buffered = self.buffered.lock().unwrap_or_else(|e| e.into_inner());
            while buffered.lines.len() >= self.capacity
                || (buffered.bytes + line.text.len() > self.max_bytes && !buffered.lines.is_empty())
            {
                let Some(oldest) = buffered.lines.pop_front() else {
                    break;
                };
                buffered.bytes -= oldest.text.len();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .dropped_bytes
                    .fetch_add(oldest.text.len() as u64, Ordering::Relaxed);
            }
            buffered.bytes += line.text.len();
            buffered.lines.push_back(line);
        }
        self.notify.notify_one();
    }

    fn take_all(&self) -> VecDeque<LogLine> {
        let mut buffered = self.buffered.lock().unwrap_or_else(|e| e.into_inner());
        buffered.bytes = 0;
        std::mem::take(&mut buffered.lines)
    }
}

/// Captures a unit's stdout and stderr into its log files
///
/// Pipe readers never wait on disk: they push into a bounded queue and a
/// single writer task drains it, so the combined file interleaves lines in
/// arrival order. One sink serves every run of a unit; each new child is
/// attached with [`LogSink::attach`].
pub struct LogSink {
    unit: String,
    queue: Arc<LineQueue>,
    writer: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
}

impl LogSink {
    pub fn open(
        unit: &str,
        paths: &LogPaths,
        timestamp_format: Option<String>,
        max_size: Option<u64>,
        stats: Arc<LogStats>,
    ) -> Self {
        Self::with_capacity(
            unit,
            paths,
            timestamp_format,
            max_size,
            stats,
            DEFAULT_QUEUE_CAPACITY,
            DEFAULT_QUEUE_BYTES,
        )
    }

    /// A sink buffering at most `capacity` lines and `max_bytes` of line payload
    pub fn with_capacity(
        unit: &str,
        paths: &LogPaths,
        timestamp_format: Option<String>,
        max_size: Option<u64>,
        stats: Arc<LogStats>,
        capacity: usize,
        max_bytes: usize,
    ) -> Self {
        let queue = Arc::new(LineQueue {
            buffered: Mutex::new(Buffered::default()),
            capacity: capacity.max(1),
            max_bytes: max_bytes.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            stats,
        });

        let writer = LineWriter {
            unit: unit.to_string(),
            out: Destination::new(paths.out.clone(), max_size),
            err: Destination::new(paths.err.clone(), max_size),
            combined: paths
                .combined
                .clone()
                .map(|path| Destination::new(path, max_size)),
            timestamp_format,
        };

        Self {
            unit: unit.to_string(),
            writer: Some(tokio::spawn(writer.run(queue.clone()))),
            queue,
            readers: Vec::new(),
        }
    }

    /// Start draining a child's output pipes
    pub fn attach<O, E>(&mut self, stdout: Option<O>, stderr: Option<E>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        self.readers.retain(|reader| !reader.is_finished());

        if let Some(stdout) = stdout {
            self.readers
                .push(tokio::spawn(read_pipe(stdout, Stream::Out, self.queue.clone())));
        }
        if let Some(stderr) = stderr {
            self.readers
                .push(tokio::spawn(read_pipe(stderr, Stream::Err, self.queue.clone())));
        }
    }

    /// Queue one line, stamped now
    pub fn push(&self, stream: Stream, text: impl Into<Vec<u8>>) {
        self.queue.push(LogLine {
            stream,
            at: Local::now(),
            text: text.into(),
        });
    }

    /// Let the readers drain, flush what is queued and wait for the writer
    ///
    /// A reader whose pipe is still held open by some other process is
    /// aborted after a short grace.
    pub async fn close(mut self) {
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                reader.abort();
            }
        }

        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();

        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!(unit = %self.unit, error = %e, "log writer task ended abnormally");
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }
}

/// Split a pipe into lines of at most [`MAX_LINE_BYTES`]
async fn read_pipe<R>(pipe: R, stream: Stream, queue: Arc<LineQueue>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();

    let emit = |text: Vec<u8>| {
        queue.push(LogLine {
            stream,
            at: Local::now(),
            text,
        })
    };

    loop {
        let available = match reader.fill_buf().await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => break,
        };

        let room = MAX_LINE_BYTES - line.len();
        let window = &available[..available.len().min(room)];

        match window.iter().position(|&b| b == b'\n') {
            Some(end) => {
                line.extend_from_slice(&window[..end]);
                reader.consume(end + 1);
                emit(std::mem::take(&mut line));
            }
            None => {
                let taken = window.len();
                line.extend_from_slice(window);
                reader.consume(taken);
                if line.len() >= MAX_LINE_BYTES {
                    queue.stats.split_lines.fetch_add(1, Ordering::Relaxed);
                    emit(std::mem::take(&mut line));
                }
            }
        }
    }

    // unterminated last line
    if !line.is_empty() {
        emit(line);
    }
}

struct LineWriter {
    unit: String,
    out: Destination,
    err: Destination,
    combined: Option<Destination>,
    timestamp_format: Option<String>,
}

impl LineWriter {
    async fn run(mut self, queue: Arc<LineQueue>) {
        loop {
            let batch = queue.take_all();

            if batch.is_empty() {
                if queue.closed.load(Ordering::Acquire) {
                    break;
                }
                queue.notify.notified().await;
                continue;
            }

            for line in batch {
                let entry = self.format(&line);
                let stats = &queue.stats;

                let target = match line.stream {
                    Stream::Out => &mut self.out,
                    Stream::Err => &mut self.err,
                };
                target.write(&self.unit, &entry, stats).await;

                if let Some(combined) = self.combined.as_mut() {
                    combined.write(&self.unit, &entry, stats).await;
                }
            }
        }
    }

    /// `<timestamp>: <line>` when a format is set, the raw line otherwise
    fn format(&self, line: &LogLine) -> Vec<u8> {
        let mut entry = Vec::with_capacity(line.text.len() + 32);
        if let Some(format) = &self.timestamp_format {
            let mut stamp = String::new();
            // chrono reports bad format items through fmt::Error
            if write!(stamp, "{}", line.at.format(format)).is_ok() {
                entry.extend_from_slice(stamp.as_bytes());
                entry.extend_from_slice(b": ");
            }
        }
        entry.extend_from_slice(&line.text);
        entry.push(b'\n');
        entry
    }
}

/// One log file, reopened lazily after failures
struct Destination {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    max_size: Option<u64>,
    /// Inside a failure episode; cleared by the next successful write
    failing: bool,
}

impl Destination {
    fn new(path: PathBuf, max_size: Option<u64>) -> Self {
        Self {
            path,
            file: None,
            size: 0,
            max_size,
            failing: false,
        }
    }

    async fn write(&mut self, unit: &str, entry: &[u8], stats: &LogStats) {
        match self.try_write(entry).await {
            Ok(()) => {
                if self.failing {
                    info!(unit, path = %self.path.display(), "log destination recovered");
                    self.failing = false;
                }
            }
            Err(e) => {
                stats.write_failures.fetch_add(1, Ordering::Relaxed);
                self.file = None;
                if !self.failing {
                    stats.failure_episodes.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        unit,
                        path = %self.path.display(),
                        error = %e,
                        "failed to write log line"
                    );
                    self.failing = true;
                }
            }
        }
    }

    async fn try_write(&mut self, entry: &[u8]) -> std::io::Result<()> {
        if let Some(max) = self.max_size {
            if self.size > 0 && self.size + entry.len() as u64 > max {
                self.rotate().await?;
            }
        }

        if self.file.is_none() {
            let (file, size) = open_append(&self.path).await?;
            self.file = Some(file);
            self.size = size;
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(entry).await?;
            file.flush().await?;
            self.size += entry.len() as u64;
        }
        Ok(())
    }

    /// Move the current file aside under a timestamped name
    async fn rotate(&mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("log");
        let stamp = Local::now().format("%Y%m%d-%H%M%S%.3f");
        let rotated = self.path.with_file_name(format!("{}-{}.log", stem, stamp));

        match tokio::fs::rename(&self.path, &rotated).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.size = 0;
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}
