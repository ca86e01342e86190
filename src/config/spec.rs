use super::{Args, ProcessConfig, Size};
use crate::process::RestartPolicy;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Validated, immutable description of one managed unit
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    /// Executable path, or a bare name resolved through PATH at spawn time
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Overlay applied on top of the supervisor's own environment
    pub env: BTreeMap<String, String>,
    /// Memory ceiling in bytes; exceeding it forces a restart
    pub max_memory: Option<u64>,
    pub restart: RestartPolicy,
    pub logs: LogPaths,
    /// chrono format string for line timestamps, `None` for raw lines
    pub timestamp_format: Option<String>,
    pub kill_signal: Signal,
    pub kill_timeout: Duration,
    pub listen_timeout: Duration,
    pub ready_port: Option<u16>,
    pub stop_exit_codes: Vec<i32>,
    pub log_max_size: Option<u64>,
}

impl ProcessSpec {
    pub fn autorestart(&self) -> bool {
        self.restart.enabled
    }
}

/// Log destinations for a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub out: PathBuf,
    pub err: PathBuf,
    pub combined: Option<PathBuf>,
}

/// Paths that validation resolves relative values against
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Working directory used when a record names none
    pub base_dir: PathBuf,
    /// Directory for default log file names
    pub log_dir: PathBuf,
}

/// A single violated constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub unit: String,
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = if self.unit.is_empty() { "<unnamed>" } else { &self.unit };
        write!(f, "[{}] {}: {}", unit, self.field, self.message)
    }
}

/// Every constraint violated by a set of unit records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors {
    pub violations: Vec<ConfigViolation>,
}

impl ConfigErrors {
    /// Whether any violation concerns `field`
    pub fn has(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Configuration validation failed with {} error(s):",
            self.violations.len()
        )?;
        for violation in &self.violations {
            write!(f, "\n  - {}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

struct Collector<'a> {
    unit: &'a str,
    violations: &'a mut Vec<ConfigViolation>,
}

impl Collector<'_> {
    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.violations.push(ConfigViolation {
            unit: self.unit.to_string(),
            field,
            message: message.into(),
        });
    }
}

/// Validate raw records into specs, reporting every violation at once
pub fn validate(
    records: &[ProcessConfig],
    ctx: &ValidationContext,
) -> std::result::Result<Vec<ProcessSpec>, ConfigErrors> {
    let mut violations = Vec::new();
    let mut specs = Vec::with_capacity(records.len());
    let mut seen = HashSet::new();

    for record in records {
        let mut c = Collector {
            unit: &record.name,
            violations: &mut violations,
        };

        if record.name.trim().is_empty() {
            c.push("name", "must not be empty");
        } else if !seen.insert(record.name.clone()) {
            c.push("name", "duplicate unit name");
        }

        if let Some(spec) = validate_record(record, ctx, &mut c) {
            specs.push(spec);
        }
    }

    if violations.is_empty() {
        Ok(specs)
    } else {
        Err(ConfigErrors { violations })
    }
}

fn validate_record(
    record: &ProcessConfig,
    ctx: &ValidationContext,
    c: &mut Collector<'_>,
) -> Option<ProcessSpec> {
    let before = c.violations.len();

    let command = record.script.trim().to_string();
    if command.is_empty() {
        c.push("script", "command must not be empty");
    }

    let args = match &record.args {
        Args::List(list) => list.clone(),
        Args::Line(line) => split_args(line).unwrap_or_else(|e| {
            c.push("args", e);
            Vec::new()
        }),
    };

    let cwd = match &record.cwd {
        Some(dir) if dir.is_relative() => ctx.base_dir.join(dir),
        Some(dir) => dir.clone(),
        None => ctx.base_dir.clone(),
    };
    check_cwd(&cwd, c);

    if record.instances == 0 {
        c.push("instances", "must be at least 1");
    }

    if record.max_restarts == 0 {
        c.push("max_restarts", "must be at least 1");
    }

    let max_memory = record
        .max_memory_restart
        .as_ref()
        .and_then(|size| size_to_bytes(size, "max_memory_restart", c));

    let log_max_size = record
        .log_max_size
        .as_ref()
        .and_then(|size| size_to_bytes(size, "log_max_size", c));

    let mut env = BTreeMap::new();
    for (key, value) in &record.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            c.push("env", format!("invalid variable name '{}'", key));
            continue;
        }
        env.insert(key.clone(), value.to_string());
    }

    let kill_signal = Signal::from_str(&record.kill_signal).unwrap_or_else(|_| {
        c.push(
            "kill_signal",
            format!("unknown signal '{}'", record.kill_signal),
        );
        Signal::SIGTERM
    });

    if c.violations.len() > before {
        return None;
    }

    let resolve = |path: &Path| -> PathBuf {
        if path.is_relative() {
            cwd.join(path)
        } else {
            path.to_path_buf()
        }
    };

    let logs = LogPaths {
        out: record
            .out_file
            .as_deref()
            .map(resolve)
            .unwrap_or_else(|| ctx.log_dir.join(format!("{}-out.log", record.name))),
        err: record
            .error_file
            .as_deref()
            .map(resolve)
            .unwrap_or_else(|| ctx.log_dir.join(format!("{}-error.log", record.name))),
        combined: record.log_file.as_deref().map(resolve),
    };

    let timestamp_format = match &record.log_date_format {
        Some(format) => Some(moment_to_strftime(format)),
        None if record.time => Some("%Y-%m-%dT%H:%M:%S".to_string()),
        None => None,
    };

    let restart = RestartPolicy {
        enabled: record.autorestart,
        max_restarts: record.max_restarts,
        window: Duration::from_millis(record.restart_window),
        base_delay: Duration::from_millis(record.restart_delay),
        max_delay: Duration::from_millis(record.max_restart_delay),
        min_uptime: Duration::from_millis(record.min_uptime),
    };

    Some(ProcessSpec {
        name: record.name.clone(),
        command,
        args,
        cwd,
        env,
        max_memory,
        restart,
        logs,
        timestamp_format,
        kill_signal,
        kill_timeout: Duration::from_millis(record.kill_timeout),
        listen_timeout: Duration::from_millis(record.listen_timeout),
        ready_port: record.ready_port,
        stop_exit_codes: record.stop_exit_codes.clone(),
        log_max_size,
    })
}

fn check_cwd(cwd: &Path, c: &mut Collector<'_>) {
    if !cwd.exists() {
        c.push(
            "cwd",
            format!("working directory does not exist: {}", cwd.display()),
        );
    } else if !cwd.is_dir() {
        c.push(
            "cwd",
            format!("working directory is not a directory: {}", cwd.display()),
        );
    } else if let Err(e) = std::fs::read_dir(cwd) {
        c.push(
            "cwd",
            format!("working directory is not readable: {}: {}", cwd.display(), e),
        );
    }
}

fn size_to_bytes(size: &Size, field: &'static str, c: &mut Collector<'_>) -> Option<u64> {
    let parsed = match size {
        Size::Bytes(n) if *n > 0 => Ok(*n as u64),
        Size::Bytes(n) => Err(format!("must be positive, got {}", n)),
        Size::Text(text) => parse_memory(text),
    };

    parsed.map_err(|e| c.push(field, e)).ok()
}

/// Parse a pm2 size such as `1G`, `512M`, `100K`, `1.5G` or `2048`
///
/// Suffixes are binary multiples; a trailing `B` is allowed.
pub fn parse_memory(text: &str) -> Result<u64, String> {
    let trimmed = text.trim();
    let upper = trimmed.to_ascii_uppercase();
    let upper = upper.strip_suffix('B').unwrap_or(&upper);

    let (number, multiplier) = match upper.chars().last() {
        Some('K') => (&upper[..upper.len() - 1], 1u64 << 10),
        Some('M') => (&upper[..upper.len() - 1], 1u64 << 20),
        Some('G') => (&upper[..upper.len() - 1], 1u64 << 30),
        Some('T') => (&upper[..upper.len() - 1], 1u64 << 40),
        _ => (upper, 1),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", trimmed))?;

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 1.0 {
        return Err(format!("must be positive, got '{}'", trimmed));
    }

    Ok(bytes as u64)
}

/// Split a shell-style argument string
///
/// Handles whitespace separation, single quotes, double quotes and
/// backslash escapes. No expansion is performed.
pub fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        args.push(current);
    }

    Ok(args)
}

// Longest tokens first so that `YYYY` wins over `YY`
const MOMENT_TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("DD", "%d"),
    ("D", "%-d"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("m", "%-M"),
    ("ss", "%S"),
    ("s", "%-S"),
    ("SSS", "%3f"),
    ("A", "%p"),
    ("a", "%P"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
    ("X", "%s"),
];

/// Convert a moment.js date format (as used by `log_date_format`) to chrono's strftime
///
/// `[text]` is copied literally, unknown characters pass through.
pub fn moment_to_strftime(format: &str) -> String {
    let mut out = String::with_capacity(format.len() * 2);
    let mut rest = format;

    'outer: while !rest.is_empty() {
        if let Some(bracketed) = rest.strip_prefix('[') {
            if let Some(end) = bracketed.find(']') {
                out.push_str(&bracketed[..end].replace('%', "%%"));
                rest = &bracketed[end + 1..];
                continue;
            }
        }

        for (token, replacement) in MOMENT_TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = after;
                continue 'outer;
            }
        }

        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            if ch == '%' {
                out.push_str("%%");
            } else {
                out.push(ch);
            }
        }
        rest = chars.as_str();
    }

    out
}
