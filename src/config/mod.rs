// Config module - Ecosystem file loading and normalization

mod spec;

pub use spec::{
    moment_to_strftime, parse_memory, split_args, validate, ConfigErrors, ConfigViolation,
    LogPaths, ProcessSpec, ValidationContext,
};

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default directory for log files when a unit does not name its own
pub const DEFAULT_LOG_DIR: &str = "/tmp/warden/logs";

/// One raw unit record, in the shape of a pm2 ecosystem `apps` entry
///
/// Durations carry pm2's units: milliseconds unless the field says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Unit name (unique identifier)
    #[serde(default)]
    pub name: String,

    /// Executable path or a command resolved through PATH
    #[serde(default, alias = "command")]
    pub script: String,

    /// Arguments, either a list or a single shell-style string
    #[serde(default)]
    pub args: Args,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Number of copies to run; each becomes an independent unit
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Whether to restart automatically on unexpected exit
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Accepted for compatibility, file watching is not supported
    #[serde(default)]
    pub watch: bool,

    /// Memory ceiling, e.g. "1G", "512M" or a byte count
    #[serde(default)]
    pub max_memory_restart: Option<Size>,

    /// Environment overlay merged over the inherited environment
    #[serde(default)]
    pub env: HashMap<String, EnvValue>,

    /// Stderr log file
    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// Stdout log file
    #[serde(default)]
    pub out_file: Option<PathBuf>,

    /// Combined stdout + stderr log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Prefix log lines with a timestamp
    #[serde(default)]
    pub time: bool,

    /// Timestamp format in moment.js tokens, e.g. "YYYY-MM-DD HH:mm:ss Z"
    #[serde(default)]
    pub log_date_format: Option<String>,

    /// Maximum exits tolerated inside the restart window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// Trailing window for counting exits (ms)
    #[serde(default = "default_restart_window")]
    pub restart_window: u64,

    /// Base restart delay (ms)
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,

    /// Upper bound for the exponential restart delay (ms)
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay: u64,

    /// Runs shorter than this count as consecutive failures (ms)
    #[serde(default = "default_min_uptime")]
    pub min_uptime: u64,

    /// Signal sent for a graceful stop
    #[serde(default = "default_kill_signal")]
    pub kill_signal: String,

    /// Grace period before SIGKILL (ms)
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: u64,

    /// Time allowed for the readiness signal (ms)
    #[serde(default = "default_listen_timeout")]
    pub listen_timeout: u64,

    /// TCP port whose successful connect marks the unit as running
    #[serde(default)]
    pub ready_port: Option<u16>,

    /// Exit codes treated as a deliberate stop
    #[serde(default)]
    pub stop_exit_codes: Vec<i32>,

    /// Rotate a log file once it grows past this size
    #[serde(default)]
    pub log_max_size: Option<Size>,
}

/// Arguments in either of pm2's accepted shapes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Args {
    Line(String),
    List(Vec<String>),
}

impl Default for Args {
    fn default() -> Self {
        Args::List(Vec::new())
    }
}

/// A size given either as a byte count or as "1G"-style text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Size {
    Bytes(i64),
    Text(String),
}

/// Environment values may be written as strings, numbers or booleans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for EnvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::Text(s) => write!(f, "{}", s),
            EnvValue::Integer(n) => write!(f, "{}", n),
            EnvValue::Float(n) => write!(f, "{}", n),
            EnvValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

// Default value functions for serde
fn default_instances() -> usize {
    1
}

fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> usize {
    10
}

fn default_restart_window() -> u64 {
    60_000
}

fn default_restart_delay() -> u64 {
    1_000
}

fn default_max_restart_delay() -> u64 {
    60_000
}

fn default_min_uptime() -> u64 {
    1_000
}

fn default_kill_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout() -> u64 {
    1_600
}

fn default_listen_timeout() -> u64 {
    30_000
}

impl ProcessConfig {
    /// A record with every optional field at its default
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Args::default(),
            cwd: None,
            instances: default_instances(),
            autorestart: default_autorestart(),
            watch: false,
            max_memory_restart: None,
            env: HashMap::new(),
            error_file: None,
            out_file: None,
            log_file: None,
            time: false,
            log_date_format: None,
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            restart_delay: default_restart_delay(),
            max_restart_delay: default_max_restart_delay(),
            min_uptime: default_min_uptime(),
            kill_signal: default_kill_signal(),
            kill_timeout: default_kill_timeout(),
            listen_timeout: default_listen_timeout(),
            ready_port: None,
            stop_exit_codes: Vec::new(),
            log_max_size: None,
        }
    }

    /// Expand `$VAR` and `${VAR}` references in paths, arguments and env values
    fn expand_env_vars(&mut self) {
        self.script = expand_env_in_string(&self.script);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }

        self.args = match &self.args {
            Args::Line(line) => Args::Line(expand_env_in_string(line)),
            Args::List(list) => Args::List(list.iter().map(|a| expand_env_in_string(a)).collect()),
        };

        for value in self.env.values_mut() {
            if let EnvValue::Text(s) = value {
                *s = expand_env_in_string(s);
            }
        }

        for path in [&mut self.out_file, &mut self.error_file, &mut self.log_file]
            .into_iter()
            .flatten()
        {
            *path = expand_env_in_path(path);
        }
    }

    /// Split a record with `instances > 1` into independent single-instance records
    ///
    /// Copies are named `name-0`, `name-1`, ... and explicit log files get the
    /// same suffix so that no two units share a file.
    pub fn expand_instances(self) -> Vec<ProcessConfig> {
        if self.instances <= 1 {
            return vec![self];
        }

        (0..self.instances)
            .map(|i| {
                let mut copy = self.clone();
                copy.name = format!("{}-{}", self.name, i);
                copy.instances = 1;
                copy.out_file = self.out_file.as_deref().map(|p| suffix_path(p, i));
                copy.error_file = self.error_file.as_deref().map(|p| suffix_path(p, i));
                copy.log_file = self.log_file.as_deref().map(|p| suffix_path(p, i));
                copy
            })
            .collect()
    }
}

/// A parsed ecosystem file
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    /// Directory for default log paths
    pub log_dir: Option<PathBuf>,
    /// Raw unit records in file order
    pub apps: Vec<ProcessConfig>,
}

#[derive(Deserialize)]
struct FileLayout {
    #[serde(default)]
    log_dir: Option<PathBuf>,
    #[serde(default, alias = "processes")]
    apps: Vec<ProcessConfig>,
}

impl ConfigFile {
    /// Load an ecosystem file (TOML or JSON, chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WardenError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut file = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(WardenError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        for app in &mut file.apps {
            app.expand_env_vars();
        }

        debug!("Loaded {} unit record(s) from {}", file.apps.len(), path.display());
        Ok(file)
    }

    /// Parse TOML contents: `[[apps]]`, `[[processes]]` or one top-level record
    pub fn parse_toml(contents: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        let listed = table.contains_key("apps") || table.contains_key("processes");
        let value = toml::Value::Table(table);
        let layout = if listed {
            value.try_into::<FileLayout>()
        } else {
            value.try_into::<ProcessConfig>().map(|single| FileLayout {
                log_dir: None,
                apps: vec![single],
            })
        }
        .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        Self::from_layout(layout)
    }

    /// Parse JSON contents with the same layouts as TOML
    pub fn parse_json(contents: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        let listed = value
            .as_object()
            .map(|o| o.contains_key("apps") || o.contains_key("processes"))
            .unwrap_or(false);

        let layout = if listed {
            serde_json::from_value::<FileLayout>(value)
        } else {
            serde_json::from_value::<ProcessConfig>(value).map(|single| FileLayout {
                log_dir: None,
                apps: vec![single],
            })
        }
        .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        Self::from_layout(layout)
    }

    fn from_layout(layout: FileLayout) -> Result<Self> {
        if layout.apps.is_empty() {
            return Err(WardenError::InvalidConfig(
                "No unit configuration found in file".to_string(),
            ));
        }
        Ok(Self {
            log_dir: layout.log_dir,
            apps: layout.apps,
        })
    }

    /// Expand instances and validate every record
    ///
    /// All violations across all records are reported together.
    pub fn into_specs(self) -> Result<Vec<ProcessSpec>> {
        let base_dir = std::env::current_dir()?;
        let log_dir = self
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

        let mut records = Vec::new();
        for app in self.apps {
            if app.watch {
                warn!("Unit '{}' sets watch = true; file watching is not supported, ignoring", app.name);
            }
            records.extend(app.expand_instances());
        }

        let ctx = ValidationContext { base_dir, log_dir };
        Ok(validate(&records, &ctx)?)
    }
}

/// Load and validate an ecosystem file in one step
pub fn load_specs(path: &Path) -> Result<Vec<ProcessSpec>> {
    ConfigFile::from_file(path)?.into_specs()
}

/// Expand `$VAR` and `${VAR}`; unknown variables are left untouched
fn expand_env_in_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), std::env::var(name)) {
            (false, Ok(value)) => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

/// `/var/log/app-out.log` -> `/var/log/app-out-2.log`
fn suffix_path(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    path.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_process_config_defaults() {
        let config = ProcessConfig::new("web", "serve");

        assert_eq!(config.instances, 1);
        assert!(config.autorestart);
        assert_eq!(config.max_restarts, 10);
        assert_eq!(config.restart_window, 60_000);
        assert_eq!(config.restart_delay, 1_000);
        assert_eq!(config.kill_signal, "SIGTERM");
        assert_eq!(config.kill_timeout, 1_600);
        assert_eq!(config.listen_timeout, 30_000);
    }

    #[test]
    fn test_parse_json_ecosystem() {
        let json = r#"
            {
                "apps": [{
                    "name": "employee-frontend",
                    "script": "serve",
                    "args": "-s build -l 3001",
                    "cwd": "/var/www/employee-frontend",
                    "instances": 1,
                    "autorestart": true,
                    "watch": false,
                    "max_memory_restart": "1G",
                    "env": { "NODE_ENV": "production", "PORT": 3001 },
                    "error_file": "/var/log/pm2/employee-frontend-error.log",
                    "out_file": "/var/log/pm2/employee-frontend-out.log",
                    "log_file": "/var/log/pm2/employee-frontend-combined.log",
                    "time": true,
                    "log_date_format": "YYYY-MM-DD HH:mm:ss Z"
                }]
            }
        "#;

        let file = ConfigFile::parse_json(json).unwrap();
        assert_eq!(file.apps.len(), 1);

        let app = &file.apps[0];
        assert_eq!(app.name, "employee-frontend");
        assert_eq!(app.script, "serve");
        assert_eq!(app.args, Args::Line("-s build -l 3001".to_string()));
        assert_eq!(app.max_memory_restart, Some(Size::Text("1G".to_string())));
        assert_eq!(app.env.get("PORT"), Some(&EnvValue::Integer(3001)));
        assert!(app.time);
    }

    #[test]
    fn test_parse_toml_single() {
        let toml_content = r#"
            name = "my-app"
            script = "/usr/bin/node"
            args = ["server.js"]
            max_memory_restart = 1048576
        "#;

        let file = ConfigFile::parse_toml(toml_content).unwrap();
        assert_eq!(file.apps.len(), 1);
        assert_eq!(file.apps[0].name, "my-app");
        assert_eq!(file.apps[0].args, Args::List(vec!["server.js".to_string()]));
        assert_eq!(file.apps[0].max_memory_restart, Some(Size::Bytes(1_048_576)));
    }

    #[test]
    fn test_parse_toml_processes_and_log_dir() {
        let toml_content = r#"
            log_dir = "/srv/logs"

            [[processes]]
            name = "app1"
            script = "/usr/bin/node"

            [[processes]]
            name = "app2"
            script = "/usr/bin/python3"
        "#;

        let file = ConfigFile::parse_toml(toml_content).unwrap();
        assert_eq!(file.log_dir, Some(PathBuf::from("/srv/logs")));
        assert_eq!(file.apps.len(), 2);
        assert_eq!(file.apps[1].name, "app2");
    }

    #[test]
    fn test_parse_empty_apps() {
        let result = ConfigFile::parse_json(r#"{ "apps": [] }"#);
        assert!(matches!(result, Err(WardenError::InvalidConfig(_))));
    }

    #[test]
    fn test_expand_instances() {
        let mut config = ProcessConfig::new("api", "/bin/sleep");
        config.instances = 3;
        config.out_file = Some(PathBuf::from("/var/log/api-out.log"));

        let copies = config.expand_instances();
        assert_eq!(copies.len(), 3);
        assert_eq!(copies[0].name, "api-0");
        assert_eq!(copies[2].name, "api-2");
        assert!(copies.iter().all(|c| c.instances == 1));
        assert_eq!(
            copies[1].out_file,
            Some(PathBuf::from("/var/log/api-out-1.log"))
        );
    }

    #[test]
    fn test_expand_env_in_string() {
        std::env::set_var("WARDEN_TEST_ROOT", "/srv/app");

        assert_eq!(expand_env_in_string("$WARDEN_TEST_ROOT/build"), "/srv/app/build");
        assert_eq!(expand_env_in_string("${WARDEN_TEST_ROOT}x"), "/srv/appx");
        assert_eq!(
            expand_env_in_string("$WARDEN_TEST_UNSET_VAR/x"),
            "$WARDEN_TEST_UNSET_VAR/x"
        );
        assert_eq!(expand_env_in_string("cost: 5$"), "cost: 5$");
        assert_eq!(expand_env_in_string("${unterminated"), "${unterminated");
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("ecosystem.yaml");
        fs::write(&config_path, "name: test").unwrap();

        let result = ConfigFile::from_file(&config_path);
        assert!(matches!(result, Err(WardenError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_specs_reports_all_violations() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("ecosystem.json");
        fs::write(
            &config_path,
            r#"{ "apps": [
                { "name": "a", "script": "" },
                { "name": "a", "script": "/bin/true", "max_memory_restart": "0" }
            ] }"#,
        )
        .unwrap();

        match load_specs(&config_path) {
            Err(WardenError::Config(errors)) => assert!(errors.violations.len() >= 3),
            other => panic!("Expected config errors, got {:?}", other.map(|s| s.len())),
        }
    }
}
