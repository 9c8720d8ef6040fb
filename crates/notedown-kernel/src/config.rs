//! Kernel client configuration and per-request options.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Overrides the keepalive in seconds; `0` runs kernels one-shot.
pub const KEEPALIVE_ENV: &str = "NOTEDOWN_KERNEL_KEEPALIVE";
/// Overrides the directory holding transport files.
pub const RUNTIME_DIR_ENV: &str = "NOTEDOWN_RUNTIME_DIR";

// ============================================================================
// Keepalive
// ============================================================================

/// How long an idle kernel stays alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    Seconds(u64),
    /// No daemon; each execution runs in a fresh process.
    OneShot,
}

impl Default for Keepalive {
    fn default() -> Self {
        Keepalive::Seconds(Self::DEFAULT_SECS)
    }
}

impl Keepalive {
    pub const DEFAULT_SECS: u64 = 300;

    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Keepalive::OneShot
        } else {
            Keepalive::Seconds(secs)
        }
    }

    /// Interpret a document-level `daemon` value: `true` or `null` keep the
    /// default, `false` or `0` mean one-shot, a number is seconds.
    pub fn from_option(value: Option<&Value>) -> Option<Self> {
        match value? {
            Value::Bool(true) | Value::Null => Some(Keepalive::default()),
            Value::Bool(false) => Some(Keepalive::OneShot),
            Value::Number(n) => n.as_u64().map(Self::from_secs),
            Value::String(s) => s.trim().parse().ok().map(Self::from_secs),
            _ => None,
        }
    }

    /// Idle timeout handed to the kernel.
    pub fn timeout_secs(self) -> u64 {
        match self {
            Keepalive::Seconds(secs) => secs,
            Keepalive::OneShot => 0,
        }
    }
}

// ============================================================================
// KernelConfig
// ============================================================================

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Directory holding transport files.
    pub runtime_dir: PathBuf,
    /// Log file passed to the kernel with every request.
    pub log_file: PathBuf,
    pub keepalive: Keepalive,
    /// Polls for the transport file after launching a kernel.
    pub connect_attempts: u32,
    /// Base delay between polls; attempt `n` waits `n` times this.
    pub poll_interval: Duration,
    pub debug: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            log_file: default_log_file(),
            keepalive: Keepalive::default(),
            connect_attempts: 19,
            poll_interval: Duration::from_millis(100),
            debug: false,
        }
    }
}

impl KernelConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(RUNTIME_DIR_ENV).filter(|dir| !dir.is_empty()) {
            self.runtime_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup(KEEPALIVE_ENV).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.keepalive = Keepalive::from_secs(secs);
        }
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = path.into();
        self
    }

    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Create the kernel log file (and its directory) if needed.
    pub fn ensure_log_file(&self) -> io::Result<&Path> {
        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        Ok(self.log_file.as_path())
    }
}

/// `$XDG_RUNTIME_DIR/notedown/jt`, or the cache directory where there is no
/// runtime directory.
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("notedown")
        .join("jt")
}

pub fn default_log_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("notedown")
        .join("logs")
        .join("kernel.log")
}

// ============================================================================
// ExecuteOptions
// ============================================================================

/// Options for one execution, sent to the kernel under `options`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub quiet: bool,
    /// Notebook the kernel executes; defaults to the input itself.
    #[serde(skip)]
    pub notebook: Option<PathBuf>,
    /// Overrides the configured keepalive for this document.
    #[serde(skip)]
    pub keepalive: Option<Keepalive>,
    /// Shut down any running kernel before executing.
    #[serde(skip)]
    pub restart: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecuteOptions {
    /// Read the document-level `daemon` and `daemon-restart` keys of an
    /// `execute` metadata block.
    pub fn from_document(execute: &Map<String, Value>) -> Self {
        Self {
            keepalive: Keepalive::from_option(execute.get("daemon")),
            restart: execute
                .get("daemon-restart")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ..Self::default()
        }
    }

    /// The `options` object of an execute request for `input`.
    pub fn to_request_options(
        &self,
        input: &Path,
        log_file: &Path,
    ) -> Result<Map<String, Value>, serde_json::Error> {
        let notebook = self.notebook.as_deref().unwrap_or(input);
        let mut options = match serde_json::to_value(self)? {
            Value::Object(options) => options,
            _ => Map::new(),
        };
        options.insert(
            "target".to_string(),
            serde_json::json!({
                "input": input.to_string_lossy(),
                "notebook": notebook.to_string_lossy(),
            }),
        );
        options.insert(
            "log".to_string(),
            Value::String(log_file.to_string_lossy().into_owned()),
        );
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_keepalive_from_option() {
        assert_eq!(Keepalive::from_option(None), None);
        assert_eq!(
            Keepalive::from_option(Some(&json!(true))),
            Some(Keepalive::Seconds(300))
        );
        assert_eq!(
            Keepalive::from_option(Some(&json!(false))),
            Some(Keepalive::OneShot)
        );
        assert_eq!(
            Keepalive::from_option(Some(&json!(60))),
            Some(Keepalive::Seconds(60))
        );
        assert_eq!(
            Keepalive::from_option(Some(&json!(0))),
            Some(Keepalive::OneShot)
        );
        assert_eq!(Keepalive::OneShot.timeout_secs(), 0);
    }

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.keepalive, Keepalive::Seconds(300));
        assert_eq!(config.connect_attempts, 19);
        assert!(config.runtime_dir.ends_with("notedown/jt"));
        assert!(config.log_file.ends_with("kernel.log"));
    }

    #[test]
    fn test_overrides() {
        let config = KernelConfig::default().with_overrides(|key| match key {
            RUNTIME_DIR_ENV => Some("/tmp/nd-runtime".to_string()),
            KEEPALIVE_ENV => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/nd-runtime"));
        assert_eq!(config.keepalive, Keepalive::OneShot);

        let untouched = KernelConfig::default().with_overrides(|_| Some("junk".to_string()));
        assert_eq!(untouched.keepalive, Keepalive::Seconds(300));
    }

    #[test]
    fn test_ensure_log_file() {
        let temp = TempDir::new().unwrap();
        let config = KernelConfig::default().with_log_file(temp.path().join("logs/kernel.log"));
        let path = config.ensure_log_file().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_execute_options_from_document() {
        let execute = json!({"daemon": 30, "daemon-restart": true});
        let options = ExecuteOptions::from_document(execute.as_object().unwrap());
        assert_eq!(options.keepalive, Some(Keepalive::Seconds(30)));
        assert!(options.restart);
    }

    #[test]
    fn test_request_options_carry_target_and_log() {
        let mut options = ExecuteOptions {
            quiet: true,
            notebook: Some(PathBuf::from("/d/doc.ipynb")),
            ..Default::default()
        };
        options.extra.insert("mode".into(), json!("fast"));
        let map = options
            .to_request_options(Path::new("/d/doc.qmd"), Path::new("/l/kernel.log"))
            .unwrap();
        assert_eq!(map["target"]["notebook"], json!("/d/doc.ipynb"));
        assert_eq!(map["log"], json!("/l/kernel.log"));
        assert_eq!(map["quiet"], json!(true));
        assert_eq!(map["mode"], json!("fast"));
        assert!(!map.contains_key("params"));
    }
}
