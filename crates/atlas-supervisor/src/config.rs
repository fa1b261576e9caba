use std::{ops::Range, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::log_tail::TailOptions;

pub const CONFIG_PATH_ENV: &str = "ATLAS_CONFIG";

const DEFAULT_DATABASE_URL: &str = "sqlite://./applications.db?mode=rwc";
const DEFAULT_PORT_RANGE_START: u16 = 8000;
const DEFAULT_PORT_RANGE_END: u16 = 9000;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_TAIL_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_TAIL_HISTORY_BYTES: u64 = 8 * 1024;
const DEFAULT_TAIL_HISTORY_MAX_LINES: usize = 100;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 10;

/// Settings shared by the supervisor, the port allocator and the log tailer.
///
/// Loaded once at startup and passed explicitly; nothing below reads the
/// environment on its own.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub database_url: String,
    pub port_range_start: u16,
    /// Exclusive.
    pub port_range_end: u16,
    pub stop_timeout_secs: u64,
    /// Interpreter used for applications on the system environment.
    pub python: String,
    pub tail_poll_interval_ms: u64,
    pub tail_history_bytes: u64,
    pub tail_history_max_lines: usize,
    /// 0 disables the background reconciliation loop.
    pub reconcile_interval_secs: u64,
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            python: "python".to_string(),
            tail_poll_interval_ms: DEFAULT_TAIL_POLL_INTERVAL_MS,
            tail_history_bytes: DEFAULT_TAIL_HISTORY_BYTES,
            tail_history_max_lines: DEFAULT_TAIL_HISTORY_MAX_LINES,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            log_dir: None,
        }
    }
}

fn parse_u64(v: Option<String>) -> Option<u64> {
    v.and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_u16(v: Option<String>) -> Option<u16> {
    v.and_then(|v| v.trim().parse::<u16>().ok())
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SupervisorConfig {
    /// Defaults, then the TOML file named by `ATLAS_CONFIG`, then `ATLAS_*` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => {
                let raw = std::fs::read_to_string(path.trim())
                    .with_context(|| format!("read config file {}", path.trim()))?;
                Self::from_toml_str(&raw)
                    .with_context(|| format!("parse config file {}", path.trim()))?
            }
            _ => Self::default(),
        };
        cfg.apply_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies `ATLAS_*` overrides from `get`. Out-of-range numbers are clamped,
    /// unparsable ones ignored.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = non_empty(get("ATLAS_DATABASE_URL")) {
            self.database_url = v;
        }
        if let Some(v) = parse_u16(get("ATLAS_PORT_RANGE_START")) {
            self.port_range_start = v;
        }
        if let Some(v) = parse_u16(get("ATLAS_PORT_RANGE_END")) {
            self.port_range_end = v;
        }
        if let Some(v) = parse_u64(get("ATLAS_STOP_TIMEOUT_SECS")) {
            self.stop_timeout_secs = v;
        }
        if let Some(v) = non_empty(get("ATLAS_PYTHON")) {
            self.python = v;
        }
        if let Some(v) = parse_u64(get("ATLAS_TAIL_POLL_INTERVAL_MS")) {
            self.tail_poll_interval_ms = v;
        }
        if let Some(v) = parse_u64(get("ATLAS_TAIL_HISTORY_BYTES")) {
            self.tail_history_bytes = v;
        }
        if let Some(v) = parse_u64(get("ATLAS_TAIL_HISTORY_MAX_LINES")) {
            self.tail_history_max_lines = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = parse_u64(get("ATLAS_RECONCILE_INTERVAL_SECS")) {
            self.reconcile_interval_secs = v;
        }
        if let Some(v) = non_empty(get("ATLAS_LOG_DIR")) {
            self.log_dir = Some(PathBuf::from(v));
        }

        self.stop_timeout_secs = self.stop_timeout_secs.clamp(1, 60);
        self.tail_poll_interval_ms = self.tail_poll_interval_ms.clamp(50, 10_000);
        self.tail_history_bytes = self.tail_history_bytes.clamp(0, 1024 * 1024);
        self.tail_history_max_lines = self.tail_history_max_lines.clamp(0, 2000);
        self.reconcile_interval_secs = self.reconcile_interval_secs.clamp(0, 3600);
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range_start < atlas_db::registry::MIN_PORT {
            anyhow::bail!(
                "port_range_start must be >= {} (got {})",
                atlas_db::registry::MIN_PORT,
                self.port_range_start
            );
        }
        if self.port_range_start >= self.port_range_end {
            anyhow::bail!(
                "port range is empty: {}..{}",
                self.port_range_start,
                self.port_range_end
            );
        }
        if self.python.trim().is_empty() {
            anyhow::bail!("python interpreter must not be empty");
        }
        Ok(())
    }

    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0)
            .then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(self.tail_poll_interval_ms),
            history_bytes: self.tail_history_bytes,
            history_max_lines: self.tail_history_max_lines,
        }
    }
}
