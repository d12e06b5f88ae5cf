//! Configuration loading for sqlrun
//!
//! Values come from built-in defaults, an optional TOML file and then
//! `SQLRUN_*` environment variables (nested keys use `__`, for example
//! `SQLRUN_WORKER__BACKEND=duckdb`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SqlRunError};

/// Default ceiling on simultaneously open sessions
pub const DEFAULT_MAX_SESSIONS: usize = 12;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "sqlrun.toml";

/// Name of the bundled worker executable
pub const WORKER_BINARY: &str = "sqlrun-worker";

/// Top-level configuration, read once per process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker process settings
    pub worker: WorkerSettings,
    /// Data source handed to the worker in CONNECT
    pub dsn: String,
    /// Row cap sent with every EXECUTE
    pub max_rows: Option<usize>,
    /// Global ceiling on open sessions
    pub max_sessions: usize,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable JSON log format
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            dsn: ":memory:".into(),
            max_rows: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

/// Worker process settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker executable; `None` means the bundled `sqlrun-worker`
    pub program: Option<PathBuf>,
    /// Extra arguments appended after the backend flag
    pub args: Vec<String>,
    /// Engine the worker runs against
    pub backend: Backend,
}

impl WorkerSettings {
    /// Resolve the executable to spawn.
    ///
    /// Without an explicit program the bundled worker next to the current
    /// executable is preferred, falling back to a PATH lookup.
    pub fn resolve_program(&self) -> PathBuf {
        if let Some(program) = &self.program {
            return program.clone();
        }
        let file_name = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(file_name))
    }

    /// Full argument list passed to the worker
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 2);
        if let Some(flag) = self.backend.worker_flag() {
            args.push("--backend".to_string());
            args.push(flag.to_string());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Worker engine selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-memory engine seeded with sample tables
    #[default]
    Mock,
    /// Embedded DuckDB opened at the DSN path
    Duckdb,
    /// Any protocol-compatible executable; no backend flag is passed
    External,
}

impl Backend {
    fn worker_flag(&self) -> Option<&'static str> {
        match self {
            Backend::Mock => Some("mock"),
            Backend::Duckdb => Some("duckdb"),
            Backend::External => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Mock => write!(f, "mock"),
            Backend::Duckdb => write!(f, "duckdb"),
            Backend::External => write!(f, "external"),
        }
    }
}

impl FromStr for Backend {
    type Err = SqlRunError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(Backend::Mock),
            "duckdb" => Ok(Backend::Duckdb),
            "external" | "odbc" => Ok(Backend::External),
            other => Err(SqlRunError::Config(format!(
                "unknown backend '{}' (expected mock, duckdb or external)",
                other
            ))),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file plus the environment.
    ///
    /// An explicit `path` must exist; the default `sqlrun.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path.to_path_buf()).required(true),
            None => config::File::with_name(&env_or_default("SQLRUN_CONFIG", DEFAULT_CONFIG_FILE))
                .required(false),
        };
        let config: AppConfig = config::Config::builder()
            .add_source(file)
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work at runtime
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(SqlRunError::Config("max_sessions must be at least 1".into()));
        }
        if self.max_rows == Some(0) {
            return Err(SqlRunError::Config("max_rows must be at least 1".into()));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("SQLRUN")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(" ")
        .with_list_parse_key("worker.args")
}

/// Get environment variable with default
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.max_sessions, 12);
        assert_eq!(config.dsn, ":memory:");
        assert_eq!(config.worker.backend, Backend::Mock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("DuckDB".parse::<Backend>().unwrap(), Backend::Duckdb);
        assert_eq!("odbc".parse::<Backend>().unwrap(), Backend::External);
        let err = "sqlite".parse::<Backend>().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_command_args() {
        let mut worker = WorkerSettings {
            args: vec!["--slow-query-ms".into(), "50".into()],
            ..Default::default()
        };
        assert_eq!(
            worker.command_args(),
            vec!["--backend", "mock", "--slow-query-ms", "50"]
        );
        worker.backend = Backend::External;
        assert_eq!(worker.command_args(), vec!["--slow-query-ms", "50"]);
    }

    #[test]
    fn test_explicit_program_wins() {
        let worker = WorkerSettings {
            program: Some(PathBuf::from("/opt/bridge/odbc-worker")),
            ..Default::default()
        };
        assert_eq!(worker.resolve_program(), PathBuf::from("/opt/bridge/odbc-worker"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("sqlrun-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sqlrun.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "dsn = \"warehouse.duckdb\"\nmax_rows = 500\n\n[worker]\nbackend = \"duckdb\"\nargs = [\"--connect-delay-ms\", \"0\"]"
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dsn, "warehouse.duckdb");
        assert_eq!(config.max_rows, Some(500));
        assert_eq!(config.worker.backend, Backend::Duckdb);
        assert_eq!(config.worker.args.len(), 2);
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/sqlrun.toml"))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_validate_rejects_zero_sessions() {
        let config = AppConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
