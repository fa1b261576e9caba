use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Registry-assigned application identifier.
pub type AppId = i32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Last status observed by the supervisor. Not necessarily real-time OS truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Running,
    Error,
}

impl AppStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppStatus::Stopped => "stopped",
            AppStatus::Running => "running",
            AppStatus::Error => "error",
        }
    }
}

impl FromStr for AppStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stopped" => Ok(AppStatus::Stopped),
            "running" => Ok(AppStatus::Running),
            "error" => Ok(AppStatus::Error),
            _ => Err(ParseEnumError::new("status", s)),
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime type; selects the server used to launch the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// WSGI application served by waitress.
    Flask,
    /// ASGI application served by uvicorn.
    Fastapi,
}

impl AppType {
    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Flask => "flask",
            AppType::Fastapi => "fastapi",
        }
    }

    /// Python module that serves this application type.
    pub fn server_module(self) -> &'static str {
        match self {
            AppType::Flask => "waitress",
            AppType::Fastapi => "uvicorn",
        }
    }
}

impl FromStr for AppType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flask" => Ok(AppType::Flask),
            "fastapi" => Ok(AppType::Fastapi),
            _ => Err(ParseEnumError::new("app_type", s)),
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(ParseEnumError::new("log level", s)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpreter selection for an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "lowercase")]
pub enum Environment {
    #[default]
    System,
    Virtualenv(PathBuf),
    Conda(PathBuf),
}

impl Environment {
    pub fn kind(&self) -> &'static str {
        match self {
            Environment::System => "system",
            Environment::Virtualenv(_) => "virtualenv",
            Environment::Conda(_) => "conda",
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Environment::System => None,
            Environment::Virtualenv(p) | Environment::Conda(p) => Some(p),
        }
    }

    /// Rebuilds a descriptor from its stored `(type, path)` columns.
    ///
    /// A non-system type without a path degrades to `System`.
    pub fn from_parts(kind: &str, path: Option<&str>) -> Result<Self, ParseEnumError> {
        let path = path.map(str::trim).filter(|p| !p.is_empty());
        match (kind.trim().to_ascii_lowercase().as_str(), path) {
            ("system", _) | ("", _) => Ok(Environment::System),
            ("virtualenv" | "venv", Some(p)) => Ok(Environment::Virtualenv(PathBuf::from(p))),
            ("conda", Some(p)) => Ok(Environment::Conda(PathBuf::from(p))),
            ("virtualenv" | "venv" | "conda", None) => Ok(Environment::System),
            _ => Err(ParseEnumError::new("environment type", kind)),
        }
    }

    /// Interpreter to launch, falling back to `system_python` for the system environment.
    pub fn python_bin(&self, system_python: &str) -> PathBuf {
        match self.path() {
            None => PathBuf::from(system_python),
            Some(root) => venv_python(root),
        }
    }
}

#[cfg(windows)]
pub fn venv_python(root: &Path) -> PathBuf {
    root.join("Scripts").join("python.exe")
}

#[cfg(not(windows))]
pub fn venv_python(root: &Path) -> PathBuf {
    root.join("bin").join("python")
}

/// Converts `main_file` into the dotted module path passed to the server.
///
/// `pkg/server.py` -> `pkg.server`, `api\main.py` -> `api.main`.
pub fn module_path(main_file: &str) -> String {
    let trimmed = main_file.trim().trim_start_matches("./");
    let stem = match trimmed.rfind('.') {
        Some(dot) if !trimmed[dot..].contains(['/', '\\']) => &trimmed[..dot],
        _ => trimmed,
    };
    stem.replace(['/', '\\'], ".")
}
