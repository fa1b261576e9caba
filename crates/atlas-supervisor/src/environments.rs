//! Discovery of Python interpreters an application can be bound to.

use std::path::{Path, PathBuf};

use atlas_process::{Environment, venv_python};

/// Folder names checked inside a project for a local virtualenv.
const LOCAL_VENV_DIRS: &[&str] = &["venv", ".venv", "env", ".env", "virtualenv", "pyenv"];
/// Folders under `$HOME` that conventionally hold named virtualenvs.
const HOME_VENV_ROOTS: &[&str] = &[".virtualenvs", "venvs", "virtualenvs"];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DetectedEnvironment {
    pub name: String,
    pub environment: Environment,
    /// Local to the project directory; the natural default for it.
    pub preferred: bool,
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

fn is_virtualenv(root: &Path) -> bool {
    root.join("pyvenv.cfg").is_file() || is_executable(&venv_python(root))
}

fn local_virtualenvs(project_dir: &Path) -> Vec<DetectedEnvironment> {
    LOCAL_VENV_DIRS
        .iter()
        .map(|name| project_dir.join(name))
        .filter(|root| root.is_dir() && is_executable(&venv_python(root)))
        .map(|root| DetectedEnvironment {
            name: format!(
                "{} (local)",
                root.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
            environment: Environment::Virtualenv(root),
            preferred: true,
        })
        .collect()
}

fn home_virtualenvs(home: &Path) -> Vec<DetectedEnvironment> {
    let mut out = Vec::new();
    for root in HOME_VENV_ROOTS.iter().map(|d| home.join(d)) {
        let Ok(entries) = std::fs::read_dir(&root) else {
            continue;
        };
        let mut found: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && is_virtualenv(p) && is_executable(&venv_python(p)))
            .collect();
        found.sort();
        out.extend(found.into_iter().map(|p| DetectedEnvironment {
            name: p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            environment: Environment::Virtualenv(p),
            preferred: false,
        }));
    }
    out
}

#[derive(serde::Deserialize)]
struct CondaEnvList {
    #[serde(default)]
    envs: Vec<PathBuf>,
}

fn parse_conda_envs(json: &str) -> Vec<DetectedEnvironment> {
    let Ok(list) = serde_json::from_str::<CondaEnvList>(json) else {
        return Vec::new();
    };
    list.envs
        .into_iter()
        .map(|p| DetectedEnvironment {
            name: format!(
                "conda: {}",
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "base".to_string())
            ),
            environment: Environment::Conda(p),
            preferred: false,
        })
        .collect()
}

async fn conda_environments() -> Vec<DetectedEnvironment> {
    let output = tokio::process::Command::new("conda")
        .args(["env", "list", "--json"])
        .stdin(std::process::Stdio::null())
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => parse_conda_envs(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::debug!(status = %out.status, "conda env list failed");
            Vec::new()
        }
        // Not installed.
        Err(e) => {
            tracing::debug!(error = %e, "conda unavailable");
            Vec::new()
        }
    }
}

/// System interpreter first, then project-local virtualenvs, named
/// virtualenvs under `$HOME`, and conda environments.
pub async fn detect_environments(project_dir: Option<&Path>) -> Vec<DetectedEnvironment> {
    let mut out = vec![DetectedEnvironment {
        name: "System Python".to_string(),
        environment: Environment::System,
        preferred: false,
    }];
    if let Some(dir) = project_dir {
        out.extend(local_virtualenvs(dir));
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.extend(home_virtualenvs(&home));
    }
    out.extend(conda_environments().await);

    let mut seen = std::collections::HashSet::new();
    out.retain(|d| seen.insert(d.environment.clone()));
    out
}

/// Environment a newly registered project should default to.
pub fn preferred_environment(found: &[DetectedEnvironment]) -> Environment {
    found
        .iter()
        .find(|d| d.preferred)
        .map(|d| d.environment.clone())
        .unwrap_or_default()
}
