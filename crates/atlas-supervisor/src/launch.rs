use std::{path::PathBuf, process::Stdio};

use anyhow::Context;
use atlas_db::Application;
use atlas_process::{AppType, module_path};

/// Fully resolved command line for one launch of an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

fn server_args(app_type: AppType, target: &str, port: u16) -> Vec<String> {
    let port = format!("--port={port}");
    let host = "--host=0.0.0.0".to_string();
    let module = app_type.server_module().to_string();
    match app_type {
        AppType::Flask => vec!["-m".into(), module, port, host, target.to_string()],
        AppType::Fastapi => vec!["-m".into(), module, target.to_string(), port, host],
    }
}

impl LaunchSpec {
    pub fn for_application(app: &Application, port: u16, system_python: &str) -> Self {
        let target = format!("{}:app", module_path(&app.main_file));
        Self {
            program: app.environment.python_bin(system_python),
            args: server_args(app.app_type, &target, port),
            cwd: app.directory.clone(),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            stdout_log: app.stdout_log(),
            stderr_log: app.stderr_log(),
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawns the server detached in its own session with output appended to
    /// the log files. The caller owns reaping the returned child.
    pub async fn spawn(&self) -> anyhow::Result<tokio::process::Child> {
        if let Some(dir) = self.stdout_log.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create log dir {}", dir.display()))?;
        }
        let stdout = open_append(&self.stdout_log).await?;
        let stderr = open_append(&self.stderr_log).await?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd.spawn().with_context(|| {
            format!(
                "spawn {} (cwd {})",
                self.program.display(),
                self.cwd.display()
            )
        })
    }
}

async fn open_append(path: &std::path::Path) -> anyhow::Result<std::fs::File> {
    let f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log file {}", path.display()))?;
    Ok(f.into_std().await)
}
