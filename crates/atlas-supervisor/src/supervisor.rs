//! Lifecycle control for registered applications.
//!
//! The registry is the single source of truth; nothing about a running process
//! is cached here. Operations on one application are serialised by a
//! per-application lock, and port assignment is serialised globally so two
//! concurrent starts never persist the same port.

use std::{collections::HashMap, fmt, process::ExitStatus, sync::Arc};

use atlas_db::{Application, LogEntry, Registry};
use atlas_process::{AppId, AppStatus, LogLevel};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use crate::{
    config::SupervisorConfig,
    error::{SupervisorError, format_error_chain},
    launch::LaunchSpec,
    log_tail::{LogStream, TailEvent, TailHandle, attach_log_tail},
    port_alloc,
    process_tree::{self, ProcState},
    tunnel::TunnelProvider,
};

type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { port: u16, pid: u32 },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { force_killed: usize },
    NotRunning,
    /// The recorded pid was already gone.
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// No pid recorded; nothing to check.
    Untracked,
    Alive,
    Vanished,
    Zombie,
}

#[derive(Clone)]
pub struct Supervisor {
    registry: Registry,
    config: Arc<SupervisorConfig>,
    tunnel: Option<Arc<dyn TunnelProvider>>,
    locks: Arc<Mutex<HashMap<AppId, Arc<Mutex<()>>>>>,
    allocation: Arc<Mutex<()>>,
}

impl Supervisor {
    pub fn new(registry: Registry, config: Arc<SupervisorConfig>) -> Self {
        Self {
            registry,
            config,
            tunnel: None,
            locks: Arc::new(Mutex::new(HashMap::new())),
            allocation: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_tunnel_provider(mut self, provider: Arc<dyn TunnelProvider>) -> Self {
        self.tunnel = Some(provider);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches the application. Returns `true` if it is running afterwards,
    /// including when it already was.
    pub async fn start(&self, id: AppId) -> bool {
        let _guard = self.lock_app(id).await;
        report("start", id, self.start_locked(id).await)
    }

    /// Terminates the application's process tree. Returns `true` if it is
    /// stopped afterwards, including when it already was.
    pub async fn stop(&self, id: AppId) -> bool {
        let _guard = self.lock_app(id).await;
        report("stop", id, self.stop_locked(id).await)
    }

    /// Stop then start under one lock. No start is attempted if the stop fails.
    pub async fn restart(&self, id: AppId) -> bool {
        let _guard = self.lock_app(id).await;
        report("restart", id, self.restart_locked(id).await)
    }

    /// Reconciles the recorded status with the OS.
    pub async fn check_status(&self, id: AppId) {
        let _guard = self.lock_app(id).await;
        report("check_status", id, self.check_status_locked(id).await);
    }

    /// Stops the application if needed, then removes it and its log entries.
    pub async fn delete(&self, id: AppId) -> bool {
        let guard = self.lock_app(id).await;
        let res = self.delete_locked(id).await;
        drop(guard);
        if res.is_ok() {
            self.locks.lock().await.remove(&id);
        }
        report("delete", id, res)
    }

    /// Runs [`Supervisor::check_status`] for every application with a recorded
    /// pid. Returns the number of records that changed.
    pub async fn reconcile_all(&self) -> usize {
        let apps = match self.registry.list_applications().await {
            Ok(apps) => apps,
            Err(e) => {
                tracing::warn!(error = %e, "reconcile: failed to list applications");
                return 0;
            }
        };

        let mut changed = 0;
        for app in apps.into_iter().filter(|a| a.pid.is_some()) {
            let _guard = self.lock_app(app.id).await;
            match self.check_status_locked(app.id).await {
                Ok(StatusOutcome::Vanished | StatusOutcome::Zombie) => changed += 1,
                Ok(_) | Err(SupervisorError::NotFound(_)) => {}
                Err(e) => tracing::warn!(app_id = app.id, error = %e, "reconcile failed"),
            }
        }
        changed
    }

    /// Newest first.
    pub async fn recent_logs(&self, id: AppId, limit: u64) -> Result<Vec<LogEntry>> {
        Ok(self.registry.recent_logs(id, limit).await?)
    }

    /// Follows one of the application's output files into `sink`.
    pub async fn tail_logs(
        &self,
        id: AppId,
        stream: LogStream,
        sink: mpsc::Sender<TailEvent>,
    ) -> Result<TailHandle> {
        let app = self.load(id).await?;
        let path = match stream {
            LogStream::Stdout => app.stdout_log(),
            LogStream::Stderr => app.stderr_log(),
        };
        Ok(attach_log_tail(path, sink, self.config.tail_options()))
    }

    async fn lock_app(&self, id: AppId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn load(&self, id: AppId) -> Result<Application> {
        self.registry
            .get_application(id)
            .await?
            .ok_or(SupervisorError::NotFound(id))
    }

    /// Appends an entry to the application's log and mirrors it to tracing.
    async fn audit(&self, id: AppId, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(app_id = id, "{message}"),
            LogLevel::Warning => tracing::warn!(app_id = id, "{message}"),
            LogLevel::Error => tracing::error!(app_id = id, "{message}"),
        }
        if let Err(e) = self.registry.append_log(id, level, message).await {
            tracing::warn!(app_id = id, error = %e, "failed to append application log");
        }
    }

    async fn start_locked(&self, id: AppId) -> Result<StartOutcome> {
        let app = self.load(id).await?;
        if app.status == AppStatus::Running {
            self.audit(id, LogLevel::Warning, "Application is already running")
                .await;
            return Ok(StartOutcome::AlreadyRunning);
        }

        let port = self.ensure_port(&app).await?;
        let spec = LaunchSpec::for_application(&app, port, &self.config.python);
        self.audit(
            id,
            LogLevel::Info,
            format!("Running command: {}", spec.command_line()),
        )
        .await;
        self.audit(
            id,
            LogLevel::Info,
            format!("Working directory: {}", spec.cwd.display()),
        )
        .await;

        let child = match spec.spawn().await {
            Ok(child) => child,
            Err(e) => return Err(self.fail_start(id, format_error_chain(&e)).await),
        };
        let Some(pid) = child.id() else {
            return Err(self
                .fail_start(id, "process exited before its pid was read".to_string())
                .await);
        };
        self.watch_exit(id, pid, child);

        if let Err(e) = self.registry.mark_running(id, pid).await {
            // An unrecorded process could never be stopped through the registry.
            let report = process_tree::terminate_tree(pid, self.config.stop_timeout()).await;
            tracing::error!(
                app_id = id,
                pid,
                error = %e,
                survivors = ?report.remaining,
                "failed to record running process; terminated it"
            );
            return Err(e.into());
        }
        self.audit(
            id,
            LogLevel::Info,
            format!("Application started on port {port} with PID {pid}"),
        )
        .await;

        if app.tunnel_enabled {
            self.open_tunnel(id, port).await;
        }
        Ok(StartOutcome::Started { port, pid })
    }

    async fn fail_start(&self, id: AppId, detail: String) -> SupervisorError {
        self.audit(
            id,
            LogLevel::Error,
            format!("Failed to start application: {detail}"),
        )
        .await;
        if let Err(e) = self.registry.mark_error(id).await {
            tracing::warn!(app_id = id, error = %e, "failed to record start failure");
        }
        SupervisorError::SpawnFailed(detail)
    }

    /// Keeps the recorded port if it is still bindable, otherwise assigns the
    /// lowest free one from the configured range.
    async fn ensure_port(&self, app: &Application) -> Result<u16> {
        let _alloc = self.allocation.lock().await;
        let previous = match app.port {
            Some(port) if port_alloc::is_port_free(port) => return Ok(port),
            other => other,
        };

        let range = self.config.port_range();
        let found =
            port_alloc::find_available_port(range.start, range.end, &self.registry, Some(app.id))
                .await?;
        let Some(port) = found else {
            self.audit(
                app.id,
                LogLevel::Error,
                format!("No available ports in range {}-{}", range.start, range.end),
            )
            .await;
            return Err(SupervisorError::PortExhausted {
                start: range.start,
                end: range.end,
            });
        };

        self.registry.set_port(app.id, Some(port)).await?;
        match previous {
            Some(old) => {
                self.audit(
                    app.id,
                    LogLevel::Warning,
                    format!("Port {old} is in use; reassigned to {port}"),
                )
                .await
            }
            None => {
                self.audit(app.id, LogLevel::Info, format!("Assigned port {port}"))
                    .await
            }
        }
        Ok(port)
    }

    async fn stop_locked(&self, id: AppId) -> Result<StopOutcome> {
        let app = self.load(id).await?;
        let pid = match (app.status, app.pid) {
            (AppStatus::Running, Some(pid)) => pid,
            _ => {
                self.registry.mark_stopped(id).await?;
                self.close_tunnel(&app).await;
                self.audit(id, LogLevel::Warning, "Application is not running")
                    .await;
                return Ok(StopOutcome::NotRunning);
            }
        };

        if process_tree::inspect(pid) == ProcState::Gone {
            self.registry.mark_stopped(id).await?;
            self.close_tunnel(&app).await;
            self.audit(
                id,
                LogLevel::Warning,
                format!("Process {pid} no longer exists; marked as stopped"),
            )
            .await;
            return Ok(StopOutcome::Vanished);
        }

        let report = process_tree::terminate_tree(pid, self.config.stop_timeout()).await;
        for err in &report.signal_errors {
            tracing::warn!(app_id = id, pid, error = %err, "signal delivery failed");
        }
        if !report.succeeded() {
            self.audit(
                id,
                LogLevel::Error,
                format!(
                    "Failed to stop application: processes {:?} survived SIGKILL",
                    report.remaining
                ),
            )
            .await;
            return Err(SupervisorError::TerminationFailed {
                pids: report.remaining,
            });
        }
        if !report.force_killed.is_empty() {
            self.audit(
                id,
                LogLevel::Warning,
                format!(
                    "Processes {:?} ignored SIGTERM for {}s and were killed",
                    report.force_killed, self.config.stop_timeout_secs
                ),
            )
            .await;
        }

        self.registry.mark_stopped(id).await?;
        self.close_tunnel(&app).await;
        self.audit(id, LogLevel::Info, "Application stopped").await;
        Ok(StopOutcome::Stopped {
            force_killed: report.force_killed.len(),
        })
    }

    async fn restart_locked(&self, id: AppId) -> Result<StartOutcome> {
        self.stop_locked(id).await?;
        self.start_locked(id).await
    }

    async fn check_status_locked(&self, id: AppId) -> Result<StatusOutcome> {
        let app = self.load(id).await?;
        let Some(pid) = app.pid else {
            return Ok(StatusOutcome::Untracked);
        };

        match process_tree::inspect(pid) {
            ProcState::Alive => Ok(StatusOutcome::Alive),
            ProcState::Zombie => {
                self.registry.mark_error(id).await?;
                self.close_tunnel(&app).await;
                self.audit(
                    id,
                    LogLevel::Error,
                    format!("Process {pid} is a zombie; marked as error"),
                )
                .await;
                Ok(StatusOutcome::Zombie)
            }
            ProcState::Gone => {
                self.registry.mark_stopped(id).await?;
                self.close_tunnel(&app).await;
                self.audit(
                    id,
                    LogLevel::Warning,
                    format!("Process {pid} no longer exists; marked as stopped"),
                )
                .await;
                Ok(StatusOutcome::Vanished)
            }
        }
    }

    async fn delete_locked(&self, id: AppId) -> Result<()> {
        let app = self.load(id).await?;
        if app.pid.is_some() || app.status == AppStatus::Running {
            self.stop_locked(id).await?;
        } else {
            self.close_tunnel(&app).await;
        }
        if !self.registry.delete_application(id).await? {
            return Err(SupervisorError::NotFound(id));
        }
        tracing::info!(app_id = id, name = %app.name, "application deleted");
        Ok(())
    }

    /// Reaps the child and records how it ended, unless the record no longer
    /// points at this pid.
    fn watch_exit(&self, id: AppId, pid: u32, mut child: tokio::process::Child) {
        let sup = self.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(
                        app_id = id,
                        pid,
                        error = %e,
                        "failed to wait on application process"
                    );
                    return;
                }
            };
            tracing::info!(app_id = id, pid, %status, "application process exited");
            match sup.record_exit(id, pid, status).await {
                Ok(()) => {}
                Err(SupervisorError::NotFound(_)) => {
                    sup.locks.lock().await.remove(&id);
                }
                Err(e) => {
                    tracing::warn!(app_id = id, pid, error = %e, "failed to record process exit")
                }
            }
        });
    }

    async fn record_exit(&self, id: AppId, pid: u32, status: ExitStatus) -> Result<()> {
        let _guard = self.lock_app(id).await;
        let app = self.load(id).await?;
        if app.status != AppStatus::Running || app.pid != Some(pid) {
            return Ok(());
        }

        let how = describe_exit(status);
        if status.success() {
            self.registry.mark_stopped(id).await?;
            self.close_tunnel(&app).await;
            self.audit(
                id,
                LogLevel::Warning,
                format!("Process {pid} exited ({how}); marked as stopped"),
            )
            .await;
        } else {
            self.registry.mark_error(id).await?;
            self.close_tunnel(&app).await;
            self.audit(
                id,
                LogLevel::Error,
                format!("Process {pid} crashed ({how}); marked as error"),
            )
            .await;
        }
        Ok(())
    }

    async fn open_tunnel(&self, id: AppId, port: u16) {
        let Some(provider) = &self.tunnel else {
            self.audit(
                id,
                LogLevel::Warning,
                "Tunnel requested but no tunnel provider is configured",
            )
            .await;
            return;
        };
        match provider.connect(port).await {
            Ok(url) => {
                if let Err(e) = self.registry.set_tunnel_url(id, Some(url.clone())).await {
                    tracing::warn!(app_id = id, error = %e, "failed to record tunnel url");
                }
                self.audit(id, LogLevel::Info, format!("Tunnel established at {url}"))
                    .await;
            }
            Err(e) => {
                self.audit(
                    id,
                    LogLevel::Error,
                    format!("Failed to establish tunnel: {}", format_error_chain(&e)),
                )
                .await;
            }
        }
    }

    async fn close_tunnel(&self, app: &Application) {
        let Some(url) = app.tunnel_url.as_deref() else {
            return;
        };
        if let Some(provider) = &self.tunnel
            && let Err(e) = provider.disconnect(url).await
        {
            self.audit(
                app.id,
                LogLevel::Warning,
                format!("Failed to close tunnel {url}: {}", format_error_chain(&e)),
            )
            .await;
        }
        if let Err(e) = self.registry.set_tunnel_url(app.id, None).await {
            tracing::warn!(app_id = app.id, error = %e, "failed to clear tunnel url");
        }
    }
}

fn report<T: fmt::Debug>(op: &'static str, id: AppId, res: Result<T>) -> bool {
    match res {
        Ok(outcome) => {
            tracing::debug!(app_id = id, op, ?outcome, "operation finished");
            true
        }
        Err(e) => {
            tracing::error!(app_id = id, op, code = e.code(), error = %e, "operation failed");
            false
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    match exit_signal(status) {
        Some(sig) => format!("killed by signal {sig}"),
        None => status.to_string(),
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        net::TcpListener,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        sync::OnceLock,
        time::Duration,
    };

    use atlas_db::NewApplication;
    use atlas_migration::{Migrator, MigratorTrait};
    use atlas_process::{AppType, Environment};
    use sea_orm::Database;
    use tempfile::TempDir;

    use super::*;

    static INTERPRETERS: OnceLock<TempDir> = OnceLock::new();

    /// Stand-in virtualenvs whose `bin/python` is a shell script, so tests do
    /// not need Python or any server package installed.
    fn interpreter(name: &str) -> Environment {
        let root = INTERPRETERS.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            write_interpreter(dir.path(), "serving", "echo \"launched $*\"\nexec sleep 30\n");
            write_interpreter(dir.path(), "stubborn", "trap '' TERM\nexec sleep 30\n");
            write_interpreter(dir.path(), "crashing", "sleep 0.3\nexit 3\n");
            write_interpreter(dir.path(), "quitting", "sleep 0.3\nexit 0\n");
            dir
        });
        Environment::Virtualenv(root.path().join(name))
    }

    fn write_interpreter(root: &Path, name: &str, body: &str) {
        let bin = root.join(name).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let py = bin.join("python");
        std::fs::write(&py, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&py, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            stop_timeout_secs: 1,
            tail_poll_interval_ms: 50,
            ..Default::default()
        }
    }

    async fn setup(config: SupervisorConfig) -> Supervisor {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        Supervisor::new(Registry::new(Arc::new(db)), Arc::new(config))
    }

    async fn register(
        sup: &Supervisor,
        app_type: AppType,
        environment: Environment,
        port: Option<u16>,
    ) -> (Application, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.py"), "app = object()\n").unwrap();
        let app = sup
            .registry()
            .create_application(NewApplication {
                name: "demo".to_string(),
                directory: dir.path().to_path_buf(),
                main_file: "server.py".to_string(),
                app_type,
                port,
                environment,
                tunnel_enabled: false,
            })
            .await
            .unwrap();
        (app, dir)
    }

    async fn reload(sup: &Supervisor, id: AppId) -> Application {
        sup.registry().get_application(id).await.unwrap().unwrap()
    }

    async fn messages(sup: &Supervisor, id: AppId) -> Vec<(LogLevel, String)> {
        sup.recent_logs(id, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|l| (l.level, l.message))
            .collect()
    }

    fn reaped_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    async fn wait_exited(pid: u32) -> bool {
        process_tree::wait_for_exit(&[pid], Duration::from_secs(3))
            .await
            .is_empty()
    }

    #[tokio::test]
    async fn start_assigns_port_and_records_pid() {
        let sup = setup(test_config()).await;
        let (app, dir) = register(&sup, AppType::Fastapi, interpreter("serving"), None).await;

        assert!(sup.start(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!(got.status, AppStatus::Running);
        let port = got.port.unwrap();
        let pid = got.pid.unwrap();
        assert!((8000..9000).contains(&port));
        assert!(process_tree::is_alive(pid));

        let logs = messages(&sup, app.id).await;
        assert_eq!(
            logs[0],
            (
                LogLevel::Info,
                format!("Application started on port {port} with PID {pid}")
            )
        );
        assert!(logs.iter().any(|(_, m)| m.starts_with("Running command: ")
            && m.ends_with(&format!("-m uvicorn server:app --port={port} --host=0.0.0.0"))));

        let stdout = dir.path().join("logs").join("stdout.log");
        let mut launched = String::new();
        for _ in 0..40 {
            launched = std::fs::read_to_string(&stdout).unwrap_or_default();
            if !launched.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(
            launched.trim(),
            format!("launched -m uvicorn server:app --port={port} --host=0.0.0.0")
        );

        assert!(sup.stop(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Stopped, None));
        assert_eq!(got.port, Some(port));
        assert!(wait_exited(pid).await);
    }

    async fn wait_for_status(sup: &Supervisor, id: AppId, want: AppStatus) -> Application {
        let mut got = reload(sup, id).await;
        for _ in 0..60 {
            if got.status == want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            got = reload(sup, id).await;
        }
        got
    }

    #[tokio::test]
    async fn crashed_process_is_recorded_as_error() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("crashing"), None).await;

        assert!(sup.start(app.id).await);
        let pid = reload(&sup, app.id).await.pid.unwrap();

        let got = wait_for_status(&sup, app.id, AppStatus::Error).await;
        assert_eq!((got.status, got.pid), (AppStatus::Error, None));
        assert_eq!(
            messages(&sup, app.id).await[0],
            (
                LogLevel::Error,
                format!("Process {pid} crashed (exit code 3); marked as error")
            )
        );

        // Reconciliation leaves the recorded crash alone.
        sup.check_status(app.id).await;
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Error, None));
    }

    #[tokio::test]
    async fn clean_exit_is_recorded_as_stopped() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Fastapi, interpreter("quitting"), None).await;

        assert!(sup.start(app.id).await);
        let pid = reload(&sup, app.id).await.pid.unwrap();

        let got = wait_for_status(&sup, app.id, AppStatus::Stopped).await;
        assert_eq!((got.status, got.pid), (AppStatus::Stopped, None));
        assert_eq!(
            messages(&sup, app.id).await[0],
            (
                LogLevel::Warning,
                format!("Process {pid} exited (exit code 0); marked as stopped")
            )
        );
    }

    #[tokio::test]
    async fn stop_then_check_status_is_always_stopped() {
        let sup = setup(test_config()).await;
        let (live, _d1) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (vanished, _d2) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (failed, _d3) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (idle, _d4) = register(&sup, AppType::Flask, interpreter("serving"), None).await;

        assert!(sup.start(live.id).await);
        sup.registry()
            .mark_running(vanished.id, reaped_pid())
            .await
            .unwrap();
        sup.registry().mark_error(failed.id).await.unwrap();

        for id in [live.id, vanished.id, failed.id, idle.id] {
            assert!(sup.stop(id).await);
            sup.check_status(id).await;
            let got = reload(&sup, id).await;
            assert_eq!((got.status, got.pid), (AppStatus::Stopped, None), "app {id}");
        }
    }

    #[tokio::test]
    async fn concurrent_starts_get_distinct_ports() {
        let sup = setup(test_config()).await;
        let (c, _dc) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (d, _dd) = register(&sup, AppType::Fastapi, interpreter("serving"), None).await;

        let (a, b) = tokio::join!(sup.start(c.id), sup.start(d.id));
        assert!(a && b);
        let c_port = reload(&sup, c.id).await.port.unwrap();
        let d_port = reload(&sup, d.id).await.port.unwrap();
        assert_ne!(c_port, d_port);

        assert!(sup.stop(c.id).await);
        assert!(sup.stop(d.id).await);
    }

    #[tokio::test]
    async fn start_when_running_only_warns() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), Some(8123)).await;
        sup.registry().mark_running(app.id, 4321).await.unwrap();
        let before = messages(&sup, app.id).await.len();

        assert!(sup.start(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid, got.port), (AppStatus::Running, Some(4321), Some(8123)));

        let logs = messages(&sup, app.id).await;
        assert_eq!(logs.len(), before + 1);
        assert_eq!(
            logs[0],
            (LogLevel::Warning, "Application is already running".to_string())
        );
    }

    #[tokio::test]
    async fn stop_treats_vanished_process_as_stopped() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), Some(8124)).await;
        sup.registry()
            .mark_running(app.id, reaped_pid())
            .await
            .unwrap();

        assert!(sup.stop(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Stopped, None));
        let (level, message) = &messages(&sup, app.id).await[0];
        assert_eq!(*level, LogLevel::Warning);
        assert!(message.contains("no longer exists"));
    }

    #[tokio::test]
    async fn stop_on_stopped_application_succeeds() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        sup.registry().mark_error(app.id).await.unwrap();

        assert!(sup.stop(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Stopped, None));
        assert_eq!(
            messages(&sup, app.id).await[0],
            (LogLevel::Warning, "Application is not running".to_string())
        );
    }

    #[tokio::test]
    async fn stop_escalates_when_sigterm_is_ignored() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Fastapi, interpreter("stubborn"), None).await;

        assert!(sup.start(app.id).await);
        let pid = reload(&sup, app.id).await.pid.unwrap();
        // Let the script install its trap before the stop arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(sup.stop(app.id).await);
        assert!(wait_exited(pid).await);
        let logs = messages(&sup, app.id).await;
        assert_eq!(logs[0], (LogLevel::Info, "Application stopped".to_string()));
        assert!(logs.iter().any(|(level, m)| *level == LogLevel::Warning
            && m.contains("ignored SIGTERM")));
    }

    #[tokio::test]
    async fn check_status_reconciles_dead_and_live_pids() {
        let sup = setup(test_config()).await;
        let (gone, _d1) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (alive, _d2) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (idle, _d3) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        sup.registry()
            .mark_running(gone.id, reaped_pid())
            .await
            .unwrap();
        // Our own pid: alive, and never signalled by a status check.
        sup.registry()
            .mark_running(alive.id, std::process::id())
            .await
            .unwrap();

        sup.check_status(gone.id).await;
        sup.check_status(alive.id).await;
        sup.check_status(idle.id).await;

        let got = reload(&sup, gone.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Stopped, None));
        let got = reload(&sup, alive.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Running, Some(std::process::id())));
        let got = reload(&sup, idle.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Stopped, None));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn check_status_flags_zombies_as_errors() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), None).await;

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        for _ in 0..50 {
            if process_tree::inspect(pid) == ProcState::Zombie {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sup.registry().mark_running(app.id, pid).await.unwrap();

        sup.check_status(app.id).await;
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Error, None));
        let (level, message) = &messages(&sup, app.id).await[0];
        assert_eq!(*level, LogLevel::Error);
        assert!(message.contains("zombie"));
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn restart_on_stopped_application_just_starts() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), None).await;

        assert!(sup.restart(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!(got.status, AppStatus::Running);
        assert!(
            !messages(&sup, app.id)
                .await
                .iter()
                .any(|(_, m)| m == "Application stopped")
        );
        assert!(sup.stop(app.id).await);
    }

    #[tokio::test]
    async fn restart_replaces_the_running_process() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Fastapi, interpreter("serving"), None).await;
        assert!(sup.start(app.id).await);
        let first = reload(&sup, app.id).await.pid.unwrap();

        assert!(sup.restart(app.id).await);
        let got = reload(&sup, app.id).await;
        let second = got.pid.unwrap();
        assert_eq!(got.status, AppStatus::Running);
        assert_ne!(first, second);
        assert!(wait_exited(first).await);
        assert!(sup.stop(app.id).await);
    }

    #[tokio::test]
    async fn spawn_failure_marks_error() {
        let sup = setup(test_config()).await;
        let missing = Environment::Virtualenv(PathBuf::from("/nonexistent/atlas-venv"));
        let (app, _dir) = register(&sup, AppType::Flask, missing, None).await;

        assert!(!sup.start(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid), (AppStatus::Error, None));
        let (level, message) = &messages(&sup, app.id).await[0];
        assert_eq!(*level, LogLevel::Error);
        assert!(message.starts_with("Failed to start application: spawn /nonexistent/atlas-venv"));
    }

    #[tokio::test]
    async fn unknown_application_fails_every_operation() {
        let sup = setup(test_config()).await;
        assert!(!sup.start(999).await);
        assert!(!sup.stop(999).await);
        assert!(!sup.restart(999).await);
        assert!(!sup.delete(999).await);
        sup.check_status(999).await;
        assert!(
            sup.tail_logs(999, LogStream::Stdout, mpsc::channel(1).0)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn taken_port_is_reassigned() {
        let sup = setup(test_config()).await;
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        let (app, _dir) =
            register(&sup, AppType::Flask, interpreter("serving"), Some(taken)).await;

        assert!(sup.start(app.id).await);
        let got = reload(&sup, app.id).await;
        let port = got.port.unwrap();
        assert_ne!(port, taken);
        assert!((8000..9000).contains(&port));
        assert!(messages(&sup, app.id).await.iter().any(|(level, m)| {
            *level == LogLevel::Warning
                && *m == format!("Port {taken} is in use; reassigned to {port}")
        }));
        assert!(sup.stop(app.id).await);
    }

    #[tokio::test]
    async fn exhausted_range_refuses_to_start() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        let sup = setup(SupervisorConfig {
            port_range_start: taken,
            port_range_end: taken + 1,
            ..test_config()
        })
        .await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), None).await;

        assert!(!sup.start(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!((got.status, got.pid, got.port), (AppStatus::Stopped, None, None));
        assert_eq!(
            messages(&sup, app.id).await[0],
            (
                LogLevel::Error,
                format!("No available ports in range {taken}-{}", taken + 1)
            )
        );
    }

    #[tokio::test]
    async fn delete_stops_then_removes() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        assert!(sup.start(app.id).await);
        let pid = reload(&sup, app.id).await.pid.unwrap();

        assert!(sup.delete(app.id).await);
        assert!(sup.registry().get_application(app.id).await.unwrap().is_none());
        assert!(sup.recent_logs(app.id, 10).await.unwrap().is_empty());
        assert!(wait_exited(pid).await);
    }

    #[tokio::test]
    async fn reconcile_all_counts_changed_records() {
        let sup = setup(test_config()).await;
        let (a, _d1) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (b, _d2) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        let (c, _d3) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        sup.registry().mark_running(a.id, reaped_pid()).await.unwrap();
        sup.registry().mark_running(b.id, reaped_pid()).await.unwrap();
        sup.registry()
            .mark_running(c.id, std::process::id())
            .await
            .unwrap();

        assert_eq!(sup.reconcile_all().await, 2);
        assert_eq!(reload(&sup, c.id).await.status, AppStatus::Running);
        assert_eq!(sup.reconcile_all().await, 0);
    }

    #[tokio::test]
    async fn tails_application_stdout() {
        let sup = setup(test_config()).await;
        let (app, _dir) = register(&sup, AppType::Flask, interpreter("serving"), None).await;
        assert!(sup.start(app.id).await);

        let (tx, mut rx) = mpsc::channel(16);
        let handle = sup.tail_logs(app.id, LogStream::Stdout, tx).await.unwrap();
        let line = loop {
            let ev = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match ev {
                TailEvent::History(text) | TailEvent::Line { text, .. } => break text,
                TailEvent::Notice(_) => continue,
                TailEvent::Closed { error } => panic!("tail closed: {error:?}"),
            }
        };
        assert!(line.starts_with("launched -m waitress"));

        handle.cancel();
        handle.join().await;
        assert!(sup.stop(app.id).await);
    }

    struct RecordingTunnel {
        calls: std::sync::Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl TunnelProvider for RecordingTunnel {
        async fn connect(&self, port: u16) -> anyhow::Result<String> {
            self.calls.lock().unwrap().push(format!("connect {port}"));
            if self.fail {
                anyhow::bail!("tunnel service unreachable");
            }
            Ok(format!("https://tunnel.test/{port}"))
        }

        async fn disconnect(&self, public_url: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("disconnect {public_url}"));
            Ok(())
        }
    }

    async fn tunnelled(fail: bool) -> (Supervisor, Arc<RecordingTunnel>, Application, TempDir) {
        let tunnel = Arc::new(RecordingTunnel {
            calls: std::sync::Mutex::new(Vec::new()),
            fail,
        });
        let sup = setup(test_config()).await.with_tunnel_provider(tunnel.clone());
        let (app, dir) = register(&sup, AppType::Fastapi, interpreter("serving"), None).await;
        let app = sup
            .registry()
            .update_application(
                app.id,
                atlas_db::ApplicationUpdate {
                    tunnel_enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (sup, tunnel, app, dir)
    }

    #[tokio::test]
    async fn tunnel_follows_the_process_lifecycle() {
        let (sup, tunnel, app, _dir) = tunnelled(false).await;

        assert!(sup.start(app.id).await);
        let got = reload(&sup, app.id).await;
        let port = got.port.unwrap();
        let url = format!("https://tunnel.test/{port}");
        assert_eq!(got.tunnel_url.as_deref(), Some(url.as_str()));

        assert!(sup.stop(app.id).await);
        assert_eq!(reload(&sup, app.id).await.tunnel_url, None);
        assert_eq!(
            *tunnel.calls.lock().unwrap(),
            vec![format!("connect {port}"), format!("disconnect {url}")]
        );
    }

    #[tokio::test]
    async fn tunnel_failure_does_not_fail_start() {
        let (sup, _tunnel, app, _dir) = tunnelled(true).await;

        assert!(sup.start(app.id).await);
        let got = reload(&sup, app.id).await;
        assert_eq!(got.status, AppStatus::Running);
        assert_eq!(got.tunnel_url, None);
        assert!(messages(&sup, app.id).await.iter().any(|(level, m)| {
            *level == LogLevel::Error
                && m == "Failed to establish tunnel: tunnel service unreachable"
        }));
        assert!(sup.stop(app.id).await);
    }
}
