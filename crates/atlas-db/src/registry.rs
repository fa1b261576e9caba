//! Access layer over the application and log tables.
//!
//! Every mutation is a single statement (or one transaction for delete), so
//! concurrent callers never observe a half-applied record. Nothing here caches
//! rows; callers re-read on every operation.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use atlas_process::{AppId, AppStatus, AppType, Environment, LogLevel, ParseEnumError};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
    sea_query::Expr,
};

use crate::entities::{app_logs, applications};

pub const MIN_PORT: u16 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("application not found: {0}")]
    NotFound(AppId),
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("port {0} is already assigned to another application")]
    PortTaken(u16),
    #[error("corrupt application record {id}: {source}")]
    Corrupt {
        id: AppId,
        #[source]
        source: ParseEnumError,
    },
    #[error(transparent)]
    Db(#[from] DbErr),
}

impl RegistryError {
    fn validation(field: &'static str, message: impl Into<String>) -> Self {
        RegistryError::Validation {
            field,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: AppId,
    pub name: String,
    pub directory: PathBuf,
    pub main_file: String,
    pub app_type: AppType,
    pub port: Option<u16>,
    pub status: AppStatus,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub environment: Environment,
    pub tunnel_enabled: bool,
    pub tunnel_url: Option<String>,
}

impl Application {
    pub fn logs_dir(&self) -> PathBuf {
        self.directory.join("logs")
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.logs_dir().join("stdout.log")
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.logs_dir().join("stderr.log")
    }

    fn from_model(m: applications::Model) -> Result<Self> {
        let id = m.id;
        let corrupt = |source| RegistryError::Corrupt { id, source };
        Ok(Self {
            id,
            name: m.name,
            directory: PathBuf::from(m.directory),
            main_file: m.main_file,
            app_type: m.app_type.parse().map_err(corrupt)?,
            port: m.port.and_then(|p| u16::try_from(p).ok()),
            status: m.status.parse().map_err(corrupt)?,
            pid: m.pid.and_then(|p| u32::try_from(p).ok()),
            created_at: m.created_at,
            environment: Environment::from_parts(&m.environment_type, m.environment_path.as_deref())
                .map_err(corrupt)?,
            tunnel_enabled: m.tunnel_enabled,
            tunnel_url: m.tunnel_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: i32,
    pub application_id: AppId,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

impl LogEntry {
    fn from_model(m: app_logs::Model) -> Self {
        Self {
            id: m.id,
            application_id: m.application_id,
            timestamp: m.timestamp,
            // Unknown levels written by older tooling are surfaced as info.
            level: m.level.parse().unwrap_or(LogLevel::Info),
            message: m.message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewApplication {
    pub name: String,
    pub directory: PathBuf,
    pub main_file: String,
    pub app_type: AppType,
    pub port: Option<u16>,
    pub environment: Environment,
    pub tunnel_enabled: bool,
}

impl NewApplication {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::validation("name", "must not be empty"));
        }
        validate_location(&self.directory, &self.main_file)?;
        if let Some(port) = self.port {
            validate_port(port)?;
        }
        Ok(())
    }
}

/// Partial update. `None` leaves a field untouched; `port: Some(None)` clears the port.
#[derive(Debug, Clone, Default)]
pub struct ApplicationUpdate {
    pub name: Option<String>,
    pub directory: Option<PathBuf>,
    pub main_file: Option<String>,
    pub app_type: Option<AppType>,
    pub port: Option<Option<u16>>,
    pub environment: Option<Environment>,
    pub tunnel_enabled: Option<bool>,
}

fn validate_location(directory: &Path, main_file: &str) -> Result<()> {
    if !directory.is_dir() {
        return Err(RegistryError::validation(
            "directory",
            format!("{} does not exist", directory.display()),
        ));
    }
    let rel = Path::new(main_file);
    if main_file.trim().is_empty() || rel.is_absolute() {
        return Err(RegistryError::validation(
            "main_file",
            "must be a path relative to the application directory",
        ));
    }
    if !directory.join(rel).is_file() {
        return Err(RegistryError::validation(
            "main_file",
            format!("{main_file} does not exist in {}", directory.display()),
        ));
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<()> {
    if port < MIN_PORT {
        return Err(RegistryError::validation(
            "port",
            format!("must be between {MIN_PORT} and 65535 (got {port})"),
        ));
    }
    Ok(())
}

fn map_port_conflict(err: DbErr, port: Option<u16>) -> RegistryError {
    match (err.sql_err(), port) {
        (Some(SqlErr::UniqueConstraintViolation(_)), Some(port)) => RegistryError::PortTaken(port),
        _ => RegistryError::Db(err),
    }
}

fn pid_column(pid: u32) -> Result<i32> {
    i32::try_from(pid).map_err(|_| RegistryError::validation("pid", format!("out of range: {pid}")))
}

#[derive(Clone)]
pub struct Registry {
    db: Arc<DatabaseConnection>,
}

impl Registry {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create_application(&self, new: NewApplication) -> Result<Application> {
        new.validate()?;
        if let Some(port) = new.port
            && self.is_port_assigned(port, None).await?
        {
            return Err(RegistryError::PortTaken(port));
        }

        let model = applications::ActiveModel {
            name: Set(new.name.trim().to_string()),
            directory: Set(new.directory.display().to_string()),
            main_file: Set(new.main_file),
            app_type: Set(new.app_type.as_str().to_string()),
            port: Set(new.port.map(i32::from)),
            status: Set(AppStatus::Stopped.as_str().to_string()),
            pid: Set(None),
            created_at: Set(Utc::now()),
            environment_type: Set(new.environment.kind().to_string()),
            environment_path: Set(new.environment.path().map(|p| p.display().to_string())),
            tunnel_enabled: Set(new.tunnel_enabled),
            tunnel_url: Set(None),
            ..Default::default()
        };
        let inserted = model
            .insert(&*self.db)
            .await
            .map_err(|e| map_port_conflict(e, new.port))?;
        let app = Application::from_model(inserted)?;
        self.append_log(app.id, LogLevel::Info, "Application created").await?;
        Ok(app)
    }

    pub async fn list_applications(&self) -> Result<Vec<Application>> {
        applications::Entity::find()
            .order_by_asc(applications::Column::Id)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(Application::from_model)
            .collect()
    }

    pub async fn get_application(&self, id: AppId) -> Result<Option<Application>> {
        applications::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(Application::from_model)
            .transpose()
    }

    pub async fn update_application(
        &self,
        id: AppId,
        update: ApplicationUpdate,
    ) -> Result<Application> {
        let current = applications::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        let directory = update
            .directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(&current.directory));
        let main_file = update
            .main_file
            .clone()
            .unwrap_or_else(|| current.main_file.clone());
        if update.directory.is_some() || update.main_file.is_some() {
            validate_location(&directory, &main_file)?;
        }
        if let Some(Some(port)) = update.port {
            validate_port(port)?;
            if self.is_port_assigned(port, Some(id)).await? {
                return Err(RegistryError::PortTaken(port));
            }
        }

        let mut active = current.into_active_model();
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(RegistryError::validation("name", "must not be empty"));
            }
            active.name = Set(name.trim().to_string());
        }
        if update.directory.is_some() {
            active.directory = Set(directory.display().to_string());
        }
        if update.main_file.is_some() {
            active.main_file = Set(main_file);
        }
        if let Some(app_type) = update.app_type {
            active.app_type = Set(app_type.as_str().to_string());
        }
        if let Some(port) = update.port {
            active.port = Set(port.map(i32::from));
        }
        if let Some(env) = update.environment {
            active.environment_type = Set(env.kind().to_string());
            active.environment_path = Set(env.path().map(|p| p.display().to_string()));
        }
        if let Some(enabled) = update.tunnel_enabled {
            active.tunnel_enabled = Set(enabled);
        }

        let updated = active
            .update(&*self.db)
            .await
            .map_err(|e| map_port_conflict(e, update.port.flatten()))?;
        Application::from_model(updated)
    }

    /// Removes the record and its log entries. Returns `false` if it did not exist.
    pub async fn delete_application(&self, id: AppId) -> Result<bool> {
        let txn = self.db.begin().await?;
        app_logs::Entity::delete_many()
            .filter(app_logs::Column::ApplicationId.eq(id))
            .exec(&txn)
            .await?;
        let res = applications::Entity::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;
        if res.rows_affected > 0 {
            tracing::debug!(app_id = id, "application record deleted");
        }
        Ok(res.rows_affected > 0)
    }

    pub async fn is_port_assigned(&self, port: u16, exclude: Option<AppId>) -> Result<bool> {
        let mut query =
            applications::Entity::find().filter(applications::Column::Port.eq(i32::from(port)));
        if let Some(id) = exclude {
            query = query.filter(applications::Column::Id.ne(id));
        }
        Ok(query.count(&*self.db).await? > 0)
    }

    /// Ports recorded against any application other than `exclude`.
    pub async fn assigned_ports(&self, exclude: Option<AppId>) -> Result<HashSet<u16>> {
        let mut query = applications::Entity::find()
            .select_only()
            .column(applications::Column::Port)
            .filter(applications::Column::Port.is_not_null());
        if let Some(id) = exclude {
            query = query.filter(applications::Column::Id.ne(id));
        }
        let ports: Vec<Option<i32>> = query.into_tuple().all(&*self.db).await?;
        Ok(ports
            .into_iter()
            .flatten()
            .filter_map(|p| u16::try_from(p).ok())
            .collect())
    }

    async fn update_columns(
        &self,
        id: AppId,
        columns: Vec<(applications::Column, sea_orm::Value)>,
    ) -> std::result::Result<(), DbErr> {
        let mut update = applications::Entity::update_many();
        for (col, value) in columns {
            update = update.col_expr(col, Expr::value(value));
        }
        let res = update
            .filter(applications::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(DbErr::RecordNotUpdated);
        }
        Ok(())
    }

    async fn update_or_not_found(
        &self,
        id: AppId,
        columns: Vec<(applications::Column, sea_orm::Value)>,
    ) -> Result<()> {
        match self.update_columns(id, columns).await {
            Ok(()) => Ok(()),
            Err(DbErr::RecordNotUpdated) => Err(RegistryError::NotFound(id)),
            Err(e) => Err(RegistryError::Db(e)),
        }
    }

    pub async fn set_port(&self, id: AppId, port: Option<u16>) -> Result<()> {
        if let Some(port) = port {
            validate_port(port)?;
        }
        match self
            .update_columns(id, vec![(applications::Column::Port, port.map(i32::from).into())])
            .await
        {
            Ok(()) => Ok(()),
            Err(DbErr::RecordNotUpdated) => Err(RegistryError::NotFound(id)),
            Err(e) => Err(map_port_conflict(e, port)),
        }
    }

    /// Records a live process. Status and pid change together.
    pub async fn mark_running(&self, id: AppId, pid: u32) -> Result<()> {
        let pid = pid_column(pid)?;
        self.update_or_not_found(
            id,
            vec![
                (applications::Column::Status, AppStatus::Running.as_str().into()),
                (applications::Column::Pid, Some(pid).into()),
            ],
        )
        .await
    }

    pub async fn mark_stopped(&self, id: AppId) -> Result<()> {
        self.mark_not_running(id, AppStatus::Stopped).await
    }

    pub async fn mark_error(&self, id: AppId) -> Result<()> {
        self.mark_not_running(id, AppStatus::Error).await
    }

    async fn mark_not_running(&self, id: AppId, status: AppStatus) -> Result<()> {
        self.update_or_not_found(
            id,
            vec![
                (applications::Column::Status, status.as_str().into()),
                (applications::Column::Pid, Option::<i32>::None.into()),
            ],
        )
        .await
    }

    pub async fn set_tunnel_url(&self, id: AppId, url: Option<String>) -> Result<()> {
        self.update_or_not_found(id, vec![(applications::Column::TunnelUrl, url.into())])
            .await
    }

    pub async fn append_log(
        &self,
        id: AppId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<LogEntry> {
        let model = app_logs::ActiveModel {
            application_id: Set(id),
            timestamp: Set(Utc::now()),
            message: Set(message.into()),
            level: Set(level.as_str().to_string()),
            ..Default::default()
        };
        let inserted = model.insert(&*self.db).await?;
        Ok(LogEntry::from_model(inserted))
    }

    /// Newest first.
    pub async fn recent_logs(&self, id: AppId, limit: u64) -> Result<Vec<LogEntry>> {
        let rows = app_logs::Entity::find()
            .filter(app_logs::Column::ApplicationId.eq(id))
            .order_by_desc(app_logs::Column::Timestamp)
            .order_by_desc(app_logs::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(LogEntry::from_model).collect())
    }
}
