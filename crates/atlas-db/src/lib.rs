pub use sea_orm;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;
pub mod registry;

pub use registry::{
    Application, ApplicationUpdate, LogEntry, NewApplication, Registry, RegistryError,
};

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_string());
    opts.sqlx_logging(false);
    tracing::debug!(url = database_url, "connecting to registry database");
    Database::connect(opts).await
}
