use sea_orm_migration::prelude::*;

pub use sea_orm_migration::MigratorTrait;

mod m0001_create_applications;
mod m0002_create_app_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_applications::Migration),
            Box::new(m0002_create_app_logs::Migration),
        ]
    }
}
