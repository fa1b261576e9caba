use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AppLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AppLogs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AppLogs::ApplicationId).integer().not_null())
                    .col(
                        ColumnDef::new(AppLogs::Timestamp)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(AppLogs::Message).text().not_null())
                    .col(
                        ColumnDef::new(AppLogs::Level)
                            .string()
                            .not_null()
                            .default("info"),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_app_logs_application")
                            .from(AppLogs::Table, AppLogs::ApplicationId)
                            .to(Applications::Table, Applications::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_app_logs_application_timestamp")
                    .table(AppLogs::Table)
                    .col(AppLogs::ApplicationId)
                    .col(AppLogs::Timestamp)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_app_logs_application_timestamp")
                    .table(AppLogs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(AppLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Applications {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum AppLogs {
    Table,
    Id,
    ApplicationId,
    Timestamp,
    Message,
    Level,
}
