use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Applications::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Applications::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Applications::Name).string().not_null())
                    .col(ColumnDef::new(Applications::Directory).string().not_null())
                    .col(ColumnDef::new(Applications::MainFile).string().not_null())
                    .col(ColumnDef::new(Applications::AppType).string().not_null())
                    .col(ColumnDef::new(Applications::Port).integer().null())
                    .col(
                        ColumnDef::new(Applications::Status)
                            .string()
                            .not_null()
                            .default("stopped"),
                    )
                    .col(ColumnDef::new(Applications::Pid).integer().null())
                    .col(
                        ColumnDef::new(Applications::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Applications::EnvironmentType)
                            .string()
                            .not_null()
                            .default("system"),
                    )
                    .col(ColumnDef::new(Applications::EnvironmentPath).string().null())
                    .col(
                        ColumnDef::new(Applications::TunnelEnabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Applications::TunnelUrl).string().null())
                    .to_owned(),
            )
            .await?;

        // NULL ports never collide, so unassigned applications are unaffected.
        manager
            .create_index(
                Index::create()
                    .name("idx_applications_port_unique")
                    .table(Applications::Table)
                    .col(Applications::Port)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_applications_name")
                    .table(Applications::Table)
                    .col(Applications::Name)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_applications_name")
                    .table(Applications::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_applications_port_unique")
                    .table(Applications::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Applications::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Applications {
    Table,
    Id,
    Name,
    Directory,
    MainFile,
    AppType,
    Port,
    Status,
    Pid,
    CreatedAt,
    EnvironmentType,
    EnvironmentPath,
    TunnelEnabled,
    TunnelUrl,
}
