use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "applications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub directory: String,
    pub main_file: String,
    pub app_type: String,
    pub port: Option<i32>,
    pub status: String,
    pub pid: Option<i32>,
    pub created_at: DateTimeUtc,
    pub environment_type: String,
    pub environment_path: Option<String>,
    pub tunnel_enabled: bool,
    pub tunnel_url: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::app_logs::Entity")]
    AppLogs,
}

impl Related<super::app_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AppLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
