use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "data_source")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub ds_type: String,
    /// JSON text: non-secret connection params (host, port, database, username, sslmode, schemas)
    pub config: String,
    /// AES-256-GCM encrypted base64: secret params (password)
    pub secure_config: String,
    pub last_build_at: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::schema_table::Entity")]
    SchemaTable,
    #[sea_orm(has_many = "super::pending_change::Entity")]
    PendingChange,
    #[sea_orm(has_many = "super::pipeline_run::Entity")]
    PipelineRun,
}

impl Related<super::schema_table::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SchemaTable.def()
    }
}

impl Related<super::pending_change::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PendingChange.def()
    }
}

impl Related<super::pipeline_run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PipelineRun.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
