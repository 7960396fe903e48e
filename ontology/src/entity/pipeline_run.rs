use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pipeline_run")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub project_id: Uuid,
    pub data_source_id: Uuid,
    /// "running", "completed" or "failed"
    pub status: String,
    pub current_stage: Option<String>,
    /// Completed, but at least one stage degraded.
    pub degraded: bool,
    /// "running" while in flight, None afterwards. Unique per (project, data source).
    pub active_slot: Option<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime,
    pub completed_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::data_source::Entity",
        from = "Column::DataSourceId",
        to = "super::data_source::Column::Id",
        on_delete = "Cascade"
    )]
    DataSource,
    #[sea_orm(has_many = "super::run_stage::Entity")]
    RunStage,
}

impl Related<super::data_source::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSource.def()
    }
}

impl Related<super::run_stage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RunStage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
