use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "run_stage")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage: String,
    pub ordinal: i32,
    /// "pending", "running", "completed", "degraded", "failed" or "skipped"
    pub status: String,
    pub done: i64,
    pub total: i64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime>,
    pub completed_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::pipeline_run::Entity",
        from = "Column::RunId",
        to = "super::pipeline_run::Column::Id",
        on_delete = "Cascade"
    )]
    PipelineRun,
}

impl Related<super::pipeline_run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PipelineRun.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
