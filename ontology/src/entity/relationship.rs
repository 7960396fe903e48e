use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "relationship")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub project_id: Uuid,
    pub data_source_id: Uuid,
    /// Referencing side.
    pub source_column_id: Uuid,
    /// Referenced side; always a primary-key or unique column.
    pub target_column_id: Uuid,
    /// "1:1", "N:1", "1:N", "N:M" or "unknown"
    pub cardinality: String,
    pub confidence: f64,
    /// "constraint" or "inferred"
    pub detection_method: String,
    pub matched_count: Option<i64>,
    pub orphan_count: Option<i64>,
    pub reasoning: Option<String>,
    /// Set when the candidate was evaluated and declined.
    pub rejection_reason: Option<String>,
    pub source_role: Option<String>,
    pub source: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Model {
    pub fn is_accepted(&self) -> bool {
        self.rejection_reason.is_none()
    }
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
    #[sea_orm(
        belongs_to = "super::schema_column::Entity",
        from = "Column::SourceColumnId",
        to = "super::schema_column::Column::Id",
        on_delete = "Cascade"
    )]
    SourceColumn,
    #[sea_orm(
        belongs_to = "super::schema_column::Entity",
        from = "Column::TargetColumnId",
        to = "super::schema_column::Column::Id",
        on_delete = "Cascade"
    )]
    TargetColumn,
}

impl Related<super::data_source::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSource.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
