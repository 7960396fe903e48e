use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "schema_table")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub project_id: Uuid,
    pub data_source_id: Uuid,
    pub schema_name: String,
    pub table_name: String,
    /// "TABLE" or "VIEW"
    pub table_type: String,
    pub row_count: Option<i64>,
    /// Soft delete marker. Rows are never hard-deleted.
    pub deleted_at: Option<DateTime>,
    pub discovered_at: DateTime,
    pub updated_at: DateTime,
}

impl Model {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
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
    #[sea_orm(has_many = "super::schema_column::Entity")]
    SchemaColumn,
    #[sea_orm(has_one = "super::table_metadata::Entity")]
    TableMetadata,
}

impl Related<super::data_source::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSource.def()
    }
}

impl Related<super::schema_column::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SchemaColumn.def()
    }
}

impl Related<super::table_metadata::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TableMetadata.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
