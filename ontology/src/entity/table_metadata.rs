use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "table_metadata")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub schema_table_id: Uuid,
    pub entity_name: Option<String>,
    /// "fact", "dimension", "junction", "reference", ...
    pub table_role: Option<String>,
    pub description: Option<String>,
    /// JSON array of strings
    pub synonyms: Option<String>,
    /// Provenance: "manual", "agent" or "inferred"
    pub source: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::schema_table::Entity",
        from = "Column::SchemaTableId",
        to = "super::schema_table::Column::Id",
        on_delete = "Cascade"
    )]
    SchemaTable,
}

impl Related<super::schema_table::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SchemaTable.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
