use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "column_metadata")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub schema_column_id: Uuid,
    pub purpose: Option<String>,
    /// Column role, see `model::ColumnRole`.
    pub role: Option<String>,
    pub semantic_type: Option<String>,
    /// JSON array of strings
    pub enum_values: Option<String>,
    /// JSON array of strings
    pub synonyms: Option<String>,
    pub fk_target_column_id: Option<Uuid>,
    pub fk_confidence: Option<f64>,
    pub description: Option<String>,
    /// Provenance: "manual", "agent" or "inferred"
    pub source: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Model {
    pub fn enum_value_list(&self) -> Vec<String> {
        self.enum_values
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::schema_column::Entity",
        from = "Column::SchemaColumnId",
        to = "super::schema_column::Column::Id",
        on_delete = "Cascade"
    )]
    SchemaColumn,
}

impl Related<super::schema_column::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SchemaColumn.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
