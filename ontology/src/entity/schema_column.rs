use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "schema_column")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub schema_table_id: Uuid,
    pub column_name: String,
    pub ordinal_position: i32,
    /// Upstream type string (e.g. "character varying", "int4")
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    /// Single-column uniqueness (single-column primary key or UNIQUE constraint).
    pub is_unique: bool,
    pub distinct_count: Option<i64>,
    pub null_rate: Option<f64>,
    /// JSON array of up to `sample_limit` distinct values rendered as text.
    pub sample_values: Option<String>,
    pub deleted_at: Option<DateTime>,
    pub discovered_at: DateTime,
    pub updated_at: DateTime,
}

impl Model {
    pub fn samples(&self) -> Vec<String> {
        self.sample_values
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
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
    #[sea_orm(has_one = "super::column_metadata::Entity")]
    ColumnMetadata,
}

impl Related<super::schema_table::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SchemaTable.def()
    }
}

impl Related<super::column_metadata::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ColumnMetadata.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
