use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pending_change")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub project_id: Uuid,
    pub data_source_id: Uuid,
    pub change_type: String,
    /// Qualified target, e.g. "public.orders" or "public.orders.customer_id".
    pub target: String,
    /// JSON text of `changes::ChangePayload`.
    pub payload: String,
    /// "pending", "approved", "rejected" or "auto_applied"
    pub status: String,
    pub reviewed_by: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub resolved_at: Option<DateTime>,
    /// "open" while pending or approved and unresolved, NULL once closed.
    pub open_slot: Option<String>,
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
}

impl Related<super::data_source::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSource.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
