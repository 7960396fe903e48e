use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use super::{NewChange, PendingChangeStore};
use crate::entity::pending_change;
use crate::error::{OntologyError, is_unique_violation};
use crate::model::{ChangeStatus, ChangeType};

const OPEN_SLOT: &str = "open";

/// Pending change store on the metadata database.
#[derive(Clone)]
pub struct SeaOrmChangeStore {
    db: DatabaseConnection,
}

impl SeaOrmChangeStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn require(&self, id: Uuid) -> Result<pending_change::Model, OntologyError> {
        pending_change::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| OntologyError::NotFound(format!("pending change {id}")))
    }
}

#[async_trait::async_trait]
impl PendingChangeStore for SeaOrmChangeStore {
    async fn create(&self, change: NewChange) -> Result<pending_change::Model, OntologyError> {
        let now = Utc::now().naive_utc();
        let change_type = change.payload.change_type();
        let auto = change_type.is_auto_applied();
        let status = if auto {
            ChangeStatus::AutoApplied
        } else {
            ChangeStatus::Pending
        };

        let inserted = pending_change::ActiveModel {
            id: Set(Uuid::now_v7()),
            project_id: Set(change.project_id),
            data_source_id: Set(change.data_source_id),
            change_type: Set(change_type.as_str().to_string()),
            target: Set(change.target.clone()),
            payload: Set(change.payload.to_json()?),
            status: Set(status.as_str().to_string()),
            reviewed_by: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            resolved_at: Set(auto.then_some(now)),
            open_slot: Set((!auto).then(|| OPEN_SLOT.to_string())),
        }
        .insert(&self.db)
        .await;

        let model = match inserted {
            Ok(model) => model,
            Err(e) if is_unique_violation(&e) => {
                return Err(OntologyError::Conflict(format!(
                    "an open {change_type} change already exists for {}",
                    change.target
                )));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            change_id = %model.id,
            change_type = %model.change_type,
            target = %model.target,
            status = %model.status,
            "Recorded pending change"
        );
        Ok(model)
    }

    async fn list_pending(
        &self,
        project_id: Uuid,
        data_source_id: Option<Uuid>,
    ) -> Result<Vec<pending_change::Model>, OntologyError> {
        let mut query = pending_change::Entity::find()
            .filter(pending_change::Column::ProjectId.eq(project_id))
            .filter(pending_change::Column::Status.eq(ChangeStatus::Pending.as_str()));
        if let Some(ds) = data_source_id {
            query = query.filter(pending_change::Column::DataSourceId.eq(ds));
        }
        Ok(query
            .order_by_asc(pending_change::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ChangeStatus,
        reviewed_by: &str,
    ) -> Result<pending_change::Model, OntologyError> {
        let current = self.require(id).await?;
        if current.status != ChangeStatus::Pending.as_str() {
            return Err(OntologyError::Validation(format!(
                "change {id} is {}, only pending changes can be reviewed",
                current.status
            )));
        }
        if !matches!(status, ChangeStatus::Approved | ChangeStatus::Rejected) {
            return Err(OntologyError::Validation(format!(
                "cannot set change status to {status}"
            )));
        }

        let now = Utc::now().naive_utc();
        let mut active: pending_change::ActiveModel = current.into();
        active.status = Set(status.as_str().to_string());
        active.reviewed_by = Set(Some(reviewed_by.to_string()));
        active.updated_at = Set(now);
        if status == ChangeStatus::Rejected {
            active.resolved_at = Set(Some(now));
            active.open_slot = Set(None);
        }
        Ok(active.update(&self.db).await?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<pending_change::Model>, OntologyError> {
        Ok(pending_change::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn list_approved(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
    ) -> Result<Vec<pending_change::Model>, OntologyError> {
        Ok(pending_change::Entity::find()
            .filter(pending_change::Column::ProjectId.eq(project_id))
            .filter(pending_change::Column::DataSourceId.eq(data_source_id))
            .filter(pending_change::Column::Status.eq(ChangeStatus::Approved.as_str()))
            .filter(pending_change::Column::ResolvedAt.is_null())
            .order_by_asc(pending_change::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    async fn find_for_target(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        change_type: ChangeType,
        target: &str,
    ) -> Result<Vec<pending_change::Model>, OntologyError> {
        Ok(pending_change::Entity::find()
            .filter(pending_change::Column::ProjectId.eq(project_id))
            .filter(pending_change::Column::DataSourceId.eq(data_source_id))
            .filter(pending_change::Column::ChangeType.eq(change_type.as_str()))
            .filter(pending_change::Column::Target.eq(target))
            .all(&self.db)
            .await?)
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<(), OntologyError> {
        let current = self.require(id).await?;
        let now = Utc::now().naive_utc();
        let mut active: pending_change::ActiveModel = current.into();
        active.resolved_at = Set(Some(now));
        active.open_slot = Set(None);
        active.error = Set(None);
        active.updated_at = Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn record_error(&self, id: Uuid, error: &str) -> Result<(), OntologyError> {
        let current = self.require(id).await?;
        let mut active: pending_change::ActiveModel = current.into();
        active.error = Set(Some(error.to_string()));
        active.updated_at = Set(Utc::now().naive_utc());
        active.update(&self.db).await?;
        Ok(())
    }
}
