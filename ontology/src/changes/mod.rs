//! Pending changes: detected drift waiting for review, and the store that
//! keeps them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datasource::{ColumnRef, TableRef};
use crate::entity::pending_change;
use crate::error::OntologyError;
use crate::model::{Cardinality, ChangeStatus, ChangeType};

pub mod detector;
pub mod store;

pub use detector::ChangeDetector;
pub use store::SeaOrmChangeStore;

/// Suggested action carried by a pending change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangePayload {
    NewTable {
        table: TableRef,
        table_type: String,
    },
    NewColumn {
        column: ColumnRef,
        data_type: String,
    },
    DroppedTable {
        table_id: Uuid,
        table: TableRef,
    },
    DroppedColumn {
        column_id: Uuid,
        column: ColumnRef,
    },
    ModifiedColumn {
        column_id: Uuid,
        old_type: String,
        new_type: String,
    },
    NewEnumValues {
        column_id: Uuid,
        /// Values outside the recorded set.
        values: Vec<String>,
    },
    PotentialEnum {
        column_id: Uuid,
        values: Vec<String>,
    },
    NewFkPattern {
        source_column_id: Uuid,
        target_column_id: Uuid,
        source: ColumnRef,
        target: ColumnRef,
        matched_count: i64,
        overlap: f64,
    },
    CardinalityChange {
        relationship_id: Uuid,
        old: Cardinality,
        new: Cardinality,
    },
}

impl ChangePayload {
    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangePayload::NewTable { .. } => ChangeType::NewTable,
            ChangePayload::NewColumn { .. } => ChangeType::NewColumn,
            ChangePayload::DroppedTable { .. } => ChangeType::DroppedTable,
            ChangePayload::DroppedColumn { .. } => ChangeType::DroppedColumn,
            ChangePayload::ModifiedColumn { .. } => ChangeType::ModifiedColumn,
            ChangePayload::NewEnumValues { .. } => ChangeType::NewEnumValues,
            ChangePayload::PotentialEnum { .. } => ChangeType::PotentialEnum,
            ChangePayload::NewFkPattern { .. } => ChangeType::NewFkPattern,
            ChangePayload::CardinalityChange { .. } => ChangeType::CardinalityChange,
        }
    }

    pub fn to_json(&self) -> Result<String, OntologyError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_model(model: &pending_change::Model) -> Result<Self, OntologyError> {
        Ok(serde_json::from_str(&model.payload)?)
    }
}

#[derive(Debug, Clone)]
pub struct NewChange {
    pub project_id: Uuid,
    pub data_source_id: Uuid,
    /// Qualified name of the affected object.
    pub target: String,
    pub payload: ChangePayload,
}

#[async_trait::async_trait]
pub trait PendingChangeStore: Send + Sync {
    /// Insert a change. Auto-applied types are stored resolved.
    async fn create(&self, change: NewChange) -> Result<pending_change::Model, OntologyError>;

    async fn list_pending(
        &self,
        project_id: Uuid,
        data_source_id: Option<Uuid>,
    ) -> Result<Vec<pending_change::Model>, OntologyError>;

    /// Review transition: only pending changes may be approved or rejected.
    async fn update_status(
        &self,
        id: Uuid,
        status: ChangeStatus,
        reviewed_by: &str,
    ) -> Result<pending_change::Model, OntologyError>;

    async fn get(&self, id: Uuid) -> Result<Option<pending_change::Model>, OntologyError>;

    /// Approved and not yet resolved, oldest first.
    async fn list_approved(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
    ) -> Result<Vec<pending_change::Model>, OntologyError>;

    /// Every entry ever recorded for (project, data source, change type, target).
    async fn find_for_target(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        change_type: ChangeType,
        target: &str,
    ) -> Result<Vec<pending_change::Model>, OntologyError>;

    /// An open (pending, or approved and unresolved) entry, if any.
    async fn find_open(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        change_type: ChangeType,
        target: &str,
    ) -> Result<Option<pending_change::Model>, OntologyError> {
        Ok(self
            .find_for_target(project_id, data_source_id, change_type, target)
            .await?
            .into_iter()
            .find(is_open))
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<(), OntologyError>;

    async fn record_error(&self, id: Uuid, error: &str) -> Result<(), OntologyError>;
}

pub fn is_open(model: &pending_change::Model) -> bool {
    model.status == ChangeStatus::Pending.as_str()
        || (model.status == ChangeStatus::Approved.as_str() && model.resolved_at.is_none())
}

/// Whether a change with `payload_json` would repeat what `history` already
/// records: an open entry, or a rejection of the identical suggestion.
pub fn is_duplicate(history: &[pending_change::Model], payload_json: &str) -> bool {
    history.iter().any(|m| {
        is_open(m) || (m.status == ChangeStatus::Rejected.as_str() && m.payload == payload_json)
    })
}
