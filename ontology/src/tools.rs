//! Write operations for external callers (agents, operators). Objects are
//! addressed by qualified name; every write goes through the precedence
//! check, so an agent edit never replaces a manual one.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::changes::PendingChangeStore;
use crate::datasource::{ColumnRef, TableRef};
use crate::entity::pending_change;
use crate::error::OntologyError;
use crate::model::{Cardinality, ChangeStatus};
use crate::precedence::{self, ColumnPatch, TablePatch, WriteOutcome, Writer};
use crate::relationships::{self, candidates};

pub struct Tools {
    db: DatabaseConnection,
    store: Arc<dyn PendingChangeStore>,
}

fn parse_column(name: &str) -> Result<ColumnRef, OntologyError> {
    ColumnRef::parse(name)
        .ok_or_else(|| OntologyError::Validation(format!("expected schema.table.column, got {name:?}")))
}

fn parse_table(name: &str) -> Result<TableRef, OntologyError> {
    TableRef::parse(name).ok_or_else(|| OntologyError::Validation(format!("expected schema.table, got {name:?}")))
}

fn resolve_column(catalog: &Catalog, name: &str) -> Result<(Uuid, bool), OntologyError> {
    let column = parse_column(name)?;
    catalog
        .find_column(&column)
        .map(|(_, c)| (c.id, candidates::is_target(c)))
        .ok_or_else(|| OntologyError::NotFound(format!("column {name}")))
}

impl Tools {
    pub fn new(db: DatabaseConnection, store: Arc<dyn PendingChangeStore>) -> Self {
        Self { db, store }
    }

    pub async fn update_column(
        &self,
        data_source_id: Uuid,
        column: &str,
        patch: &ColumnPatch,
        writer: &Writer,
    ) -> Result<WriteOutcome, OntologyError> {
        if patch.is_empty() {
            return Err(OntologyError::Validation("nothing to update".to_string()));
        }
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let (column_id, _) = resolve_column(&catalog, column)?;
        let outcome = precedence::write_column_metadata(&self.db, column_id, patch, writer).await?;
        tracing::info!(column = %column, writer = %writer.actor, ?outcome, "update_column");
        Ok(outcome)
    }

    pub async fn update_table(
        &self,
        data_source_id: Uuid,
        table: &str,
        patch: &TablePatch,
        writer: &Writer,
    ) -> Result<WriteOutcome, OntologyError> {
        let table_ref = parse_table(table)?;
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let table_id = catalog
            .find_table(&table_ref)
            .map(|t| t.table.id)
            .ok_or_else(|| OntologyError::NotFound(format!("table {table}")))?;
        let outcome = precedence::write_table_metadata(&self.db, table_id, patch, writer).await?;
        tracing::info!(table = %table, writer = %writer.actor, ?outcome, "update_table");
        Ok(outcome)
    }

    /// Declare `source -> target`. The target must be a primary-key or
    /// unique column.
    pub async fn create_relationship(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        source: &str,
        target: &str,
        cardinality: Option<Cardinality>,
        writer: &Writer,
    ) -> Result<WriteOutcome, OntologyError> {
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let (source_id, _) = resolve_column(&catalog, source)?;
        let (target_id, target_unique) = resolve_column(&catalog, target)?;
        if source_id == target_id {
            return Err(OntologyError::Validation("a column cannot reference itself".to_string()));
        }
        if !target_unique {
            return Err(OntologyError::Validation(format!(
                "{target} is not a primary-key or unique column"
            )));
        }
        let reasoning = format!("declared by {}", writer.actor);
        let outcome = relationships::record_declared(
            &self.db,
            project_id,
            data_source_id,
            source_id,
            target_id,
            cardinality.unwrap_or(Cardinality::ManyToOne),
            &reasoning,
            writer,
        )
        .await?;
        tracing::info!(source = %source, target = %target, writer = %writer.actor, ?outcome, "create_relationship");
        Ok(outcome)
    }

    pub async fn approve_change(&self, id: Uuid, reviewer: &str) -> Result<pending_change::Model, OntologyError> {
        self.store.update_status(id, ChangeStatus::Approved, reviewer).await
    }

    pub async fn reject_change(&self, id: Uuid, reviewer: &str) -> Result<pending_change::Model, OntologyError> {
        self.store.update_status(id, ChangeStatus::Rejected, reviewer).await
    }
}
